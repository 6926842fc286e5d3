//! systemd service install/uninstall

use crate::{exec, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default unit directory
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Unit name
pub const UNIT_NAME: &str = "sase-shaper.service";

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes and registers the service unit
#[derive(Debug, Clone)]
pub struct ServiceInstaller {
    binary: PathBuf,
    config_path: PathBuf,
    unit_dir: PathBuf,
    systemctl: String,
}

impl ServiceInstaller {
    /// Installer for `binary` started with `--config config_path`
    pub fn new(binary: PathBuf, config_path: PathBuf, unit_dir: PathBuf) -> Self {
        Self { binary, config_path, unit_dir, systemctl: "systemctl".into() }
    }

    /// Use a different `systemctl`
    pub fn with_systemctl(mut self, program: impl Into<String>) -> Self {
        self.systemctl = program.into();
        self
    }

    /// Unit file path
    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(UNIT_NAME)
    }

    /// Unit content: `run` configures from persisted state itself, then
    /// runs until stopped
    pub fn render(&self) -> String {
        let bin = self.binary.display();
        let cfg = self.config_path.display();
        format!(
            r#"[Unit]
Description=OpenSASE adaptive WAN shaper
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
ExecStart={bin} --config {cfg} run
Restart=on-failure
RestartSec=10
KillMode=mixed

StandardOutput=journal
StandardError=journal
SyslogIdentifier=sase-shaper

[Install]
WantedBy=multi-user.target
"#
        )
    }

    /// Write the unit, reload systemd, and enable it now
    pub async fn install(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.unit_dir)?;
        let path = self.unit_path();
        fs::write(&path, self.render())?;
        tracing::info!("Wrote {}", path.display());

        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl(&["enable", "--now", UNIT_NAME]).await?;
        Ok(path)
    }

    /// Disable the unit, remove it, reload systemd
    pub async fn uninstall(&self) -> Result<()> {
        // Unit may never have been enabled
        if let Err(e) = self.systemctl(&["disable", "--now", UNIT_NAME]).await {
            tracing::warn!("Disable failed: {}", e);
        }
        remove_if_present(&self.unit_path())?;
        self.systemctl(&["daemon-reload"]).await
    }

    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        exec::run(&self.systemctl, args, None, SYSTEMCTL_TIMEOUT)
            .await?
            .check(&self.systemctl)
            .map(|_| ())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::info!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installer(dir: &Path, systemctl: &str) -> ServiceInstaller {
        ServiceInstaller::new(
            PathBuf::from("/usr/local/bin/sase-shaper"),
            PathBuf::from("/etc/opensase/shaper.toml"),
            dir.join("units"),
        )
        .with_systemctl(systemctl)
    }

    #[test]
    fn test_unit_starts_daemon_only() {
        let unit = installer(Path::new("/tmp"), "systemctl").render();
        assert!(unit.contains("[Service]"));
        assert!(!unit.contains("ExecStartPre"));
        assert!(unit.contains("ExecStart=/usr/local/bin/sase-shaper --config /etc/opensase/shaper.toml run"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[tokio::test]
    async fn test_install_then_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path(), "true");
        let path = installer.install().await.unwrap();
        assert!(path.exists());
        installer.uninstall().await.unwrap();
        assert!(!path.exists());
        // Second uninstall is a no-op
        installer.uninstall().await.unwrap();
    }

    #[tokio::test]
    async fn test_install_reports_systemctl_failure() {
        let dir = tempfile::tempdir().unwrap();
        assert!(installer(dir.path(), "false").install().await.is_err());
    }
}
