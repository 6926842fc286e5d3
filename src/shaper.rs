//! Traffic Shaper
//!
//! Upload is shaped by a CAKE root qdisc on the WAN egress. Download is shaped
//! on an IFB device fed by an ingress `mirred` redirect from the WAN.

use crate::config::{LinkConfig, ProfileConfig, QdiscConfig};
use crate::state::StateStore;
use crate::{exec, Mode, RatePair, Result, ShaperError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Aggregate queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QdiscStats {
    /// Packets dropped since the qdisc was created
    pub dropped_packets: u64,
    /// Bytes currently queued
    pub backlog_bytes: u64,
}

impl QdiscStats {
    /// Combine two devices
    pub fn merge(self, other: QdiscStats) -> QdiscStats {
        QdiscStats {
            dropped_packets: self.dropped_packets + other.dropped_packets,
            backlog_bytes: self.backlog_bytes + other.backlog_bytes,
        }
    }
}

/// Traffic shaping subsystem
#[async_trait]
pub trait TrafficShaper: Send + Sync {
    /// Full setup: devices, redirect, qdiscs with queueing options
    async fn configure(&self, rates: RatePair) -> Result<()>;

    /// Rewrite download/upload only
    async fn set_rates(&self, rates: RatePair) -> Result<()>;

    /// Aggregate drop/backlog statistics
    async fn stats(&self) -> Result<QdiscStats>;

    /// Whether the control interface exists on this host
    async fn available(&self) -> bool;
}

/// `tc`-driven CAKE shaper
pub struct CakeShaper {
    link: LinkConfig,
    qdisc: QdiscConfig,
}

impl CakeShaper {
    /// Create a shaper for the configured link
    pub fn new(link: LinkConfig, qdisc: QdiscConfig) -> Self {
        Self { link, qdisc }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.qdisc.command_timeout_secs)
    }

    async fn tc(&self, args: &[&str]) -> Result<String> {
        let out = exec::run(&self.qdisc.tc_binary, args, None, self.timeout()).await?;
        Ok(out.check(&self.qdisc.tc_binary)?.stdout)
    }

    async fn ip(&self, args: &[&str]) -> Result<exec::CommandOutput> {
        exec::run(&self.qdisc.ip_binary, args, None, self.timeout()).await
    }

    async fn cake(&self, verb: &str, dev: &str, kbit: u64, options: &[String]) -> Result<()> {
        let bandwidth = format!("{}kbit", kbit);
        let mut args = vec!["qdisc", verb, "dev", dev, "root", "cake", "bandwidth", bandwidth.as_str()];
        args.extend(options.iter().map(String::as_str));
        self.tc(&args).await.map(|_| ())
    }

    async fn device_stats(&self, dev: &str) -> Result<QdiscStats> {
        let out = self.tc(&["-s", "qdisc", "show", "dev", dev]).await?;
        Ok(parse_tc_stats(&out))
    }
}

#[async_trait]
impl TrafficShaper for CakeShaper {
    async fn configure(&self, rates: RatePair) -> Result<()> {
        let wan = self.link.wan_interface.as_str();
        let ifb = self.link.ifb_interface.as_str();
        tracing::info!("Configuring CAKE on {} (ingress via {}) at {}", wan, ifb, rates);

        // Exists already on re-runs
        let _ = self.ip(&["link", "add", "name", ifb, "type", "ifb"]).await?;
        self.ip(&["link", "set", "dev", ifb, "up"]).await?.check(&self.qdisc.ip_binary)?;

        self.cake("replace", wan, rates.upload_kbit(), &self.qdisc.upload_options).await?;

        let _ = self.tc(&["qdisc", "del", "dev", wan, "ingress"]).await;
        self.tc(&["qdisc", "add", "dev", wan, "handle", "ffff:", "ingress"]).await?;
        self.tc(&[
            "filter", "add", "dev", wan, "parent", "ffff:", "matchall",
            "action", "mirred", "egress", "redirect", "dev", ifb,
        ])
        .await?;

        self.cake("replace", ifb, rates.download_kbit(), &self.qdisc.download_options).await
    }

    async fn set_rates(&self, rates: RatePair) -> Result<()> {
        self.cake("change", &self.link.wan_interface, rates.upload_kbit(), &[]).await?;
        self.cake("change", &self.link.ifb_interface, rates.download_kbit(), &[]).await
    }

    async fn stats(&self) -> Result<QdiscStats> {
        let egress = self.device_stats(&self.link.wan_interface).await?;
        let ingress = self.device_stats(&self.link.ifb_interface).await?;
        Ok(egress.merge(ingress))
    }

    async fn available(&self) -> bool {
        exec::probe(&self.qdisc.tc_binary, "-V").await
    }
}

/// Parse `tc -s qdisc show` output for the root qdisc.
///
/// Only the first `dropped` and `backlog` figures are taken; CAKE repeats
/// per-tin numbers further down.
pub fn parse_tc_stats(output: &str) -> QdiscStats {
    let dropped_packets = output
        .split("dropped ")
        .nth(1)
        .and_then(leading_number)
        .unwrap_or(0);

    let backlog_bytes = output
        .split("backlog ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(parse_size)
        .unwrap_or(0);

    QdiscStats { dropped_packets, backlog_bytes }
}

fn leading_number(s: &str) -> Option<u64> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn parse_size(token: &str) -> Option<u64> {
    let digits: String = token.chars().take_while(char::is_ascii_digit).collect();
    let value: u64 = digits.parse().ok()?;
    let multiplier = match &token[digits.len()..] {
        "b" | "" => 1,
        "Kb" => 1024,
        "Mb" => 1024 * 1024,
        _ => return None,
    };
    Some(value * multiplier)
}

/// The only component that mutates the shaper.
///
/// Tracks the base pair (last applied measurement target) and the current
/// mode; effective rates are the mode's profile applied to the base.
pub struct ShaperApplier {
    shaper: Arc<dyn TrafficShaper>,
    store: StateStore,
    profiles: ProfileConfig,
    default_base: RatePair,
    last_applied: Option<RatePair>,
    mode: Mode,
    enabled: bool,
}

impl ShaperApplier {
    /// Create an applier from persisted state, falling back to `default_base`
    pub fn new(
        shaper: Arc<dyn TrafficShaper>,
        store: StateStore,
        profiles: ProfileConfig,
        default_base: RatePair,
    ) -> Self {
        let last_applied = store.last_rates();
        let mode = store.prev_mode().unwrap_or_default();
        Self { shaper, store, profiles, default_base, last_applied, mode, enabled: true }
    }

    /// Disable mutation when the control interface is missing
    pub async fn detect_control(&mut self) -> bool {
        self.enabled = self.shaper.available().await;
        if !self.enabled {
            tracing::error!("Shaper control interface not found; shaping changes disabled");
        }
        self.enabled
    }

    /// Current base pair
    pub fn base(&self) -> RatePair {
        self.last_applied.unwrap_or(self.default_base)
    }

    /// Last base pair confirmed applied by a measurement, if any
    pub fn last_applied(&self) -> Option<RatePair> {
        self.last_applied
    }

    /// Mode whose profile is applied
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Rates applied for `mode` on the current base
    pub fn effective(&self, mode: Mode) -> RatePair {
        self.profiles.for_mode(mode).apply(self.base())
    }

    /// Whether mutation is enabled
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Full configuration from the current base and mode
    pub async fn configure(&mut self) -> Result<RatePair> {
        self.ensure_enabled()?;
        let rates = self.effective(self.mode);
        self.shaper.configure(rates).await?;
        Ok(rates)
    }

    /// Switch the applied profile
    pub async fn apply_mode(&mut self, mode: Mode) -> Result<RatePair> {
        self.ensure_enabled()?;
        let rates = self.effective(mode);
        self.shaper.set_rates(rates).await?;
        self.mode = mode;
        tracing::info!("Applied {} profile: {}", mode, rates);
        Ok(rates)
    }

    /// Adopt a new base pair and persist it as the last applied rates.
    ///
    /// Fails only when the shaper rejects the rates; a persist failure after
    /// the shaper accepted them is logged.
    pub async fn apply_base(&mut self, base: RatePair) -> Result<RatePair> {
        self.ensure_enabled()?;
        if !base.is_valid() {
            return Err(ShaperError::Parse(format!("refusing unusable rate pair {}", base)));
        }
        let rates = self.profiles.for_mode(self.mode).apply(base);
        self.shaper.set_rates(rates).await?;
        self.last_applied = Some(base);
        // The shaper already runs at the new rates; only a restart would lose them
        if let Err(e) = self.store.save_last_rates(base) {
            tracing::warn!("Applied base {} but failed to persist it: {}", base, e);
        }
        tracing::info!("Applied base {} ({} profile: {})", base, self.mode, rates);
        Ok(rates)
    }

    /// Read queue statistics
    pub async fn stats(&self) -> Result<QdiscStats> {
        self.shaper.stats().await
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(ShaperError::ShaperUnavailable)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeShaper;
    use super::*;

    const CAKE_STATS: &str = "\
qdisc cake 8005: root refcnt 2 bandwidth 18Mbit diffserv4 dual-srchost nat nowash ack-filter split-gso rtt 100ms raw overhead 0
 Sent 1432789 bytes 9876 pkt (dropped 17, overlimits 3456 requeues 0)
 backlog 3028b 2p requeues 0
 memory used: 54Kb of 4Mb
                   Bulk  Best Effort        Video        Voice
  thresh       1125Kbit       18Mbit        9Mbit     4500Kbit
  drops               0           12            0            5
  backlog            0b        3028b           0b           0b
";

    #[test]
    fn test_parse_tc_stats() {
        let stats = parse_tc_stats(CAKE_STATS);
        assert_eq!(stats.dropped_packets, 17);
        assert_eq!(stats.backlog_bytes, 3028);
    }

    #[test]
    fn test_parse_tc_stats_units_and_garbage() {
        let stats = parse_tc_stats(" Sent 0 bytes 0 pkt (dropped 0, overlimits 0)\n backlog 12Kb 9p\n");
        assert_eq!(stats.backlog_bytes, 12 * 1024);
        assert_eq!(parse_tc_stats("Cannot find device \"ifb0\""), QdiscStats::default());
    }

    fn applier(fake: Arc<FakeShaper>, dir: &std::path::Path) -> ShaperApplier {
        ShaperApplier::new(fake, StateStore::new(dir), ProfileConfig::default(), RatePair::new(100, 20))
    }

    #[tokio::test]
    async fn test_apply_mode_uses_profile() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeShaper::default());
        let mut applier = applier(fake.clone(), dir.path());
        let rates = applier.apply_mode(Mode::ElevatedTight).await.unwrap();
        assert_eq!(rates, RatePair::new(80, 15));
        assert_eq!(applier.mode(), Mode::ElevatedTight);
        assert_eq!(fake.calls(), vec!["set 80/15 Mbit"]);
    }

    #[tokio::test]
    async fn test_apply_base_persists() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeShaper::default());
        let mut applier = applier(fake.clone(), dir.path());
        applier.apply_base(RatePair::new(500, 50)).await.unwrap();
        assert_eq!(StateStore::new(dir.path()).last_rates(), Some(RatePair::new(500, 50)));

        let reloaded = super::ShaperApplier::new(
            fake,
            StateStore::new(dir.path()),
            ProfileConfig::default(),
            RatePair::new(100, 20),
        );
        assert_eq!(reloaded.base(), RatePair::new(500, 50));
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_previous_base() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeShaper::default());
        *fake.fail_set_rates.lock() = true;
        let mut applier = applier(fake, dir.path());
        assert!(applier.apply_base(RatePair::new(500, 50)).await.is_err());
        assert_eq!(applier.base(), RatePair::new(100, 20));
        assert_eq!(applier.last_applied(), None);
        assert_eq!(StateStore::new(dir.path()).last_rates(), None);
    }

    #[tokio::test]
    async fn test_persist_failure_after_apply_keeps_new_base() {
        let dir = tempfile::tempdir().unwrap();
        // State "directory" is a regular file, so every write fails
        let blocker = dir.path().join("state");
        std::fs::write(&blocker, "").unwrap();
        let fake = Arc::new(FakeShaper::default());
        let mut applier = applier(fake.clone(), &blocker);

        let rates = applier.apply_base(RatePair::new(500, 50)).await.unwrap();
        assert_eq!(rates, RatePair::new(500, 50));
        assert_eq!(applier.last_applied(), Some(RatePair::new(500, 50)));
        assert_eq!(applier.base(), RatePair::new(500, 50));
        assert_eq!(fake.calls(), vec!["set 500/50 Mbit"]);
    }

    #[tokio::test]
    async fn test_missing_control_disables_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeShaper { unavailable: true, ..FakeShaper::default() });
        let mut applier = applier(fake.clone(), dir.path());
        assert!(!applier.detect_control().await);
        assert!(matches!(
            applier.apply_mode(Mode::Elevated).await,
            Err(ShaperError::ShaperUnavailable)
        ));
        assert!(fake.calls().is_empty());
        // Stats stay readable for logging
        assert!(applier.stats().await.is_ok());
    }
}
