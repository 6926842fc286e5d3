//! Single-instance lock
//!
//! An atomically created marker file holding the owner's pid. The guard
//! removes the marker when dropped.

use crate::Result;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Held instance lock
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(None)` when another live instance holds it. A marker left
    /// behind by a dead process is cleared once.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(Some(Self { path: path.to_path_buf() }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 && Self::is_stale(path) {
                        tracing::warn!("Removing stale lock {}", path.display());
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Marker path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_stale(path: &Path) -> bool {
        let Ok(content) = fs::read_to_string(path) else {
            return false;
        };
        match content.trim().parse::<u32>() {
            Ok(pid) => !Path::new(&format!("/proc/{}", pid)).exists(),
            // Empty marker: the owner may still be writing its pid
            Err(_) => false,
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock {}: {}", self.path.display(), e);
        }
    }
}
