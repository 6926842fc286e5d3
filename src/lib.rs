//! OpenSASE Shaper - Adaptive WAN Shaping
//!
//! Keeps latency low on a residential WAN link by switching shaping profiles
//! when latency-sensitive (gaming) traffic is active, and by periodically
//! re-measuring link capacity while the link is idle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          OPENSASE SHAPER                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                        SIGNAL SOURCE                             │   │
//! │  │   Link bytes (sysfs) | Game counter (nft) | Drops/backlog (tc)  │   │
//! │  └─────────┬───────────────────┬────────────────────┬───────────────┘   │
//! │            │                   │                    │                   │
//! │  ┌─────────▼──────┐  ┌─────────▼───────┐  ┌────────▼─────────┐         │
//! │  │  Rate Sampler  │  │ Activity        │  │ Congestion       │         │
//! │  │  busy / idle   │  │ Detector        │  │ Scorer           │         │
//! │  └─────────┬──────┘  └─────────┬───────┘  └────────┬─────────┘         │
//! │            │                   └─────────┬─────────┘                    │
//! │  ┌─────────▼──────────────┐    ┌─────────▼─────────────────────┐       │
//! │  │ MEASUREMENT (hours)    │    │ MODE STATE MACHINE (seconds)  │       │
//! │  │ gates → tool → target  │    │ score + hold → profile        │       │
//! │  │ → change gate          │    │ → change gate                 │       │
//! │  └─────────┬──────────────┘    └─────────┬─────────────────────┘       │
//! │            └──────────────┬──────────────┘                              │
//! │  ┌────────────────────────▼──────────────────────────────────────────┐  │
//! │  │                     SHAPER APPLIER (tc / CAKE)                     │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod activity;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod congestion;
pub mod controller;
pub mod exec;
pub mod lock;
pub mod measure;
pub mod mode;
pub mod orchestrator;
pub mod rate;
pub mod schedule;
pub mod shaper;
pub mod signal;
pub mod state;
pub mod target;
pub mod telemetry;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use config::ShaperConfig;
pub use controller::ModeLoop;
pub use mode::{ControllerState, Mode};
pub use orchestrator::{AutotuneOutcome, Orchestrator};
pub use shaper::{ShaperApplier, TrafficShaper};
pub use signal::{CounterSample, SignalSource};

/// Shaper error types
#[derive(Debug, Error)]
pub enum ShaperError {
    /// Filesystem or process I/O
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),
    /// External command missing or exited non-zero
    #[error("command `{program}` failed: {detail}")]
    Command {
        /// Program name
        program: String,
        /// stderr or spawn error
        detail: String,
    },
    /// External command exceeded its timeout
    #[error("command `{program}` timed out after {secs}s")]
    Timeout {
        /// Program name
        program: String,
        /// Timeout that elapsed
        secs: u64,
    },
    /// No shaper control interface on this host
    #[error("shaper control interface unavailable")]
    ShaperUnavailable,
    /// Unparsable command output
    #[error("parse error: {0}")]
    Parse(String),
    /// Termination signal received before the command finished
    #[error("interrupted by termination signal")]
    Interrupted,
}

/// Result type for the shaper
pub type Result<T> = std::result::Result<T, ShaperError>;

/// Download/upload pair in Mbit/s.
///
/// Used for measured throughput, computed targets and the persisted
/// last-applied configuration alike. A pair with a zero field is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePair {
    /// Download rate (Mbit/s)
    pub download_mbit: u32,
    /// Upload rate (Mbit/s)
    pub upload_mbit: u32,
}

impl RatePair {
    /// Create a rate pair
    pub const fn new(download_mbit: u32, upload_mbit: u32) -> Self {
        Self { download_mbit, upload_mbit }
    }

    /// Both directions are positive
    pub fn is_valid(&self) -> bool {
        self.download_mbit > 0 && self.upload_mbit > 0
    }

    /// `Some(self)` when usable, `None` otherwise
    pub fn usable(self) -> Option<Self> {
        self.is_valid().then_some(self)
    }

    /// Download rate in kbit/s
    pub fn download_kbit(&self) -> u64 {
        u64::from(self.download_mbit) * 1000
    }

    /// Upload rate in kbit/s
    pub fn upload_kbit(&self) -> u64 {
        u64::from(self.upload_mbit) * 1000
    }

    /// Scale each direction by a percentage, never dropping below 1 Mbit/s
    pub fn scaled(&self, down_pct: u32, up_pct: u32) -> Self {
        let scale = |v: u32, pct: u32| ((u64::from(v) * u64::from(pct)) / 100).max(1) as u32;
        Self {
            download_mbit: scale(self.download_mbit, down_pct),
            upload_mbit: scale(self.upload_mbit, up_pct),
        }
    }
}

impl fmt::Display for RatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} Mbit", self.download_mbit, self.upload_mbit)
    }
}

/// Current wall-clock time as unix seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_pair_validity() {
        assert!(RatePair::new(100, 20).is_valid());
        assert!(!RatePair::new(0, 20).is_valid());
        assert!(!RatePair::new(100, 0).is_valid());
        assert_eq!(RatePair::new(0, 20).usable(), None);
    }

    #[test]
    fn test_rate_pair_scaled() {
        let base = RatePair::new(500, 50);
        assert_eq!(base.scaled(90, 80), RatePair::new(450, 40));
        assert_eq!(RatePair::new(1, 1).scaled(50, 50), RatePair::new(1, 1));
        assert_eq!(base.download_kbit(), 500_000);
    }
}
