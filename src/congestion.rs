//! Congestion Scorer

use crate::config::CongestionConfig;
use serde::{Deserialize, Serialize};

/// Discrete confidence that the shaper queue is congested
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    /// Queue is shallow
    Low,
    /// Backlog above the low watermark
    Medium,
    /// Backlog above the high watermark
    High,
    /// Packets dropped since the last tick
    Severe,
}

impl CongestionLevel {
    /// Confidence value for this level
    pub const fn confidence(&self) -> f32 {
        match self {
            CongestionLevel::Low => 0.20,
            CongestionLevel::Medium => 0.55,
            CongestionLevel::High => 0.75,
            CongestionLevel::Severe => 0.85,
        }
    }
}

/// Score drop delta and queue backlog.
///
/// Any drop wins outright, regardless of backlog depth.
pub fn score(drop_delta: u64, backlog_bytes: u64, watermarks: &CongestionConfig) -> CongestionLevel {
    if drop_delta > 0 {
        CongestionLevel::Severe
    } else if backlog_bytes > watermarks.backlog_high_bytes {
        CongestionLevel::High
    } else if backlog_bytes > watermarks.backlog_low_bytes {
        CongestionLevel::Medium
    } else {
        CongestionLevel::Low
    }
}

/// Tracks the shaper drop counter between ticks
#[derive(Debug, Default)]
pub struct DropTracker {
    prev: Option<u64>,
}

impl DropTracker {
    /// Create a tracker with no baseline
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops since the previous observation.
    ///
    /// The first observation, a missing reading, and a counter reset
    /// (qdisc replaced) all yield zero.
    pub fn observe(&mut self, drops: Option<u64>) -> u64 {
        let Some(curr) = drops else {
            return 0;
        };
        let delta = match self.prev {
            Some(prev) if curr >= prev => curr - prev,
            _ => 0,
        };
        self.prev = Some(curr);
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_thresholds() {
        let w = CongestionConfig::default();
        assert_eq!(score(0, 0, &w), CongestionLevel::Low);
        assert_eq!(score(0, 10_000, &w), CongestionLevel::Low);
        assert_eq!(score(0, 10_001, &w), CongestionLevel::Medium);
        assert_eq!(score(0, 50_001, &w), CongestionLevel::High);
        assert_eq!(score(1, 0, &w), CongestionLevel::Severe);
    }

    #[test]
    fn test_drops_win_over_backlog() {
        let w = CongestionConfig::default();
        assert_eq!(score(3, 1_000_000, &w), CongestionLevel::Severe);
    }

    #[test]
    fn test_confidence_ordering() {
        let levels = [
            CongestionLevel::Low,
            CongestionLevel::Medium,
            CongestionLevel::High,
            CongestionLevel::Severe,
        ];
        for pair in levels.windows(2) {
            assert!(pair[0].confidence() < pair[1].confidence());
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_drop_tracker() {
        let mut t = DropTracker::new();
        assert_eq!(t.observe(Some(100)), 0);
        assert_eq!(t.observe(Some(104)), 4);
        assert_eq!(t.observe(None), 0);
        assert_eq!(t.observe(Some(104)), 0);
        // Qdisc replaced, counter restarted
        assert_eq!(t.observe(Some(2)), 0);
        assert_eq!(t.observe(Some(5)), 3);
    }
}
