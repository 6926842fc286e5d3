//! Signal Source
//!
//! Point-in-time reads of link byte counters, the classified packet counter
//! and shaper queue statistics. Failed reads degrade to safe defaults.

use crate::classifier::Classifier;
use crate::shaper::{QdiscStats, TrafficShaper};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;

/// Interface byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkBytes {
    /// Received bytes
    pub rx_bytes: u64,
    /// Transmitted bytes
    pub tx_bytes: u64,
}

/// Immutable snapshot of every counter the controller consumes
#[derive(Debug, Clone, Copy)]
pub struct CounterSample {
    /// When the snapshot was taken
    pub taken_at: Instant,
    /// Link byte counters
    pub link: LinkBytes,
    /// Classified game packets, `None` when unreadable
    pub classified_packets: Option<u64>,
    /// Shaper queue statistics, `None` when unreadable
    pub shaper: Option<QdiscStats>,
}

/// Counter reads
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Interface byte counters; zero when the interface is absent
    async fn link_bytes(&self) -> LinkBytes;

    /// Classified game packet count
    async fn classified_packets(&self) -> Option<u64>;

    /// Shaper drop/backlog statistics
    async fn shaper_stats(&self) -> Option<QdiscStats>;

    /// Read everything at once
    async fn sample(&self) -> CounterSample {
        let link = self.link_bytes().await;
        let classified_packets = self.classified_packets().await;
        let shaper = self.shaper_stats().await;
        CounterSample {
            taken_at: Instant::now(),
            link,
            classified_packets,
            shaper,
        }
    }
}

/// Signals read from the running system
pub struct SystemSignals {
    interface_stats: PathBuf,
    classifier: Classifier,
    shaper: Arc<dyn TrafficShaper>,
}

impl SystemSignals {
    /// Read `<sysfs_root>/<interface>/statistics`, the classifier counter and
    /// the shaper's queue statistics
    pub fn new(
        sysfs_root: &Path,
        interface: &str,
        classifier: Classifier,
        shaper: Arc<dyn TrafficShaper>,
    ) -> Self {
        Self {
            interface_stats: sysfs_root.join(interface).join("statistics"),
            classifier,
            shaper,
        }
    }

    fn read_counter(&self, name: &str) -> u64 {
        read_u64(&self.interface_stats.join(name)).unwrap_or_else(|| {
            tracing::debug!("Counter {} unreadable, using 0", self.interface_stats.join(name).display());
            0
        })
    }
}

#[async_trait]
impl SignalSource for SystemSignals {
    async fn link_bytes(&self) -> LinkBytes {
        LinkBytes {
            rx_bytes: self.read_counter("rx_bytes"),
            tx_bytes: self.read_counter("tx_bytes"),
        }
    }

    async fn classified_packets(&self) -> Option<u64> {
        match self.classifier.packet_count().await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::debug!("Classifier counter unavailable: {}", e);
                None
            }
        }
    }

    async fn shaper_stats(&self) -> Option<QdiscStats> {
        match self.shaper.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::debug!("Shaper stats unavailable: {}", e);
                None
            }
        }
    }
}

pub(crate) fn read_u64(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::shaper::testing::FakeShaper;
    use std::fs;

    fn write_stats(root: &Path, iface: &str, rx: u64, tx: u64) {
        let dir = root.join(iface).join("statistics");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("rx_bytes"), format!("{}\n", rx)).unwrap();
        fs::write(dir.join("tx_bytes"), format!("{}\n", tx)).unwrap();
    }

    fn classifier_without_nft() -> Classifier {
        Classifier::new(ClassifierConfig {
            nft_binary: "definitely-not-nft".into(),
            ..ClassifierConfig::default()
        }, "eth0".into())
    }

    #[tokio::test]
    async fn test_reads_sysfs_counters() {
        let root = tempfile::tempdir().unwrap();
        write_stats(root.path(), "wan", 12_345, 678);
        let signals = SystemSignals::new(
            root.path(),
            "wan",
            classifier_without_nft(),
            Arc::new(FakeShaper::default()),
        );
        assert_eq!(signals.link_bytes().await, LinkBytes { rx_bytes: 12_345, tx_bytes: 678 });
    }

    #[tokio::test]
    async fn test_missing_interface_reads_zero() {
        let root = tempfile::tempdir().unwrap();
        let signals = SystemSignals::new(
            root.path(),
            "absent0",
            classifier_without_nft(),
            Arc::new(FakeShaper::default()),
        );
        let sample = signals.sample().await;
        assert_eq!(sample.link, LinkBytes::default());
        assert_eq!(sample.classified_packets, None);
        assert_eq!(sample.shaper, Some(QdiscStats::default()));
    }
}
