//! Rate Sampler and busy/idle classification

use crate::signal::{CounterSample, SignalSource};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Average link byte rates over a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkRates {
    /// Receive bytes/s
    pub rx_bps: u64,
    /// Transmit bytes/s
    pub tx_bps: u64,
}

impl LinkRates {
    /// Rates between two samples; counter wraps and resets read as zero
    pub fn between(first: &CounterSample, second: &CounterSample) -> Self {
        let elapsed = second.taken_at.duration_since(first.taken_at).as_secs_f64();
        if elapsed <= 0.0 {
            return Self::default();
        }
        let rate = |a: u64, b: u64| (b.saturating_sub(a) as f64 / elapsed).round() as u64;
        Self {
            rx_bps: rate(first.link.rx_bytes, second.link.rx_bytes),
            tx_bps: rate(first.link.tx_bytes, second.link.tx_bytes),
        }
    }
}

/// Two full samples `window` apart
pub async fn sample_window(
    source: &dyn SignalSource,
    window: Duration,
) -> (CounterSample, CounterSample) {
    let first = source.sample().await;
    tokio::time::sleep(window).await;
    let second = source.sample().await;
    (first, second)
}

/// Average byte rates over `window`
pub async fn sample_rate(source: &dyn SignalSource, window: Duration) -> LinkRates {
    let (first, second) = sample_window(source, window).await;
    LinkRates::between(&first, &second)
}

/// Either direction at or above its threshold
pub fn is_busy(rates: LinkRates, rx_threshold: u64, tx_threshold: u64) -> bool {
    rates.rx_bps >= rx_threshold || rates.tx_bps >= tx_threshold
}

/// Both directions at or below their idle thresholds
pub fn is_idle_enough(rates: LinkRates, rx_idle_threshold: u64, tx_idle_threshold: u64) -> bool {
    rates.rx_bps <= rx_idle_threshold && rates.tx_bps <= tx_idle_threshold
}
