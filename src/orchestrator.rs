//! Measurement Orchestrator
//!
//! Gates, in order: time-of-day exclusion, current game activity, idle link.
//! The first gate that blocks ends the cycle. A measurement that passes
//! validation goes through the target calculator and change gate before the
//! shaper is touched.

use crate::activity::detect_activity;
use crate::config::{AutotuneConfig, TimeWindow};
use crate::measure::{parse_result, InvalidMeasurement, MeasurementTool};
use crate::rate::{is_busy, is_idle_enough, sample_window, LinkRates};
use crate::shaper::ShaperApplier;
use crate::signal::SignalSource;
use crate::target::{change_gate, target_for};
use crate::{RatePair, Result};
use chrono::{Local, NaiveTime};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

/// Why a cycle did not measure
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Inside the configured exclusion window
    ExclusionWindow,
    /// Game traffic is active
    GameActivity {
        /// Classified packets during the sample window
        delta: u64,
    },
    /// Link not idle enough to measure
    LinkNotIdle {
        /// Sampled link rates
        rates: LinkRates,
        /// Rates also reached the busy thresholds
        busy: bool,
    },
    /// Tool missing, failed or timed out
    ToolFailed {
        /// Failure description
        detail: String,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ExclusionWindow => write!(f, "inside exclusion window"),
            SkipReason::GameActivity { delta } => write!(f, "game traffic active ({} pkts)", delta),
            SkipReason::LinkNotIdle { rates, busy } => write!(
                f,
                "link {} (rx {} B/s, tx {} B/s)",
                if *busy { "busy" } else { "not idle" },
                rates.rx_bps,
                rates.tx_bps
            ),
            SkipReason::ToolFailed { detail } => write!(f, "measurement tool failed: {}", detail),
        }
    }
}

/// Result of one autotune cycle
#[derive(Debug, Clone, PartialEq)]
pub enum AutotuneOutcome {
    /// A gate blocked or the tool failed
    Skipped(SkipReason),
    /// Tool output rejected
    Invalid(InvalidMeasurement),
    /// Target within thresholds of the applied pair
    Unchanged {
        /// Tool result
        measured: RatePair,
        /// Computed target
        target: RatePair,
        /// Base pair left in place
        applied: RatePair,
    },
    /// New base applied
    Applied {
        /// Tool result
        measured: RatePair,
        /// New base pair
        target: RatePair,
        /// Base pair it replaced
        previous: Option<RatePair>,
        /// Rates now on the shaper
        effective: RatePair,
    },
    /// Shaper rejected the new base
    ApplyFailed {
        /// Target that was rejected
        target: RatePair,
        /// Failure description
        detail: String,
    },
}

impl AutotuneOutcome {
    /// Whether the link was found busy, used to pick the retry delay
    pub fn link_busy(&self) -> bool {
        matches!(self, AutotuneOutcome::Skipped(SkipReason::LinkNotIdle { busy: true, .. }))
    }

    /// Whether the cycle completed a measurement
    pub fn measured(&self) -> bool {
        matches!(self, AutotuneOutcome::Unchanged { .. } | AutotuneOutcome::Applied { .. })
    }
}

impl fmt::Display for AutotuneOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutotuneOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            AutotuneOutcome::Invalid(why) => write!(f, "invalid measurement: {}", why),
            AutotuneOutcome::Unchanged { measured, target, applied } => write!(
                f,
                "measured {}, target {} within thresholds of applied {}",
                measured, target, applied
            ),
            AutotuneOutcome::Applied { measured, target, previous, effective } => {
                write!(f, "measured {}, applied target {} (effective {})", measured, target, effective)?;
                if let Some(previous) = previous {
                    write!(f, ", was {}", previous)?;
                }
                Ok(())
            }
            AutotuneOutcome::ApplyFailed { target, detail } => {
                write!(f, "failed to apply target {}: {}", target, detail)
            }
        }
    }
}

/// Runs measurement cycles
pub struct Orchestrator {
    cfg: AutotuneConfig,
    exclusion: Option<TimeWindow>,
    spike_threshold: u64,
    signals: Arc<dyn SignalSource>,
    tool: Arc<dyn MeasurementTool>,
}

impl Orchestrator {
    /// Create an orchestrator; fails on an unparsable exclusion window
    pub fn new(
        cfg: AutotuneConfig,
        spike_threshold: u64,
        signals: Arc<dyn SignalSource>,
        tool: Arc<dyn MeasurementTool>,
    ) -> Result<Self> {
        let exclusion = cfg.exclusion_window.as_ref().map(|w| w.parse()).transpose()?;
        Ok(Self { cfg, exclusion, spike_threshold, signals, tool })
    }

    /// Autotune settings
    pub fn config(&self) -> &AutotuneConfig {
        &self.cfg
    }

    /// One cycle at the current local time
    pub async fn run_once(&self, applier: &Mutex<ShaperApplier>) -> AutotuneOutcome {
        self.run_at(applier, Local::now().time()).await
    }

    /// One cycle as if the local time were `local_time`
    pub async fn run_at(&self, applier: &Mutex<ShaperApplier>, local_time: NaiveTime) -> AutotuneOutcome {
        let span = tracing::info_span!("autotune", run = %Uuid::new_v4());
        async {
            let outcome = self.cycle(applier, local_time).await;
            match &outcome {
                AutotuneOutcome::Applied { .. } => tracing::info!("Autotune {}", outcome),
                AutotuneOutcome::Invalid(_) | AutotuneOutcome::ApplyFailed { .. } => {
                    tracing::warn!("Autotune {}", outcome)
                }
                AutotuneOutcome::Skipped(SkipReason::ToolFailed { .. }) => {
                    tracing::warn!("Autotune {}", outcome)
                }
                _ => tracing::info!("Autotune {}", outcome),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn cycle(&self, applier: &Mutex<ShaperApplier>, local_time: NaiveTime) -> AutotuneOutcome {
        if let Some(window) = &self.exclusion {
            if window.contains(local_time) {
                return AutotuneOutcome::Skipped(SkipReason::ExclusionWindow);
            }
        }

        let window = Duration::from_secs(self.cfg.sample_window_secs);
        let (first, second) = sample_window(self.signals.as_ref(), window).await;

        if self.cfg.skip_on_activity {
            if let (Some(prev), Some(curr)) = (first.classified_packets, second.classified_packets) {
                let activity = detect_activity(prev, curr, self.spike_threshold);
                if activity.active {
                    return AutotuneOutcome::Skipped(SkipReason::GameActivity { delta: activity.delta });
                }
            }
        }

        let rates = LinkRates::between(&first, &second);
        if !is_idle_enough(rates, self.cfg.idle_rx_bps, self.cfg.idle_tx_bps) {
            let busy = is_busy(rates, self.cfg.busy_rx_bps, self.cfg.busy_tx_bps);
            return AutotuneOutcome::Skipped(SkipReason::LinkNotIdle { rates, busy });
        }

        let output = match self.tool.run().await {
            Ok(output) => output,
            Err(e) => return AutotuneOutcome::Skipped(SkipReason::ToolFailed { detail: e.to_string() }),
        };
        let measured = match parse_result(&output, &self.cfg.error_markers) {
            Ok(measured) => measured,
            Err(why) => return AutotuneOutcome::Invalid(why),
        };

        let target = target_for(measured, &self.cfg);
        let mut applier = applier.lock().await;
        let previous = applier.last_applied();
        let verdict = change_gate(target, previous, &self.cfg);
        if !verdict.should_apply() {
            return AutotuneOutcome::Unchanged {
                measured,
                target,
                applied: previous.unwrap_or(target),
            };
        }

        match applier.apply_base(target).await {
            Ok(effective) => AutotuneOutcome::Applied { measured, target, previous, effective },
            Err(e) => AutotuneOutcome::ApplyFailed { target, detail: e.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProfileConfig, TimeWindowConfig};
    use crate::measure::testing::FakeTool;
    use crate::shaper::testing::FakeShaper;
    use crate::signal::testing::FakeSignals;
    use crate::state::StateStore;

    const OUTPUT: &str = " Download: 800.2 Mbps\n   Upload: 120.4 Mbps\n";

    struct Harness {
        _dir: tempfile::TempDir,
        store: StateStore,
        shaper: Arc<FakeShaper>,
        signals: Arc<FakeSignals>,
        tool: Arc<FakeTool>,
        applier: Mutex<ShaperApplier>,
    }

    fn harness(tool: FakeTool) -> Harness {
        harness_with(tool, None)
    }

    fn harness_with(tool: FakeTool, last_applied: Option<RatePair>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        if let Some(rates) = last_applied {
            store.save_last_rates(rates).unwrap();
        }
        let shaper = Arc::new(FakeShaper::default());
        let applier = ShaperApplier::new(
            shaper.clone(),
            store.clone(),
            ProfileConfig::default(),
            RatePair::new(100, 20),
        );
        Harness {
            _dir: dir,
            store,
            shaper,
            signals: Arc::new(FakeSignals::default()),
            tool: Arc::new(tool),
            applier: Mutex::new(applier),
        }
    }

    fn orchestrator(h: &Harness, cfg: AutotuneConfig) -> Orchestrator {
        Orchestrator::new(cfg, 10, h.signals.clone(), h.tool.clone()).unwrap()
    }

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_applies_first_measurement() {
        let h = harness(FakeTool::ok(OUTPUT));
        let outcome = orchestrator(&h, AutotuneConfig::default()).run_at(&h.applier, noon()).await;
        assert_eq!(
            outcome,
            AutotuneOutcome::Applied {
                measured: RatePair::new(800, 120),
                target: RatePair::new(720, 105),
                previous: None,
                effective: RatePair::new(720, 105),
            }
        );
        assert_eq!(h.store.last_rates(), Some(RatePair::new(720, 105)));
        assert_eq!(h.shaper.calls(), vec!["set 720/105 Mbit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_change_not_applied() {
        let h = harness_with(FakeTool::ok(OUTPUT), Some(RatePair::new(700, 102)));
        let outcome = orchestrator(&h, AutotuneConfig::default()).run_at(&h.applier, noon()).await;
        assert!(matches!(outcome, AutotuneOutcome::Unchanged { .. }));
        assert!(outcome.measured());
        assert!(h.shaper.calls().is_empty());
        assert_eq!(h.store.last_rates(), Some(RatePair::new(700, 102)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusion_window_blocks_before_sampling() {
        let h = harness(FakeTool::ok(OUTPUT));
        let cfg = AutotuneConfig {
            exclusion_window: Some(TimeWindowConfig { start: "11:00".into(), end: "13:00".into() }),
            ..AutotuneConfig::default()
        };
        let start = tokio::time::Instant::now();
        let outcome = orchestrator(&h, cfg).run_at(&h.applier, noon()).await;
        assert_eq!(outcome, AutotuneOutcome::Skipped(SkipReason::ExclusionWindow));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(h.tool.runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_game_activity_blocks() {
        let h = harness(FakeTool::ok(OUTPUT));
        h.signals.set_classified(Some(100));
        let signals = h.signals.clone();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            signals.set_classified(Some(180));
        });
        let outcome = orchestrator(&h, AutotuneConfig::default()).run_at(&h.applier, noon()).await;
        feeder.await.unwrap();
        assert_eq!(outcome, AutotuneOutcome::Skipped(SkipReason::GameActivity { delta: 80 }));
        assert_eq!(h.tool.runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_link_blocks() {
        let h = harness(FakeTool::ok(OUTPUT));
        let signals = h.signals.clone();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            signals.add_bytes(10_000_000, 0);
        });
        let outcome = orchestrator(&h, AutotuneConfig::default()).run_at(&h.applier, noon()).await;
        feeder.await.unwrap();
        assert!(outcome.link_busy());
        assert_eq!(h.tool.runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_marker_keeps_previous_rates() {
        let output = format!("{}WARNING: netperf returned errors\n", OUTPUT);
        let h = harness(FakeTool::ok(&output));
        let outcome = orchestrator(&h, AutotuneConfig::default()).run_at(&h.applier, noon()).await;
        assert!(matches!(outcome, AutotuneOutcome::Invalid(InvalidMeasurement::ErrorMarker(_))));
        assert!(h.shaper.calls().is_empty());
        assert_eq!(h.store.last_rates(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_failure_is_skip() {
        let h = harness(FakeTool::failing());
        let outcome = orchestrator(&h, AutotuneConfig::default()).run_at(&h.applier, noon()).await;
        assert!(matches!(outcome, AutotuneOutcome::Skipped(SkipReason::ToolFailed { .. })));
        assert!(!outcome.measured());
    }
}
