//! Control loops
//!
//! The mode loop ticks every few seconds; measurement runs as its own task on
//! an hours-long period so it never delays mode switching.

use crate::activity::{Activity, ActivityTracker};
use crate::config::{AutotuneConfig, CongestionConfig, ModeConfig, TelemetryConfig, TickConfig};
use crate::congestion::{self, CongestionLevel, DropTracker};
use crate::mode::{should_apply, TickInput};
use crate::orchestrator::{AutotuneOutcome, Orchestrator};
use crate::shaper::ShaperApplier;
use crate::signal::SignalSource;
use crate::state::StateStore;
use crate::{telemetry, unix_now, ControllerState, Mode, RatePair, ShaperConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// What one tick observed and did
#[derive(Debug, Clone)]
pub struct TickReport {
    /// Game activity detection
    pub activity: Activity,
    /// Shaper drops since the previous tick
    pub drop_delta: u64,
    /// Shaper backlog (bytes)
    pub backlog_bytes: u64,
    /// Congestion score
    pub congestion: CongestionLevel,
    /// Frame-time bias flag
    pub telemetry_bias: bool,
    /// State after the tick
    pub state: ControllerState,
    /// Rates applied on a mode transition
    pub applied: Option<RatePair>,
}

/// Short-timescale mode switching
pub struct ModeLoop {
    params: ModeConfig,
    watermarks: CongestionConfig,
    telemetry: TelemetryConfig,
    signals: Arc<dyn SignalSource>,
    applier: Arc<Mutex<ShaperApplier>>,
    store: StateStore,
    state: ControllerState,
    prev_mode: Option<Mode>,
    activity: ActivityTracker,
    drops: DropTracker,
    apply_failures: u32,
}

impl ModeLoop {
    /// Build the loop, restoring score, hold deadline and previous mode
    pub fn new(
        config: &ShaperConfig,
        signals: Arc<dyn SignalSource>,
        applier: Arc<Mutex<ShaperApplier>>,
        store: StateStore,
    ) -> Self {
        let state = store.controller_state();
        let prev_mode = store.prev_mode();
        tracing::debug!(
            "Restored mode state: score={} hold_until={} prev_mode={:?}",
            state.score, state.hold_until, prev_mode
        );
        Self {
            params: config.mode.clone(),
            watermarks: config.congestion.clone(),
            telemetry: config.telemetry.clone(),
            signals,
            applier,
            store,
            state,
            prev_mode,
            activity: ActivityTracker::new(config.mode.spike_threshold),
            drops: DropTracker::new(),
            apply_failures: 0,
        }
    }

    /// Current state machine state
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Record that startup configuration already applied `mode`'s rates
    pub fn assume_applied(&mut self, mode: Mode) {
        self.prev_mode = Some(mode);
        if let Err(e) = self.store.save_prev_mode(mode) {
            tracing::warn!("Failed to persist mode: {}", e);
        }
    }

    /// One iteration at unix time `now`
    pub async fn tick(&mut self, now: u64) -> TickReport {
        let sample = self.signals.sample().await;
        let activity = self.activity.observe(sample.classified_packets);
        let drop_delta = self.drops.observe(sample.shaper.map(|s| s.dropped_packets));
        let backlog_bytes = sample.shaper.map(|s| s.backlog_bytes).unwrap_or(0);
        let congestion = congestion::score(drop_delta, backlog_bytes, &self.watermarks);
        let telemetry_bias = telemetry::frame_time_bias(&self.telemetry);

        let before = self.state;
        let mode = self.state.tick(
            &self.params,
            TickInput {
                activity_detected: activity.active,
                congestion,
                telemetry_bias,
                now,
            },
        );
        if (self.state.score, self.state.hold_until) != (before.score, before.hold_until) {
            if let Err(e) = self.store.save_controller_state(&self.state) {
                tracing::warn!("Failed to persist mode state: {}", e);
            }
        }

        let applied = if should_apply(mode, self.prev_mode) {
            self.transition(mode).await
        } else {
            None
        };

        TickReport {
            activity,
            drop_delta,
            backlog_bytes,
            congestion,
            telemetry_bias,
            state: self.state,
            applied,
        }
    }

    async fn transition(&mut self, mode: Mode) -> Option<RatePair> {
        let mut applier = self.applier.lock().await;
        if !applier.enabled() {
            // Keep deriving modes for the log; nothing to reconfigure
            tracing::info!("Mode {} -> {} (shaper control unavailable)", label(self.prev_mode), mode);
            self.prev_mode = Some(mode);
            return None;
        }

        match applier.apply_mode(mode).await {
            Ok(rates) => {
                tracing::info!(
                    "Mode {} -> {} (score={}, hold {}s)",
                    label(self.prev_mode),
                    mode,
                    self.state.score,
                    self.state.hold_remaining(unix_now())
                );
                self.prev_mode = Some(mode);
                self.apply_failures = 0;
                if let Err(e) = self.store.save_prev_mode(mode) {
                    tracing::warn!("Failed to persist mode: {}", e);
                }
                Some(rates)
            }
            Err(e) => {
                if self.apply_failures == 0 {
                    tracing::warn!("Failed to apply {} profile, will retry: {}", mode, e);
                } else {
                    tracing::debug!("Retry {} of {} profile failed: {}", self.apply_failures, mode, e);
                }
                self.apply_failures += 1;
                None
            }
        }
    }
}

fn label(mode: Option<Mode>) -> &'static str {
    mode.map(|m| m.label()).unwrap_or("none")
}

/// 1-minute load average, `None` when unreadable
pub fn load_average(path: &Path) -> Option<f64> {
    std::fs::read_to_string(path)
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Sleep before the next mode tick, stretched while the host is loaded
pub fn next_tick_interval(cfg: &TickConfig) -> Duration {
    match load_average(&cfg.loadavg_path) {
        Some(load) if load > cfg.load_ceiling => Duration::from_secs(cfg.loaded_secs),
        _ => Duration::from_secs(cfg.base_secs),
    }
}

/// Delay before the next scheduled measurement
pub fn next_measurement_delay(outcome: &AutotuneOutcome, cfg: &AutotuneConfig) -> Duration {
    let secs = match outcome {
        o if o.measured() => cfg.interval_secs,
        o if o.link_busy() => cfg.busy_retry_secs,
        _ => cfg.retry_secs,
    };
    Duration::from_secs(secs)
}

/// Run the mode loop forever
pub async fn run_mode_loop(mut mode_loop: ModeLoop, tick: TickConfig) {
    tracing::info!("Mode loop started ({}s tick)", tick.base_secs);
    loop {
        let report = mode_loop.tick(unix_now()).await;
        tracing::trace!(
            "tick: delta={} drops={} backlog={} congestion={:?} score={} mode={}",
            report.activity.delta,
            report.drop_delta,
            report.backlog_bytes,
            report.congestion,
            report.state.score,
            report.state.mode
        );
        tokio::time::sleep(next_tick_interval(&tick)).await;
    }
}

/// Run scheduled measurements forever
pub async fn run_measurement_schedule(orchestrator: Orchestrator, applier: Arc<Mutex<ShaperApplier>>) {
    let cfg = orchestrator.config().clone();
    tracing::info!(
        "Measurement schedule started (first in {}s, every {}s)",
        cfg.initial_delay_secs, cfg.interval_secs
    );
    tokio::time::sleep(Duration::from_secs(cfg.initial_delay_secs)).await;
    loop {
        let outcome = orchestrator.run_once(&applier).await;
        let delay = next_measurement_delay(&outcome, &cfg);
        tracing::debug!("Next measurement in {}s", delay.as_secs());
        tokio::time::sleep(delay).await;
    }
}
