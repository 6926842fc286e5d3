//! Command implementations
//!
//! Every mutating command takes the instance lock first. A held lock means
//! another instance is active: the command logs one line and returns without
//! touching state or the shaper.

use crate::classifier::Classifier;
use crate::controller::{run_measurement_schedule, run_mode_loop, ModeLoop};
use crate::lock::InstanceLock;
use crate::measure::{MeasurementTool, NetperfTool};
use crate::rate::{is_busy, is_idle_enough, sample_window, LinkRates};
use crate::shaper::{CakeShaper, QdiscStats};
use crate::signal::SystemSignals;
use crate::state::StateStore;
use crate::{
    unix_now, AutotuneOutcome, Mode, Orchestrator, RatePair, Result, ShaperApplier, ShaperConfig,
    ShaperError, SignalSource, TrafficShaper,
};
use clap::ValueEnum;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Everything a command needs
pub struct Context {
    /// Loaded configuration
    pub config: ShaperConfig,
    /// Persisted state
    pub store: StateStore,
    /// Packet classifier
    pub classifier: Classifier,
    /// Traffic shaper
    pub shaper: Arc<dyn TrafficShaper>,
    /// Counter reads
    pub signals: Arc<dyn SignalSource>,
    /// Bandwidth measurement
    pub tool: Arc<dyn MeasurementTool>,
}

impl Context {
    /// Context with explicit collaborators
    pub fn new(
        config: ShaperConfig,
        shaper: Arc<dyn TrafficShaper>,
        signals: Arc<dyn SignalSource>,
        tool: Arc<dyn MeasurementTool>,
    ) -> Self {
        Self {
            store: StateStore::new(&config.state.dir),
            classifier: classifier(&config),
            shaper,
            signals,
            tool,
            config,
        }
    }

    /// Context driving the real system: tc, nft, sysfs and the speed test
    pub fn system(config: ShaperConfig) -> Self {
        let shaper: Arc<dyn TrafficShaper> =
            Arc::new(CakeShaper::new(config.link.clone(), config.shaper.clone()));
        let signals = Arc::new(SystemSignals::new(
            &config.link.sysfs_root,
            &config.link.wan_interface,
            classifier(&config),
            shaper.clone(),
        ));
        let tool = Arc::new(NetperfTool::new(&config.autotune));
        Self::new(config, shaper, signals, tool)
    }

    fn applier(&self) -> ShaperApplier {
        ShaperApplier::new(
            self.shaper.clone(),
            self.store.clone(),
            self.config.profiles.clone(),
            self.config.link.default_rates,
        )
    }

    fn lock(&self) -> Result<Option<InstanceLock>> {
        let path = &self.config.state.lock_path;
        let lock = InstanceLock::acquire(path)?;
        if lock.is_none() {
            tracing::info!("Another instance holds {}, exiting", path.display());
        }
        Ok(lock)
    }
}

fn classifier(config: &ShaperConfig) -> Classifier {
    Classifier::new(config.classifier.clone(), config.link.wan_interface.clone())
}

/// Load the classifier and fully configure the shaper from persisted state.
///
/// The returned applier is disabled when the shaper control interface is
/// missing.
async fn setup(ctx: &Context) -> Result<ShaperApplier> {
    if let Err(e) = ctx.classifier.apply().await {
        tracing::warn!("Classifier not loaded, activity detection degraded: {}", e);
    }
    let mut applier = ctx.applier();
    if applier.detect_control().await {
        let rates = applier.configure().await?;
        tracing::info!("Shaper configured: {} ({} profile, base {})", rates, applier.mode(), applier.base());
    }
    Ok(applier)
}

/// `apply-base`: idempotent reconfiguration, no measurement.
///
/// Returns `None` when another instance holds the lock. `shutdown` resolving
/// first abandons the command with [`ShaperError::Interrupted`].
pub async fn apply_base(ctx: &Context, shutdown: impl Future<Output = ()>) -> Result<Option<RatePair>> {
    let Some(_lock) = ctx.lock()? else {
        return Ok(None);
    };
    let applier = tokio::select! {
        applier = setup(ctx) => applier?,
        _ = shutdown => return Err(interrupted("apply-base")),
    };
    if !applier.enabled() {
        return Err(ShaperError::ShaperUnavailable);
    }
    Ok(Some(applier.effective(applier.mode())))
}

/// `autotune`: one measurement cycle.
///
/// Returns `None` when another instance holds the lock. `shutdown` resolving
/// first kills a running measurement and returns
/// [`ShaperError::Interrupted`].
pub async fn autotune(ctx: &Context, shutdown: impl Future<Output = ()>) -> Result<Option<AutotuneOutcome>> {
    let Some(_lock) = ctx.lock()? else {
        return Ok(None);
    };
    let orchestrator = Orchestrator::new(
        ctx.config.autotune.clone(),
        ctx.config.mode.spike_threshold,
        ctx.signals.clone(),
        ctx.tool.clone(),
    )?;
    let mut applier = ctx.applier();
    applier.detect_control().await;
    let applier = Mutex::new(applier);
    tokio::select! {
        outcome = orchestrator.run_once(&applier) => Ok(Some(outcome)),
        _ = shutdown => Err(interrupted("autotune")),
    }
}

fn interrupted(command: &str) -> ShaperError {
    tracing::info!("Abandoning {} on shutdown", command);
    ShaperError::Interrupted
}

/// `run`: apply-base, then the mode loop and measurement schedule until
/// `shutdown` resolves.
///
/// Returns `false` when another instance holds the lock. Dropping the loop
/// futures kills any running measurement before the lock is released.
pub async fn run(ctx: &Context, shutdown: impl Future<Output = ()>) -> Result<bool> {
    let Some(_lock) = ctx.lock()? else {
        return Ok(false);
    };
    let orchestrator = Orchestrator::new(
        ctx.config.autotune.clone(),
        ctx.config.mode.spike_threshold,
        ctx.signals.clone(),
        ctx.tool.clone(),
    )?;

    let (applier, configured) = match setup(ctx).await {
        Ok(applier) => {
            let configured = applier.enabled();
            (applier, configured)
        }
        Err(e) => {
            // Mode transitions retry the rates on every tick
            tracing::warn!("Initial shaper configuration failed: {}", e);
            (ctx.applier(), false)
        }
    };
    let applied_mode = applier.mode();
    let applier = Arc::new(Mutex::new(applier));
    let mut mode_loop = ModeLoop::new(&ctx.config, ctx.signals.clone(), applier.clone(), ctx.store.clone());
    if configured {
        mode_loop.assume_applied(applied_mode);
    }

    tokio::select! {
        _ = run_mode_loop(mode_loop, ctx.config.tick.clone()) => {},
        _ = run_measurement_schedule(orchestrator, applier) => {},
        _ = shutdown => tracing::info!("Shutting down"),
    }
    Ok(true)
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("SIGINT handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = interrupt => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// Status output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable
    #[default]
    Text,
    /// JSON document
    Json,
}

/// Read-only snapshot for `status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Persisted last applied base pair
    pub last_applied: Option<RatePair>,
    /// Base pair in use (last applied or configured default)
    pub base: RatePair,
    /// Persisted previous mode
    pub mode: Option<Mode>,
    /// Rates of the mode's profile on the base
    pub effective: RatePair,
    /// Activity score
    pub score: u32,
    /// Seconds left on the elevated hold
    pub hold_remaining_secs: u64,
    /// Classified game packet counter
    pub classified_packets: Option<u64>,
    /// Shaper queue statistics
    pub shaper: Option<QdiscStats>,
    /// Link rates over the sample window
    pub link: LinkRates,
    /// Link at or above the busy thresholds
    pub busy: bool,
    /// Link at or below the idle thresholds
    pub idle_enough: bool,
    /// Lock marker present
    pub locked: bool,
}

impl StatusReport {
    /// Render in `format`
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Text => Ok(self.to_string()),
            OutputFormat::Json => {
                serde_json::to_string_pretty(self).map_err(|e| ShaperError::Parse(e.to_string()))
            }
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let or_none = |v: Option<String>| v.unwrap_or_else(|| "-".into());
        writeln!(f, "instance:      {}", if self.locked { "running" } else { "not running" })?;
        writeln!(f, "mode:          {}", or_none(self.mode.map(|m| m.to_string())))?;
        writeln!(f, "score:         {} (hold {}s)", self.score, self.hold_remaining_secs)?;
        writeln!(f, "base rates:    {}", self.base)?;
        writeln!(f, "last applied:  {}", or_none(self.last_applied.map(|r| r.to_string())))?;
        writeln!(f, "effective:     {}", self.effective)?;
        writeln!(f, "game packets:  {}", or_none(self.classified_packets.map(|c| c.to_string())))?;
        match self.shaper {
            Some(s) => writeln!(f, "shaper:        {} dropped, {} bytes queued", s.dropped_packets, s.backlog_bytes)?,
            None => writeln!(f, "shaper:        unavailable")?,
        }
        write!(
            f,
            "link:          rx {} B/s, tx {} B/s ({}{})",
            self.link.rx_bps,
            self.link.tx_bps,
            if self.busy { "busy" } else { "not busy" },
            if self.idle_enough { ", idle enough to measure" } else { "" }
        )
    }
}

/// `status`: never takes the lock and never mutates anything
pub async fn status(ctx: &Context) -> StatusReport {
    let cfg = &ctx.config;
    let state = ctx.store.controller_state();
    let mode = ctx.store.prev_mode();
    let last_applied = ctx.store.last_rates();
    let base = last_applied.unwrap_or(cfg.link.default_rates);

    let window = Duration::from_secs(cfg.autotune.sample_window_secs);
    let (first, second) = sample_window(ctx.signals.as_ref(), window).await;
    let link = LinkRates::between(&first, &second);

    StatusReport {
        last_applied,
        base,
        mode,
        effective: cfg.profiles.for_mode(mode.unwrap_or_default()).apply(base),
        score: state.score,
        hold_remaining_secs: state.hold_remaining(unix_now()),
        classified_packets: second.classified_packets,
        shaper: second.shaper,
        link,
        busy: is_busy(link, cfg.autotune.busy_rx_bps, cfg.autotune.busy_tx_bps),
        idle_enough: is_idle_enough(link, cfg.autotune.idle_rx_bps, cfg.autotune.idle_tx_bps),
        locked: cfg.state.lock_path.exists(),
    }
}
