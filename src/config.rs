//! Shaper Configuration

use crate::{Mode, RatePair, Result, ShaperError};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/opensase/shaper.toml";

/// Shaper configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaperConfig {
    /// WAN link settings
    pub link: LinkConfig,
    /// Queueing discipline settings
    pub shaper: QdiscConfig,
    /// Packet classifier settings
    pub classifier: ClassifierConfig,
    /// Mode state machine settings
    pub mode: ModeConfig,
    /// Congestion watermarks
    pub congestion: CongestionConfig,
    /// Per-mode rate profiles
    pub profiles: ProfileConfig,
    /// Frame-time telemetry bias
    pub telemetry: TelemetryConfig,
    /// Measurement-driven retuning
    pub autotune: AutotuneConfig,
    /// Control loop pacing
    pub tick: TickConfig,
    /// Persisted state locations
    pub state: StateConfig,
}

impl ShaperConfig {
    /// Load from a TOML file and validate
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ShaperError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(ShaperError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Config {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let a = &self.autotune;
        if a.floor_down_mbit > a.ceiling_down_mbit || a.floor_up_mbit > a.ceiling_up_mbit {
            return Err(ShaperError::Config("autotune floor exceeds ceiling".into()));
        }
        for (name, pct) in [("autotune.down_pct", a.down_pct), ("autotune.up_pct", a.up_pct)] {
            if pct == 0 || pct > 100 {
                return Err(ShaperError::Config(format!("{} must be in 1..=100, got {}", name, pct)));
            }
        }
        for mode in Mode::ALL {
            let p = self.profiles.for_mode(mode);
            if p.down_pct == 0 || p.down_pct > 100 || p.up_pct == 0 || p.up_pct > 100 {
                return Err(ShaperError::Config(format!(
                    "profile {} percentages must be in 1..=100", mode
                )));
            }
        }
        let m = &self.mode;
        if m.enter_threshold > m.score_max {
            return Err(ShaperError::Config("mode.enter_threshold exceeds mode.score_max".into()));
        }
        if self.congestion.backlog_low_bytes > self.congestion.backlog_high_bytes {
            return Err(ShaperError::Config("congestion low watermark exceeds high watermark".into()));
        }
        if self.tick.base_secs == 0 || self.tick.loaded_secs == 0 || a.sample_window_secs == 0 {
            return Err(ShaperError::Config("tick and sample intervals must be positive".into()));
        }
        if !self.link.default_rates.is_valid() {
            return Err(ShaperError::Config("link.default_rates must be positive".into()));
        }
        if let Some(window) = &a.exclusion_window {
            window.parse()?;
        }
        for net in &self.classifier.hosts {
            net.parse::<ipnetwork::IpNetwork>()
                .map_err(|e| ShaperError::Config(format!("classifier host {}: {}", net, e)))?;
        }
        Ok(())
    }
}

/// WAN link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// WAN interface (egress shaping, byte counters)
    pub wan_interface: String,
    /// IFB interface carrying redirected ingress traffic
    pub ifb_interface: String,
    /// Root of per-interface statistics
    pub sysfs_root: PathBuf,
    /// Base rates used before any measurement has been applied
    pub default_rates: RatePair,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            wan_interface: "eth0".into(),
            ifb_interface: "ifb4eth0".into(),
            sysfs_root: PathBuf::from("/sys/class/net"),
            default_rates: RatePair::new(100, 20),
        }
    }
}

/// Queueing discipline settings, applied once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdiscConfig {
    /// `tc` binary
    pub tc_binary: String,
    /// `ip` binary
    pub ip_binary: String,
    /// Extra CAKE options on the egress (upload) qdisc
    pub upload_options: Vec<String>,
    /// Extra CAKE options on the ingress (download) qdisc
    pub download_options: Vec<String>,
    /// Timeout for each control command (seconds)
    pub command_timeout_secs: u64,
}

impl Default for QdiscConfig {
    fn default() -> Self {
        Self {
            tc_binary: "tc".into(),
            ip_binary: "ip".into(),
            upload_options: ["diffserv4", "nat", "dual-srchost", "ack-filter"]
                .into_iter()
                .map(String::from)
                .collect(),
            download_options: ["diffserv4", "nat", "dual-dsthost", "ingress", "wash"]
                .into_iter()
                .map(String::from)
                .collect(),
            command_timeout_secs: 10,
        }
    }
}

/// Packet classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// `nft` binary
    pub nft_binary: String,
    /// nftables family
    pub family: String,
    /// nftables table owned by the shaper
    pub table: String,
    /// Named counter of classified game packets
    pub counter: String,
    /// UDP destination ports or ranges (`"27015-27030"`)
    pub udp_ports: Vec<String>,
    /// TCP destination ports or ranges
    pub tcp_ports: Vec<String>,
    /// Game server networks (CIDR)
    pub hosts: Vec<String>,
    /// DSCP class set on classified packets
    pub dscp: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            nft_binary: "nft".into(),
            family: "inet".into(),
            table: "sase_shaper".into(),
            counter: "game_pkts".into(),
            udp_ports: vec!["3074".into(), "3478-3480".into(), "27015-27030".into()],
            tcp_ports: vec!["3074".into()],
            hosts: Vec::new(),
            dscp: "cs4".into(),
        }
    }
}

/// Which mode set the state machine derives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeVariant {
    /// Normal / elevated only
    Simple,
    /// Adds congestion and telemetry sub-modes
    Extended,
}

/// Mode state machine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    /// Mode set
    pub variant: ModeVariant,
    /// Score cap
    pub score_max: u32,
    /// Score added per tick with detected activity
    pub activity_increment: u32,
    /// Score removed per idle tick
    pub decay: u32,
    /// Score at which elevated mode engages
    pub enter_threshold: u32,
    /// Hold window after each detection (seconds)
    pub hold_secs: u64,
    /// Classified packets per tick above which activity is detected
    pub spike_threshold: u64,
    /// Congestion confidence at or above which a tight sub-mode is chosen
    pub tight_confidence: f32,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            variant: ModeVariant::Extended,
            score_max: 30,
            activity_increment: 5,
            decay: 1,
            enter_threshold: 12,
            hold_secs: 300,
            spike_threshold: 10,
            tight_confidence: 0.75,
        }
    }
}

/// Congestion watermarks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    /// Backlog above which congestion is medium
    pub backlog_low_bytes: u64,
    /// Backlog above which congestion is high
    pub backlog_high_bytes: u64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            backlog_low_bytes: 10_000,
            backlog_high_bytes: 50_000,
        }
    }
}

/// Percentages of the base rate pair for one mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateProfile {
    /// Download share of the base rate
    pub down_pct: u32,
    /// Upload share of the base rate
    pub up_pct: u32,
}

impl RateProfile {
    /// Apply the profile to a base pair
    pub fn apply(&self, base: RatePair) -> RatePair {
        base.scaled(self.down_pct, self.up_pct)
    }
}

/// Per-mode rate profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// No game traffic
    pub normal: RateProfile,
    /// No game traffic, congested queue
    pub normal_tight: RateProfile,
    /// Game traffic
    pub elevated: RateProfile,
    /// Game traffic, congested queue
    pub elevated_tight: RateProfile,
    /// Game traffic, frame times over budget
    pub elevated_telemetry_tight: RateProfile,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            normal: RateProfile { down_pct: 100, up_pct: 100 },
            normal_tight: RateProfile { down_pct: 95, up_pct: 92 },
            elevated: RateProfile { down_pct: 90, up_pct: 85 },
            elevated_tight: RateProfile { down_pct: 80, up_pct: 75 },
            elevated_telemetry_tight: RateProfile { down_pct: 85, up_pct: 80 },
        }
    }
}

impl ProfileConfig {
    /// Profile for a mode
    pub fn for_mode(&self, mode: Mode) -> RateProfile {
        match mode {
            Mode::Normal => self.normal,
            Mode::NormalTight => self.normal_tight,
            Mode::Elevated => self.elevated,
            Mode::ElevatedTight => self.elevated_tight,
            Mode::ElevatedTelemetryTight => self.elevated_telemetry_tight,
        }
    }
}

/// Frame-time telemetry bias
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// File holding the latest frame time in milliseconds
    pub frame_time_path: Option<PathBuf>,
    /// Frame-time budget (milliseconds)
    pub budget_ms: f64,
    /// Readings older than this are ignored (seconds)
    pub max_age_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            frame_time_path: None,
            budget_ms: 16.7,
            max_age_secs: 10,
        }
    }
}

/// Time-of-day window, may wrap past midnight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindowConfig {
    /// Start, `HH:MM`
    pub start: String,
    /// End, `HH:MM`
    pub end: String,
}

impl TimeWindowConfig {
    /// Parse into a [`TimeWindow`]
    pub fn parse(&self) -> Result<TimeWindow> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .map_err(|e| ShaperError::Config(format!("invalid time {:?}: {}", s, e)))
        };
        Ok(TimeWindow {
            start: parse(&self.start)?,
            end: parse(&self.end)?,
        })
    }
}

/// Parsed time-of-day window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Inclusive start
    pub start: NaiveTime,
    /// Exclusive end
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Whether `t` falls inside the window
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// IP version passed to the measurement tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    /// IPv4
    #[serde(rename = "4")]
    V4,
    /// IPv6
    #[serde(rename = "6")]
    V6,
}

impl IpVersion {
    /// Command-line flag for the tool
    pub fn flag(&self) -> &'static str {
        match self {
            IpVersion::V4 => "-4",
            IpVersion::V6 => "-6",
        }
    }
}

/// Measurement-driven retuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutotuneConfig {
    /// Measurement tool
    pub tool: String,
    /// Protocol version
    pub ip_version: IpVersion,
    /// Tool timeout (seconds)
    pub timeout_secs: u64,
    /// Substrings that invalidate tool output
    pub error_markers: Vec<String>,
    /// Download target as percentage of measured
    pub down_pct: u32,
    /// Upload target as percentage of measured
    pub up_pct: u32,
    /// Lowest download target (Mbit/s)
    pub floor_down_mbit: u32,
    /// Highest download target (Mbit/s)
    pub ceiling_down_mbit: u32,
    /// Lowest upload target (Mbit/s)
    pub floor_up_mbit: u32,
    /// Highest upload target (Mbit/s)
    pub ceiling_up_mbit: u32,
    /// Minimum download change to re-apply (percent)
    pub change_threshold_down_pct: u32,
    /// Minimum upload change to re-apply (percent)
    pub change_threshold_up_pct: u32,
    /// Local time window during which measurement never runs
    pub exclusion_window: Option<TimeWindowConfig>,
    /// Skip measurement while game traffic is active
    pub skip_on_activity: bool,
    /// Rate sampling window (seconds)
    pub sample_window_secs: u64,
    /// Link is busy at or above this receive rate (bytes/s)
    pub busy_rx_bps: u64,
    /// Link is busy at or above this transmit rate (bytes/s)
    pub busy_tx_bps: u64,
    /// Idle enough to measure at or below this receive rate (bytes/s)
    pub idle_rx_bps: u64,
    /// Idle enough to measure at or below this transmit rate (bytes/s)
    pub idle_tx_bps: u64,
    /// Delay before the daemon's first measurement (seconds)
    pub initial_delay_secs: u64,
    /// Period between measurements (seconds)
    pub interval_secs: u64,
    /// Retry delay after a skipped measurement (seconds)
    pub retry_secs: u64,
    /// Retry delay when the link was busy (seconds)
    pub busy_retry_secs: u64,
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self {
            tool: "speedtest-netperf.sh".into(),
            ip_version: IpVersion::V4,
            timeout_secs: 180,
            error_markers: vec![
                "WARNING: netperf returned errors".into(),
                "ERROR:".into(),
                "Unable to".into(),
                "failed".into(),
            ],
            down_pct: 90,
            up_pct: 88,
            floor_down_mbit: 10,
            ceiling_down_mbit: 1000,
            floor_up_mbit: 2,
            ceiling_up_mbit: 200,
            change_threshold_down_pct: 10,
            change_threshold_up_pct: 6,
            exclusion_window: None,
            skip_on_activity: true,
            sample_window_secs: 2,
            busy_rx_bps: 1_250_000,
            busy_tx_bps: 250_000,
            idle_rx_bps: 250_000,
            idle_tx_bps: 62_500,
            initial_delay_secs: 300,
            interval_secs: 4 * 3600,
            retry_secs: 900,
            busy_retry_secs: 1800,
        }
    }
}

/// Control loop pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Normal sleep between iterations (seconds)
    pub base_secs: u64,
    /// Sleep while the host is loaded (seconds)
    pub loaded_secs: u64,
    /// 1-minute load average above which the loaded interval applies
    pub load_ceiling: f64,
    /// Load average source
    pub loadavg_path: PathBuf,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            base_secs: 2,
            loaded_secs: 5,
            load_ceiling: 1.5,
            loadavg_path: PathBuf::from("/proc/loadavg"),
        }
    }
}

/// Persisted state locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory of state files
    pub dir: PathBuf,
    /// Instance lock marker
    pub lock_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/opensase/shaper"),
            lock_path: PathBuf::from("/run/sase-shaper.lock"),
        }
    }
}
