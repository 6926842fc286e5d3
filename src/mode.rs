//! Mode State Machine
//!
//! Combines per-tick activity detections into a bounded score with a hold
//! deadline. Elevated mode holds while the score is at or above the entry
//! threshold, or until the hold deadline passes, whichever lasts longer.
//! The extended variant layers congestion and telemetry sub-modes on top.

use crate::config::{ModeConfig, ModeVariant};
use crate::congestion::CongestionLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shaping profile selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// No latency-sensitive traffic
    #[default]
    Normal,
    /// No game traffic, but the queue is congested
    NormalTight,
    /// Game traffic active
    Elevated,
    /// Game traffic active and the queue is congested
    ElevatedTight,
    /// Game traffic active and frame times exceed the budget
    ElevatedTelemetryTight,
}

impl Mode {
    /// Every mode
    pub const ALL: [Mode; 5] = [
        Mode::Normal,
        Mode::NormalTight,
        Mode::Elevated,
        Mode::ElevatedTight,
        Mode::ElevatedTelemetryTight,
    ];

    /// Stable label used in persisted state and logs
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::NormalTight => "normal_tight",
            Mode::Elevated => "elevated",
            Mode::ElevatedTight => "elevated_tight",
            Mode::ElevatedTelemetryTight => "elevated_telemetry_tight",
        }
    }

    /// Whether this is one of the elevated-priority modes
    pub fn is_elevated(&self) -> bool {
        matches!(
            self,
            Mode::Elevated | Mode::ElevatedTight | Mode::ElevatedTelemetryTight
        )
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Mode::ALL
            .into_iter()
            .find(|m| m.label() == s)
            .ok_or_else(|| format!("unknown mode {:?}", s))
    }
}

/// Inputs observed during one tick
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    /// Game traffic detected since the previous tick
    pub activity_detected: bool,
    /// Congestion confidence for this tick
    pub congestion: CongestionLevel,
    /// Frame-time telemetry exceeds its budget
    pub telemetry_bias: bool,
    /// Current unix time (seconds)
    pub now: u64,
}

/// State owned by the mode state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControllerState {
    /// Bounded activity score
    pub score: u32,
    /// Elevated mode holds until this unix time
    pub hold_until: u64,
    /// Most recently derived mode
    pub mode: Mode,
}

impl ControllerState {
    /// Advance one tick and return the derived mode
    pub fn tick(&mut self, params: &ModeConfig, input: TickInput) -> Mode {
        if input.activity_detected {
            self.score = self
                .score
                .saturating_add(params.activity_increment)
                .min(params.score_max);
            self.hold_until = input.now.saturating_add(params.hold_secs);
        } else {
            self.score = self.score.saturating_sub(params.decay);
        }
        // A persisted score from an older config may exceed a lowered cap
        self.score = self.score.min(params.score_max);

        let elevated = self.score >= params.enter_threshold || input.now < self.hold_until;
        self.mode = derive_mode(params, elevated, input);
        self.mode
    }

    /// Seconds left on the hold window
    pub fn hold_remaining(&self, now: u64) -> u64 {
        self.hold_until.saturating_sub(now)
    }
}

fn derive_mode(params: &ModeConfig, elevated: bool, input: TickInput) -> Mode {
    if params.variant == ModeVariant::Simple {
        return if elevated { Mode::Elevated } else { Mode::Normal };
    }

    let congested = input.congestion.confidence() >= params.tight_confidence;
    match (elevated, congested) {
        (true, true) => Mode::ElevatedTight,
        (true, false) if input.telemetry_bias => Mode::ElevatedTelemetryTight,
        (true, false) => Mode::Elevated,
        (false, true) => Mode::NormalTight,
        (false, false) => Mode::Normal,
    }
}

/// Change gate for mode transitions
pub fn should_apply(new_mode: Mode, prev_mode: Option<Mode>) -> bool {
    prev_mode != Some(new_mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn input(activity: bool, now: u64) -> TickInput {
        TickInput {
            activity_detected: activity,
            congestion: CongestionLevel::Low,
            telemetry_bias: false,
            now,
        }
    }

    #[test]
    fn test_initial_state() {
        let state = ControllerState::default();
        assert_eq!(state.score, 0);
        assert_eq!(state.hold_until, 0);
        assert_eq!(state.mode, Mode::Normal);
    }

    #[test]
    fn test_activity_increments_and_holds() {
        let params = ModeConfig::default();
        let mut state = ControllerState::default();
        let mode = state.tick(&params, input(true, 1000));
        assert_eq!(state.score, 5);
        assert_eq!(state.hold_until, 1300);
        assert_eq!(mode, Mode::Elevated);
    }

    #[test]
    fn test_hold_floor_after_single_spike() {
        let params = ModeConfig::default();
        let mut state = ControllerState::default();
        state.tick(&params, input(true, 0));

        // Every 2s tick without activity stays elevated until the hold expires
        let mut now = 2;
        while now < params.hold_secs {
            assert!(state.tick(&params, input(false, now)).is_elevated(), "dropped at {}", now);
            now += 2;
        }
        assert_eq!(state.tick(&params, input(false, params.hold_secs)), Mode::Normal);
    }

    #[test]
    fn test_score_keeps_elevated_after_hold() {
        let params = ModeConfig { hold_secs: 0, ..ModeConfig::default() };
        let mut state = ControllerState::default();
        for t in 0..6 {
            state.tick(&params, input(true, t));
        }
        assert_eq!(state.score, 30);
        // Score decays 1 per tick: 18 ticks until it falls below 12
        for t in 6..24 {
            assert!(state.tick(&params, input(false, t)).is_elevated());
        }
        assert_eq!(state.score, 12);
        assert_eq!(state.tick(&params, input(false, 24)), Mode::Normal);
    }

    #[test]
    fn test_extended_sub_modes() {
        let params = ModeConfig::default();
        let mut state = ControllerState::default();

        let congested = TickInput { congestion: CongestionLevel::Severe, ..input(true, 10) };
        assert_eq!(state.tick(&params, congested), Mode::ElevatedTight);

        let biased = TickInput { telemetry_bias: true, ..input(true, 12) };
        assert_eq!(state.tick(&params, biased), Mode::ElevatedTelemetryTight);

        // Congestion wins over telemetry bias
        let both = TickInput {
            congestion: CongestionLevel::High,
            telemetry_bias: true,
            ..input(false, 14)
        };
        assert_eq!(state.tick(&params, both), Mode::ElevatedTight);

        let mut idle = ControllerState::default();
        let medium = TickInput { congestion: CongestionLevel::Medium, ..input(false, 10) };
        assert_eq!(idle.tick(&params, medium), Mode::Normal);
        let high = TickInput { congestion: CongestionLevel::High, ..input(false, 12) };
        assert_eq!(idle.tick(&params, high), Mode::NormalTight);
    }

    #[test]
    fn test_simple_variant_ignores_congestion() {
        let params = ModeConfig { variant: ModeVariant::Simple, ..ModeConfig::default() };
        let mut state = ControllerState::default();
        let congested = TickInput { congestion: CongestionLevel::Severe, ..input(true, 0) };
        assert_eq!(state.tick(&params, congested), Mode::Elevated);
        let idle = TickInput { congestion: CongestionLevel::Severe, ..input(false, 400) };
        assert_eq!(state.tick(&params, idle), Mode::Normal);
    }

    #[test]
    fn test_should_apply() {
        assert!(should_apply(Mode::Normal, None));
        assert!(!should_apply(Mode::Elevated, Some(Mode::Elevated)));
        assert!(should_apply(Mode::ElevatedTight, Some(Mode::Elevated)));
    }

    #[test]
    fn test_mode_label_parse() {
        for mode in Mode::ALL {
            assert_eq!(mode.label().parse::<Mode>().unwrap(), mode);
        }
        assert!("turbo".parse::<Mode>().is_err());
    }

    proptest! {
        #[test]
        fn prop_score_stays_bounded(
            start in 0u32..100,
            ticks in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let params = ModeConfig::default();
            let mut state = ControllerState { score: start, ..ControllerState::default() };
            for (i, activity) in ticks.into_iter().enumerate() {
                state.tick(&params, input(activity, i as u64 * 2));
                prop_assert!(state.score <= params.score_max);
            }
        }
    }
}
