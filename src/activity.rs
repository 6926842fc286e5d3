//! Activity Detector
//!
//! Infers game activity from the classified-packet counter delta between
//! control-loop iterations.

/// Result of one detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activity {
    /// Delta exceeded the spike threshold
    pub active: bool,
    /// Classified packets since the previous reading
    pub delta: u64,
}

/// Compare two counter readings.
///
/// A counter that went backwards (classifier table reloaded) counts as no
/// change rather than a negative spike.
pub fn detect_activity(prev_count: u64, curr_count: u64, spike_threshold: u64) -> Activity {
    let delta = curr_count.saturating_sub(prev_count);
    Activity {
        active: delta > spike_threshold,
        delta,
    }
}

/// Keeps the previous counter reading between ticks
#[derive(Debug)]
pub struct ActivityTracker {
    prev: Option<u64>,
    spike_threshold: u64,
}

impl ActivityTracker {
    /// Create a tracker with no baseline
    pub fn new(spike_threshold: u64) -> Self {
        Self { prev: None, spike_threshold }
    }

    /// Observe a new reading; `None` is a failed read and means no change.
    pub fn observe(&mut self, count: Option<u64>) -> Activity {
        let Some(curr) = count else {
            return Activity { active: false, delta: 0 };
        };
        let activity = match self.prev {
            Some(prev) => detect_activity(prev, curr, self.spike_threshold),
            None => Activity { active: false, delta: 0 },
        };
        self.prev = Some(curr);
        activity
    }
}
