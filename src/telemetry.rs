//! Frame-time telemetry bias

use crate::config::TelemetryConfig;
use std::time::{Duration, SystemTime};

/// True when a fresh frame-time reading exceeds the budget.
///
/// Missing, stale or malformed readings never bias.
pub fn frame_time_bias(cfg: &TelemetryConfig) -> bool {
    let Some(path) = &cfg.frame_time_path else {
        return false;
    };
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or(Duration::MAX);
    if age > Duration::from_secs(cfg.max_age_secs) {
        return false;
    }
    let Some(frame_ms) = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
    else {
        return false;
    };
    frame_ms > cfg.budget_ms
}
