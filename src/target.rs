//! Target Rate Calculator and measurement change gate

use crate::config::AutotuneConfig;
use crate::RatePair;

/// Shaping target as `pct` percent of `measured`, clamped to `[floor, ceiling]`
pub fn compute_target(measured: u32, pct: u32, floor: u32, ceiling: u32) -> u32 {
    let raw = (u64::from(measured) * u64::from(pct) / 100) as u32;
    raw.max(floor).min(ceiling)
}

/// Targets for both directions from a measured pair
pub fn target_for(measured: RatePair, cfg: &AutotuneConfig) -> RatePair {
    RatePair {
        download_mbit: compute_target(
            measured.download_mbit,
            cfg.down_pct,
            cfg.floor_down_mbit,
            cfg.ceiling_down_mbit,
        ),
        upload_mbit: compute_target(
            measured.upload_mbit,
            cfg.up_pct,
            cfg.floor_up_mbit,
            cfg.ceiling_up_mbit,
        ),
    }
}

/// Whether `new` differs from `old` by at least `threshold_pct` percent.
///
/// No baseline (`old == 0`) always counts as a change.
pub fn change_pct_ge(new: u32, old: u32, threshold_pct: u32) -> bool {
    if old == 0 {
        return true;
    }
    let diff = u64::from(new.abs_diff(old));
    diff * 100 >= u64::from(old) * u64::from(threshold_pct)
}

/// Per-direction verdict of the change gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeVerdict {
    /// Download moved past its threshold
    pub download: bool,
    /// Upload moved past its threshold
    pub upload: bool,
}

impl ChangeVerdict {
    /// The pair is re-applied when either direction moved
    pub fn should_apply(&self) -> bool {
        self.download || self.upload
    }
}

/// Evaluate both directions against the last applied pair
pub fn change_gate(target: RatePair, applied: Option<RatePair>, cfg: &AutotuneConfig) -> ChangeVerdict {
    let Some(applied) = applied.and_then(RatePair::usable) else {
        return ChangeVerdict { download: true, upload: true };
    };
    ChangeVerdict {
        download: change_pct_ge(
            target.download_mbit,
            applied.download_mbit,
            cfg.change_threshold_down_pct,
        ),
        upload: change_pct_ge(
            target.upload_mbit,
            applied.upload_mbit,
            cfg.change_threshold_up_pct,
        ),
    }
}
