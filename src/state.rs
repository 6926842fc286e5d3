//! Persisted controller state
//!
//! One small line-oriented file per item. A missing or malformed file reads
//! as absent, which is the cold-start condition.

use crate::{ControllerState, Mode, RatePair, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const LAST_RATES: &str = "last_rates";
const PREV_MODE: &str = "prev_mode";
const MODE_SCORE: &str = "mode_score";
const HOLD_UNTIL: &str = "hold_until";

/// File-backed state store
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Store rooted at `dir` (created lazily on first write)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// State directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Last applied base rate pair
    pub fn last_rates(&self) -> Option<RatePair> {
        let line = self.read(LAST_RATES)?;
        let mut fields = line.split_whitespace().map(u32::from_str);
        let pair = match (fields.next(), fields.next(), fields.next()) {
            (Some(Ok(down)), Some(Ok(up)), None) => RatePair::new(down, up),
            _ => {
                tracing::warn!("Ignoring malformed {} state: {:?}", LAST_RATES, line);
                return None;
            }
        };
        pair.usable()
    }

    /// Persist the last applied base rate pair
    pub fn save_last_rates(&self, rates: RatePair) -> Result<()> {
        self.write(LAST_RATES, &format!("{} {}", rates.download_mbit, rates.upload_mbit))
    }

    /// Previously applied mode
    pub fn prev_mode(&self) -> Option<Mode> {
        self.parse(PREV_MODE)
    }

    /// Persist the applied mode
    pub fn save_prev_mode(&self, mode: Mode) -> Result<()> {
        self.write(PREV_MODE, mode.label())
    }

    /// Restore score, hold deadline and mode; absent items take defaults
    pub fn controller_state(&self) -> ControllerState {
        ControllerState {
            score: self.parse(MODE_SCORE).unwrap_or(0),
            hold_until: self.parse(HOLD_UNTIL).unwrap_or(0),
            mode: self.prev_mode().unwrap_or_default(),
        }
    }

    /// Persist score and hold deadline
    pub fn save_controller_state(&self, state: &ControllerState) -> Result<()> {
        self.write(MODE_SCORE, &state.score.to_string())?;
        self.write(HOLD_UNTIL, &state.hold_until.to_string())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Option<T> {
        let line = self.read(name)?;
        match line.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring malformed {} state: {:?}", name, line);
                None
            }
        }
    }

    fn read(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.dir.join(name))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn write(&self, name: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!(".{}.tmp", name));
        fs::write(&tmp, format!("{}\n", value))?;
        fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        assert_eq!(store.last_rates(), None);
        assert_eq!(store.prev_mode(), None);
        assert_eq!(store.controller_state(), ControllerState::default());
    }

    #[test]
    fn test_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save_last_rates(RatePair::new(450, 40)).unwrap();
        store.save_prev_mode(Mode::ElevatedTight).unwrap();
        store
            .save_controller_state(&ControllerState { score: 17, hold_until: 1_700_000_300, mode: Mode::Elevated })
            .unwrap();

        let reopened = StateStore::new(dir.path());
        assert_eq!(reopened.last_rates(), Some(RatePair::new(450, 40)));
        let state = reopened.controller_state();
        assert_eq!(state.score, 17);
        assert_eq!(state.hold_until, 1_700_000_300);
        assert_eq!(state.mode, Mode::ElevatedTight);
    }

    #[test]
    fn test_malformed_files_read_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(dir.path().join(LAST_RATES), "fast slow\n").unwrap();
        fs::write(dir.path().join(PREV_MODE), "warp\n").unwrap();
        fs::write(dir.path().join(MODE_SCORE), "-3\n").unwrap();
        assert_eq!(store.last_rates(), None);
        assert_eq!(store.prev_mode(), None);
        assert_eq!(store.controller_state().score, 0);
    }

    #[test]
    fn test_zero_rate_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(dir.path().join(LAST_RATES), "0 20\n").unwrap();
        assert_eq!(store.last_rates(), None);
    }
}
