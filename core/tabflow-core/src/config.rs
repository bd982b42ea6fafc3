//! Engine timing policy.
//!
//! Deserializes from the `[engine]` table of the daemon's TOML config. Every
//! field is optional there; missing fields keep the defaults below.

use serde::Deserialize;

use crate::types::Millis;

pub const HUMAN_ACTIVITY_GUARD_SECS: u64 = 15;
pub const GUARD_RETRY_SECS: u64 = 60;
pub const UNDO_WINDOW_SECS: u64 = 5;
pub const STASH_SWEEP_INTERVAL_MINUTES: u64 = 60;
/// Ceiling for every configured interval: one week.
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Firing is deferred while the last user interaction is this recent.
    pub guard_window_secs: u64,
    /// How far a guarded firing is pushed back.
    pub guard_retry_secs: u64,
    /// Closures this close together share one undo group.
    pub undo_window_secs: u64,
    pub stash_sweep_interval_minutes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            guard_window_secs: HUMAN_ACTIVITY_GUARD_SECS,
            guard_retry_secs: GUARD_RETRY_SECS,
            undo_window_secs: UNDO_WINDOW_SECS,
            stash_sweep_interval_minutes: STASH_SWEEP_INTERVAL_MINUTES,
        }
    }
}

impl EngineConfig {
    pub fn guard_window_ms(&self) -> Millis {
        secs_to_ms(self.guard_window_secs)
    }

    pub fn guard_retry_ms(&self) -> Millis {
        secs_to_ms(self.guard_retry_secs.max(1))
    }

    pub fn undo_window_ms(&self) -> Millis {
        secs_to_ms(self.undo_window_secs)
    }

    pub fn stash_sweep_interval_ms(&self) -> Millis {
        secs_to_ms(self.stash_sweep_interval_minutes.max(1).saturating_mul(60))
    }
}

fn secs_to_ms(secs: u64) -> Millis {
    // Bounded, so `now + interval` cannot overflow.
    Millis::try_from(secs.min(MAX_INTERVAL_SECS) * 1000).unwrap_or(Millis::MAX)
}
