//! Persisted data model shared by the engine, the daemon and its clients.
//!
//! All timestamps are Unix epoch milliseconds. Every struct tolerates missing
//! fields on load (`#[serde(default)]`) so older stored values keep decoding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type TabId = i64;
pub type WindowId = i64;
/// Unix epoch milliseconds.
pub type Millis = i64;

const MINUTE_MS: Millis = 60 * 1000;
const DAY_MS: Millis = 24 * 60 * MINUTE_MS;

// ═══════════════════════════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Countdown runs only while the tab is not the one being viewed.
    Inactive,
    /// Countdown runs from the moment the tab starts matching, regardless of focus.
    OpenDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub minutes: u32,
}

impl Trigger {
    pub fn inactive(minutes: u32) -> Self {
        Self {
            kind: TriggerKind::Inactive,
            minutes,
        }
    }

    pub fn open_duration(minutes: u32) -> Self {
        Self {
            kind: TriggerKind::OpenDuration,
            minutes,
        }
    }

    pub fn duration_ms(&self) -> Millis {
        Millis::from(self.minutes) * MINUTE_MS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    CloseStash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    #[default]
    Manual,
    Template,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    #[serde(default)]
    pub triggered_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Root-domain normalized (`www.x.com` is stored as `x.com`).
    pub domains: Vec<String>,
    pub trigger: Trigger,
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default)]
    pub source: RuleSource,
    #[serde(default)]
    pub stats: RuleStats,
    #[serde(default)]
    pub created_at: Millis,
    #[serde(default)]
    pub updated_at: Millis,
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Settings
// ═══════════════════════════════════════════════════════════════════════════════

pub const DEFAULT_STASH_EXPIRY_DAYS: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub stash_expiry_days: u32,
    pub protected_domains: Vec<String>,
    /// Closures the user has not looked at yet.
    pub pending_clean_count: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stash_expiry_days: DEFAULT_STASH_EXPIRY_DAYS,
            protected_domains: Vec::new(),
            pending_clean_count: 0,
        }
    }
}

impl Settings {
    pub fn stash_ttl_ms(&self) -> Millis {
        Millis::from(self.stash_expiry_days.max(1)) * DAY_MS
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runtime State
// ═══════════════════════════════════════════════════════════════════════════════

/// Countdown bookkeeping for one tab.
///
/// `trigger_at == 0` means "matched, not yet counting" (Pending) and implies no
/// live timer; `trigger_at > 0` (Counting) implies a live timer named `timer_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedTabEntry {
    pub tab_id: TabId,
    pub rule_id: String,
    pub rule_name: String,
    pub trigger_type: TriggerKind,
    #[serde(default)]
    pub started_at: Millis,
    #[serde(default)]
    pub trigger_at: Millis,
    #[serde(default)]
    pub timer_name: String,
    /// When the countdown was last paused by the user looking at the tab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<Millis>,
    /// Time that was left on the countdown when it was paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<Millis>,
}

impl ManagedTabEntry {
    pub fn is_counting(&self) -> bool {
        self.trigger_at > 0
    }

    pub fn is_pending(&self) -> bool {
        self.trigger_at == 0
    }

    /// Drops back to Pending. Callers are responsible for cancelling the timer.
    pub(crate) fn reset_to_pending(&mut self) {
        self.trigger_at = 0;
        self.started_at = 0;
        self.timer_name.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoGroup {
    pub stash_ids: Vec<String>,
    pub closed_at: Millis,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
    pub managed_tabs: BTreeMap<TabId, ManagedTabEntry>,
    pub tab_created_at: BTreeMap<TabId, Millis>,
    pub last_user_interaction_at: Millis,
    pub last_active_tab_id: Option<TabId>,
    pub pending_undo_group: Option<UndoGroup>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stash
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashedTab {
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub fav_icon_url: String,
    pub closed_at: Millis,
    /// Name of the rule that closed the tab.
    pub closed_by: String,
    pub expires_at: Millis,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Host view
// ═══════════════════════════════════════════════════════════════════════════════

/// A live tab as reported by the host's tab inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub window_id: WindowId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub fav_icon_url: Option<String>,
    /// Active within its window.
    #[serde(default)]
    pub active: bool,
}

/// A Counting entry as shown in the "closing soon" list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoonTab {
    pub tab_id: TabId,
    pub rule_id: String,
    pub rule_name: String,
    pub trigger_type: TriggerKind,
    pub trigger_at: Millis,
    pub remaining_ms: Millis,
}
