//! Stash & Undo: every closure is recoverable.
//!
//! Firing writes a [`StashedTab`] before asking the host to close the tab, and
//! coalesces closures into one undo group per undo window. The group is ended
//! only by the `undo_expire` timer (or by undo itself).

use tracing::{debug, info};
use ulid::Ulid;

use crate::host::Effects;
use crate::store::Snapshot;
use crate::types::{Millis, RuntimeState, StashedTab, TabInfo, UndoGroup};

pub const UNDO_EXPIRE_TIMER: &str = "undo_expire";
pub const STASH_SWEEP_TIMER: &str = "stash_cleanup";

/// Stashes `tab`, asks the host to close it, and records the closure in the
/// undo group. Returns the new stash id.
pub fn fire(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tab: &TabInfo,
    closed_by: &str,
    now: Millis,
    undo_window_ms: Millis,
) -> String {
    let url = tab.url.clone().unwrap_or_default();
    let entry = StashedTab {
        id: Ulid::new().to_string(),
        title: tab
            .title
            .clone()
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| url.clone()),
        url,
        fav_icon_url: tab.fav_icon_url.clone().unwrap_or_default(),
        closed_at: now,
        closed_by: closed_by.to_string(),
        expires_at: now + snapshot.settings.stash_ttl_ms(),
    };
    let stash_id = entry.id.clone();

    info!(
        tab_id = tab.id,
        stash_id = %stash_id,
        closed_by = %closed_by,
        "Stashing and closing tab"
    );
    snapshot.stash.push(entry);
    effects.close_tab(tab.id);
    snapshot.settings.pending_clean_count += 1;
    record_closure(&mut snapshot.runtime, effects, &stash_id, now, undo_window_ms);
    stash_id
}

/// Joins the open undo group, or opens a new one once the window has lapsed,
/// then (re)arms the expiry timer.
pub fn record_closure(
    runtime: &mut RuntimeState,
    effects: &mut Effects,
    stash_id: &str,
    now: Millis,
    undo_window_ms: Millis,
) {
    match runtime.pending_undo_group.as_mut() {
        Some(group) if now - group.closed_at <= undo_window_ms => {
            group.stash_ids.push(stash_id.to_string());
        }
        _ => {
            runtime.pending_undo_group = Some(UndoGroup {
                stash_ids: vec![stash_id.to_string()],
                closed_at: now,
            });
        }
    }
    effects.schedule(UNDO_EXPIRE_TIMER, now.saturating_add(undo_window_ms));
}

/// Reopens every tab of the current undo group. Ids that were already
/// restored or swept are skipped. Returns the number of reopened tabs.
pub fn undo(snapshot: &mut Snapshot, effects: &mut Effects) -> usize {
    let Some(group) = snapshot.runtime.pending_undo_group.take() else {
        return 0;
    };
    effects.cancel(UNDO_EXPIRE_TIMER);

    let restored = restore(snapshot, effects, &group.stash_ids);
    let settings = &mut snapshot.settings;
    settings.pending_clean_count = settings
        .pending_clean_count
        .saturating_sub(group.stash_ids.len() as u64);
    info!(restored, group_size = group.stash_ids.len(), "Undo applied");
    restored
}

/// Reopens the given stash entries and removes them from the stash.
/// Unknown ids are ignored.
pub fn restore(snapshot: &mut Snapshot, effects: &mut Effects, stash_ids: &[String]) -> usize {
    let mut restored = 0;
    snapshot.stash.retain(|entry| {
        if stash_ids.contains(&entry.id) {
            effects.open_tab(&entry.url);
            restored += 1;
            false
        } else {
            true
        }
    });
    debug!(requested = stash_ids.len(), restored, "Restored from stash");
    restored
}

/// Removes the given stash entries without reopening them.
pub fn delete(stash: &mut Vec<StashedTab>, stash_ids: &[String]) -> usize {
    let before = stash.len();
    stash.retain(|entry| !stash_ids.contains(&entry.id));
    before - stash.len()
}

/// Drops every entry whose `expires_at` has passed.
pub fn sweep_expired(stash: &mut Vec<StashedTab>, now: Millis) -> usize {
    let before = stash.len();
    stash.retain(|entry| entry.expires_at > now);
    let removed = before - stash.len();
    if removed > 0 {
        info!(removed, remaining = stash.len(), "Swept expired stash entries");
    }
    removed
}
