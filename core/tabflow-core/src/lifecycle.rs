//! Per-tab lifecycle: Unmanaged → Pending ⇄ Counting → Fired/Unregistered.
//!
//! [`apply_event`] is the single dispatcher over host events. It only mutates
//! the snapshot and appends effects; persistence and side effects belong to
//! the caller.

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::domain::{find_matching_rule, is_protected, rule_matches_url};
use crate::host::{Effects, TabInventory};
use crate::scheduler::{parse_timer_tab_id, register_counting, register_for_match, unregister};
use crate::stash::{self, STASH_SWEEP_TIMER, UNDO_EXPIRE_TIMER};
use crate::store::Snapshot;
use crate::types::{Millis, RuntimeState, TabId, TriggerKind, WindowId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabEvent {
    Created { tab_id: TabId },
    /// Navigation to a new URL, or a load-complete carrying the URL.
    Navigated { tab_id: TabId, url: String },
    /// The user switched to `tab_id`; the previous tab is read from runtime state.
    Activated { tab_id: TabId },
    Removed { tab_id: TabId },
    /// `None` when no browser window has OS focus.
    FocusChanged { window_id: Option<WindowId> },
    TimerFired { name: String },
}

pub fn apply_event(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    config: &EngineConfig,
    now: Millis,
    event: &TabEvent,
) {
    match event {
        TabEvent::Created { tab_id } => {
            snapshot.runtime.tab_created_at.entry(*tab_id).or_insert(now);
        }
        TabEvent::Navigated { tab_id, url } => on_navigated(snapshot, effects, tabs, *tab_id, url, now),
        TabEvent::Activated { tab_id } => on_activated(snapshot, effects, tabs, *tab_id, now),
        TabEvent::Removed { tab_id } => {
            let runtime = &mut snapshot.runtime;
            unregister(runtime, effects, *tab_id);
            runtime.tab_created_at.remove(tab_id);
            if runtime.last_active_tab_id == Some(*tab_id) {
                runtime.last_active_tab_id = None;
            }
        }
        TabEvent::FocusChanged { window_id } => {
            on_focus_changed(snapshot, effects, tabs, *window_id, now)
        }
        TabEvent::TimerFired { name } => on_timer_fired(snapshot, effects, tabs, config, name, now),
    }
}

fn on_navigated(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    tab_id: TabId,
    url: &str,
    now: Millis,
) {
    if is_protected(url, &snapshot.settings.protected_domains) {
        unregister(&mut snapshot.runtime, effects, tab_id);
        return;
    }

    // Same-site navigation must not reset the countdown.
    if let Some(existing) = snapshot.runtime.managed_tabs.get(&tab_id) {
        let still_applies = snapshot
            .rule(&existing.rule_id)
            .map(|rule| rule.enabled && rule_matches_url(rule, url))
            .unwrap_or(false);
        if still_applies {
            debug!(tab_id, rule_id = %existing.rule_id, "Navigation kept existing countdown");
            return;
        }
    }

    unregister(&mut snapshot.runtime, effects, tab_id);

    let Some(rule) =
        find_matching_rule(url, &snapshot.rules, &snapshot.settings.protected_domains).cloned()
    else {
        return;
    };
    let Some(tab) = tabs.get_tab(tab_id) else {
        return;
    };
    register_for_match(&mut snapshot.runtime, effects, &rule, tab_id, tab.active, now);
}

fn on_activated(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    tab_id: TabId,
    now: Millis,
) {
    snapshot.runtime.last_user_interaction_at = now;
    let previous = snapshot.runtime.last_active_tab_id.replace(tab_id);

    if let Some(previous) = previous.filter(|previous| *previous != tab_id) {
        promote_if_pending(snapshot, effects, tabs, previous, now);
    }
    demote_if_counting(&mut snapshot.runtime, effects, tab_id, now);
}

fn on_focus_changed(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    window_id: Option<WindowId>,
    now: Millis,
) {
    match window_id {
        None => {
            // The user left the browser: even the tab that was on screen is now inactive.
            let pending: Vec<TabId> = snapshot
                .runtime
                .managed_tabs
                .values()
                .filter(|entry| entry.trigger_type == TriggerKind::Inactive && entry.is_pending())
                .map(|entry| entry.tab_id)
                .collect();
            let promoted = pending
                .into_iter()
                .filter(|tab_id| promote_if_pending(snapshot, effects, tabs, *tab_id, now))
                .count();
            debug!(promoted, "Browser lost focus");
        }
        Some(window_id) => {
            snapshot.runtime.last_user_interaction_at = now;
            let Some(active) = tabs.active_tab_in_window(window_id) else {
                return;
            };
            let previous = snapshot.runtime.last_active_tab_id.replace(active);
            if let Some(previous) = previous.filter(|previous| *previous != active) {
                promote_if_pending(snapshot, effects, tabs, previous, now);
            }
            demote_if_counting(&mut snapshot.runtime, effects, active, now);
        }
    }
}

/// Starts the clock on an Inactive entry that is Pending. Entries whose rule
/// is gone or disabled are dropped instead.
fn promote_if_pending(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    tab_id: TabId,
    now: Millis,
) -> bool {
    let Some(entry) = snapshot.runtime.managed_tabs.get(&tab_id) else {
        return false;
    };
    if entry.trigger_type != TriggerKind::Inactive || !entry.is_pending() {
        return false;
    }

    let rule = snapshot
        .rule(&entry.rule_id)
        .filter(|rule| rule.enabled)
        .cloned();
    let Some(rule) = rule else {
        unregister(&mut snapshot.runtime, effects, tab_id);
        return false;
    };
    if tabs.get_tab(tab_id).is_none() {
        return false;
    }
    register_counting(&mut snapshot.runtime, effects, &rule, tab_id, now);
    true
}

/// Pauses an Inactive entry that is Counting, because the user is looking at it.
fn demote_if_counting(runtime: &mut RuntimeState, effects: &mut Effects, tab_id: TabId, now: Millis) {
    let Some(entry) = runtime.managed_tabs.get_mut(&tab_id) else {
        return;
    };
    if entry.trigger_type != TriggerKind::Inactive || !entry.is_counting() {
        return;
    }

    effects.cancel(&entry.timer_name);
    entry.paused_at = Some(now);
    entry.remaining_ms = Some((entry.trigger_at - now).max(0));
    entry.reset_to_pending();
    debug!(tab_id, remaining_ms = ?entry.remaining_ms, "Countdown paused");
}

fn on_timer_fired(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    config: &EngineConfig,
    name: &str,
    now: Millis,
) {
    if name == UNDO_EXPIRE_TIMER {
        if snapshot.runtime.pending_undo_group.take().is_some() {
            debug!("Undo window closed");
        }
        return;
    }

    if name == STASH_SWEEP_TIMER {
        stash::sweep_expired(&mut snapshot.stash, now);
        effects.schedule(STASH_SWEEP_TIMER, now.saturating_add(config.stash_sweep_interval_ms()));
        return;
    }

    let Some(tab_id) = parse_timer_tab_id(name) else {
        debug!(timer = %name, "Ignoring unknown timer");
        return;
    };
    let entry = match snapshot.runtime.managed_tabs.get(&tab_id) {
        Some(entry) if entry.timer_name == name => entry.clone(),
        _ => {
            debug!(timer = %name, tab_id, "Discarding stale timer");
            return;
        }
    };

    let since_interaction = now - snapshot.runtime.last_user_interaction_at;
    if since_interaction < config.guard_window_ms() {
        let trigger_at = now.saturating_add(config.guard_retry_ms());
        if let Some(current) = snapshot.runtime.managed_tabs.get_mut(&tab_id) {
            current.trigger_at = trigger_at;
        }
        effects.schedule(name, trigger_at);
        info!(
            tab_id,
            since_interaction_ms = since_interaction,
            trigger_at,
            "Human activity guard deferred closure"
        );
        return;
    }

    // The timer is spent, so the entry goes without a cancel.
    snapshot.runtime.managed_tabs.remove(&tab_id);
    let Some(tab) = tabs.get_tab(tab_id) else {
        debug!(tab_id, "Timer fired for a tab that no longer exists");
        return;
    };

    stash::fire(
        snapshot,
        effects,
        &tab,
        &entry.rule_name,
        now,
        config.undo_window_ms(),
    );
    if let Some(rule) = snapshot.rules.iter_mut().find(|rule| rule.id == entry.rule_id) {
        rule.stats.triggered_count += 1;
    }
    info!(tab_id, rule_id = %entry.rule_id, "Rule fired");
}
