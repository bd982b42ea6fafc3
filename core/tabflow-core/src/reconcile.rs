//! Startup reconciliation.
//!
//! Persisted runtime state may have outlived the tabs and timers it refers to
//! (host restart, daemon restart, reconnect). [`reconcile`] brings it back in
//! line with the live tab inventory; [`startup`] adds the full rebuild and the
//! stash sweep that run once per session.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::{is_protected, rule_matches_url};
use crate::host::{Effects, TabInventory};
use crate::scheduler::{rebuild_all, unregister};
use crate::stash::{sweep_expired, STASH_SWEEP_TIMER, UNDO_EXPIRE_TIMER};
use crate::store::Snapshot;
use crate::types::{Millis, TabId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Entries whose tab no longer exists.
    pub dropped: usize,
    /// Entries whose tab now shows a URL their rule no longer owns.
    pub mismatched: usize,
    /// Counting entries whose timer was re-armed at the stored trigger time.
    pub rearmed: usize,
    /// Counting entries found past due, reset to Pending instead of fired.
    pub reset: usize,
    /// Registrations made by the rebuild that follows.
    pub registered: usize,
    pub swept: usize,
}

/// Reconciles runtime state with the open tabs.
///
/// A countdown that should already have fired is never fired here: it is
/// reset to Pending (`trigger_at == 0`) and left for the rebuild to restart.
pub fn reconcile(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    config: &EngineConfig,
    now: Millis,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let live = tabs.all_tabs();
    let open: HashSet<TabId> = live.iter().map(|tab| tab.id).collect();
    let rules = &snapshot.rules;
    let protected = &snapshot.settings.protected_domains;
    let runtime = &mut snapshot.runtime;

    for tab in &live {
        runtime.tab_created_at.entry(tab.id).or_insert(now);
    }
    runtime.tab_created_at.retain(|tab_id, _| open.contains(tab_id));

    let closed: Vec<TabId> = runtime
        .managed_tabs
        .keys()
        .filter(|tab_id| !open.contains(tab_id))
        .copied()
        .collect();
    for tab_id in closed {
        unregister(runtime, effects, tab_id);
        report.dropped += 1;
    }

    // Navigation may have happened while nobody was listening.
    let mismatched: Vec<TabId> = runtime
        .managed_tabs
        .values()
        .filter(|entry| {
            let url = live
                .iter()
                .find(|tab| tab.id == entry.tab_id)
                .and_then(|tab| tab.url.as_deref());
            let rule = rules
                .iter()
                .find(|rule| rule.id == entry.rule_id && rule.enabled);
            match (url, rule) {
                (Some(url), Some(rule)) => {
                    is_protected(url, protected) || !rule_matches_url(rule, url)
                }
                _ => true,
            }
        })
        .map(|entry| entry.tab_id)
        .collect();
    for tab_id in mismatched {
        debug!(tab_id, "Entry no longer matches its tab; unregistering");
        unregister(runtime, effects, tab_id);
        report.mismatched += 1;
    }

    for entry in runtime.managed_tabs.values_mut() {
        if !entry.is_counting() {
            continue;
        }
        if entry.trigger_at > now {
            effects.schedule(&entry.timer_name, entry.trigger_at);
            report.rearmed += 1;
        } else {
            warn!(
                tab_id = entry.tab_id,
                rule_id = %entry.rule_id,
                overdue_ms = now - entry.trigger_at,
                "Countdown past due at startup; resetting instead of closing"
            );
            effects.cancel(&entry.timer_name);
            entry.reset_to_pending();
            report.reset += 1;
        }
    }

    let undo_window = config.undo_window_ms();
    if let Some(closed_at) = runtime.pending_undo_group.as_ref().map(|group| group.closed_at) {
        if now - closed_at > undo_window {
            runtime.pending_undo_group = None;
        } else {
            effects.schedule(UNDO_EXPIRE_TIMER, closed_at.saturating_add(undo_window));
        }
    }

    if runtime
        .last_active_tab_id
        .is_some_and(|tab_id| !open.contains(&tab_id))
    {
        runtime.last_active_tab_id = None;
    }

    report
}

/// Full session start: reconcile, register every matching tab, sweep the
/// stash, and arm the periodic sweep.
pub fn startup(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    config: &EngineConfig,
    now: Millis,
) -> ReconcileReport {
    let mut report = reconcile(snapshot, effects, tabs, config, now);
    report.registered = rebuild_all(
        &mut snapshot.runtime,
        effects,
        &snapshot.rules,
        &snapshot.settings.protected_domains,
        tabs,
        now,
    );
    report.swept = sweep_expired(&mut snapshot.stash, now);
    effects.schedule(
        STASH_SWEEP_TIMER,
        now.saturating_add(config.stash_sweep_interval_ms()),
    );

    info!(
        dropped = report.dropped,
        mismatched = report.mismatched,
        rearmed = report.rearmed,
        reset = report.reset,
        registered = report.registered,
        swept = report.swept,
        "Startup reconciliation complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Effect;
    use crate::scheduler::register_counting;
    use crate::types::{Rule, RuleAction, RuleSource, RuleStats, TabInfo, Trigger, UndoGroup};

    struct Tabs(Vec<TabInfo>);

    impl TabInventory for Tabs {
        fn all_tabs(&self) -> Vec<TabInfo> {
            self.0.clone()
        }

        fn get_tab(&self, tab_id: TabId) -> Option<TabInfo> {
            self.0.iter().find(|tab| tab.id == tab_id).cloned()
        }
    }

    fn tab(id: TabId, url: &str) -> TabInfo {
        TabInfo {
            id,
            window_id: 1,
            url: Some(url.to_string()),
            title: None,
            fav_icon_url: None,
            active: false,
        }
    }

    fn video_rule() -> Rule {
        Rule {
            id: "r1".to_string(),
            name: "video.test · 1hr".to_string(),
            enabled: true,
            domains: vec!["video.test".to_string()],
            trigger: Trigger::open_duration(60),
            action: RuleAction::CloseStash,
            source: RuleSource::Manual,
            stats: RuleStats::default(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn past_due_entries_are_reset_not_fired() {
        let rule = video_rule();
        let mut snapshot = Snapshot::default();
        snapshot.rules.push(rule.clone());
        register_counting(&mut snapshot.runtime, &mut Effects::new(), &rule, 1, 0);
        let tabs = Tabs(vec![tab(1, "https://video.test")]);

        let mut effects = Effects::new();
        let report = reconcile(
            &mut snapshot,
            &mut effects,
            &tabs,
            &EngineConfig::default(),
            4_000_000,
        );

        assert_eq!(report.reset, 1);
        assert_eq!(snapshot.runtime.managed_tabs[&1].trigger_at, 0);
        assert!(!effects
            .as_slice()
            .iter()
            .any(|effect| matches!(effect, Effect::CloseTab { .. })));
    }

    #[test]
    fn future_entries_are_rearmed_and_closed_tabs_dropped() {
        let rule = video_rule();
        let mut snapshot = Snapshot::default();
        snapshot.rules.push(rule.clone());
        register_counting(&mut snapshot.runtime, &mut Effects::new(), &rule, 1, 0);
        register_counting(&mut snapshot.runtime, &mut Effects::new(), &rule, 2, 0);
        snapshot.runtime.last_active_tab_id = Some(2);
        snapshot.runtime.tab_created_at.insert(2, 0);
        let kept = snapshot.runtime.managed_tabs[&1].clone();
        let tabs = Tabs(vec![tab(1, "https://video.test")]);

        let mut effects = Effects::new();
        let report = reconcile(&mut snapshot, &mut effects, &tabs, &EngineConfig::default(), 1_000);

        assert_eq!(report.dropped, 1);
        assert_eq!(report.rearmed, 1);
        assert_eq!(snapshot.runtime.managed_tabs[&1], kept);
        assert_eq!(snapshot.runtime.last_active_tab_id, None);
        assert_eq!(
            snapshot.runtime.tab_created_at.keys().copied().collect::<Vec<_>>(),
            vec![1]
        );
        assert!(effects.as_slice().contains(&Effect::ScheduleTimer {
            name: kept.timer_name,
            at: kept.trigger_at
        }));
    }

    #[test]
    fn entries_are_dropped_when_the_tab_left_the_rule() {
        let rule = video_rule();
        let mut snapshot = Snapshot::default();
        snapshot.rules.push(rule.clone());
        snapshot.settings.protected_domains.push("kids.video.test".to_string());
        for tab_id in 1..=3 {
            register_counting(&mut snapshot.runtime, &mut Effects::new(), &rule, tab_id, 0);
        }
        let moved_timer = snapshot.runtime.managed_tabs[&1].timer_name.clone();
        let tabs = Tabs(vec![
            tab(1, "https://docs.test/page"),
            tab(2, "https://kids.video.test/watch"),
            tab(3, "https://video.test/watch"),
        ]);

        let mut effects = Effects::new();
        let report = startup(&mut snapshot, &mut effects, &tabs, &EngineConfig::default(), 1_000);

        assert_eq!(report.mismatched, 2);
        assert_eq!(
            snapshot.runtime.managed_tabs.keys().copied().collect::<Vec<_>>(),
            vec![3]
        );
        assert!(effects
            .as_slice()
            .contains(&Effect::CancelTimer { name: moved_timer.clone() }));
        assert!(!effects.as_slice().iter().any(|effect| matches!(
            effect,
            Effect::ScheduleTimer { name, .. } if *name == moved_timer
        )));
    }

    #[test]
    fn entries_of_a_disabled_rule_are_dropped() {
        let mut rule = video_rule();
        let mut snapshot = Snapshot::default();
        register_counting(&mut snapshot.runtime, &mut Effects::new(), &rule, 1, 0);
        rule.enabled = false;
        snapshot.rules.push(rule);
        let tabs = Tabs(vec![tab(1, "https://video.test")]);

        let report = reconcile(
            &mut snapshot,
            &mut Effects::new(),
            &tabs,
            &EngineConfig::default(),
            1_000,
        );

        assert_eq!(report.mismatched, 1);
        assert!(snapshot.runtime.managed_tabs.is_empty());
    }

    #[test]
    fn undo_group_survives_only_inside_its_window() {
        let tabs = Tabs(Vec::new());
        let config = EngineConfig::default();
        let mut snapshot = Snapshot::default();
        snapshot.runtime.pending_undo_group = Some(UndoGroup {
            stash_ids: vec!["s1".to_string()],
            closed_at: 10_000,
        });

        let mut effects = Effects::new();
        reconcile(&mut snapshot, &mut effects, &tabs, &config, 12_000);
        assert!(snapshot.runtime.pending_undo_group.is_some());
        assert_eq!(
            effects.into_vec(),
            vec![Effect::ScheduleTimer {
                name: UNDO_EXPIRE_TIMER.to_string(),
                at: 15_000
            }]
        );

        reconcile(&mut snapshot, &mut Effects::new(), &tabs, &config, 20_000);
        assert!(snapshot.runtime.pending_undo_group.is_none());
    }

    #[test]
    fn startup_restarts_past_due_countdown_and_arms_sweep() {
        let rule = video_rule();
        let mut snapshot = Snapshot::default();
        snapshot.rules.push(rule.clone());
        register_counting(&mut snapshot.runtime, &mut Effects::new(), &rule, 1, 0);
        let tabs = Tabs(vec![tab(1, "https://video.test")]);
        let now = 4_000_000;

        let mut effects = Effects::new();
        let report = startup(&mut snapshot, &mut effects, &tabs, &EngineConfig::default(), now);

        assert_eq!(report.reset, 1);
        assert_eq!(report.registered, 1);
        assert_eq!(snapshot.runtime.managed_tabs[&1].trigger_at, now + 3_600_000);
        assert_eq!(
            effects.as_slice().last(),
            Some(&Effect::ScheduleTimer {
                name: STASH_SWEEP_TIMER.to_string(),
                at: now + 3_600_000
            })
        );
    }
}
