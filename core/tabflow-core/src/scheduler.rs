//! Alarm management: trigger timestamps, timer naming, and per-tab entries.
//!
//! Invariant kept by every function here: an entry with `trigger_at > 0` has
//! exactly one live timer named `timer_name`; a Pending entry has none. Any
//! registration cancels the tab's previous timer before scheduling a new one.

use tracing::debug;
use ulid::Ulid;

use crate::domain::{is_protected, rule_matches_url};
use crate::host::{Effects, TabInventory};
use crate::types::{ManagedTabEntry, Millis, Rule, RuntimeState, SoonTab, TabId, TriggerKind};

pub const RULE_TIMER_PREFIX: &str = "rule_";

/// `rule_{ruleId}_{tabId}_{nonce}`. The nonce makes every registration unique,
/// so a timer that fires after its entry was superseded no longer matches.
pub fn timer_name(rule_id: &str, tab_id: TabId) -> String {
    format!("{}{}_{}_{}", RULE_TIMER_PREFIX, rule_id, tab_id, Ulid::new())
}

/// Tab id embedded in a rule timer name. Rule ids may contain underscores, so
/// the name is parsed from the right.
pub fn parse_timer_tab_id(name: &str) -> Option<TabId> {
    let rest = name.strip_prefix(RULE_TIMER_PREFIX)?;
    let mut parts = rest.rsplitn(3, '_');
    let _nonce = parts.next()?;
    let tab_id = parts.next()?;
    let rule_id = parts.next()?;
    if rule_id.is_empty() {
        return None;
    }
    tab_id.parse().ok()
}

/// Starts (or restarts) the countdown for `tab_id` under `rule`.
pub fn register_counting(
    runtime: &mut RuntimeState,
    effects: &mut Effects,
    rule: &Rule,
    tab_id: TabId,
    now: Millis,
) {
    if let Some(existing) = runtime.managed_tabs.get(&tab_id) {
        effects.cancel(&existing.timer_name);
    }

    let trigger_at = now + rule.trigger.duration_ms();
    let name = timer_name(&rule.id, tab_id);
    debug!(
        tab_id,
        rule_id = %rule.id,
        timer = %name,
        trigger_at,
        "Countdown started"
    );

    runtime.managed_tabs.insert(
        tab_id,
        ManagedTabEntry {
            tab_id,
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            trigger_type: rule.trigger.kind,
            started_at: now,
            trigger_at,
            timer_name: name.clone(),
            paused_at: None,
            remaining_ms: None,
        },
    );
    effects.schedule(&name, trigger_at);
}

/// Records a match without counting (Inactive rule on the tab being viewed).
pub fn register_pending(
    runtime: &mut RuntimeState,
    effects: &mut Effects,
    rule: &Rule,
    tab_id: TabId,
) {
    if let Some(existing) = runtime.managed_tabs.get(&tab_id) {
        effects.cancel(&existing.timer_name);
    }

    debug!(tab_id, rule_id = %rule.id, "Registered pending");
    runtime.managed_tabs.insert(
        tab_id,
        ManagedTabEntry {
            tab_id,
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            trigger_type: rule.trigger.kind,
            started_at: 0,
            trigger_at: 0,
            timer_name: String::new(),
            paused_at: None,
            remaining_ms: None,
        },
    );
}

/// Registers according to the trigger kind: OpenDuration always counts;
/// Inactive stays Pending while the tab is the active one.
pub fn register_for_match(
    runtime: &mut RuntimeState,
    effects: &mut Effects,
    rule: &Rule,
    tab_id: TabId,
    tab_is_active: bool,
    now: Millis,
) {
    match rule.trigger.kind {
        TriggerKind::OpenDuration => register_counting(runtime, effects, rule, tab_id, now),
        TriggerKind::Inactive if tab_is_active => register_pending(runtime, effects, rule, tab_id),
        TriggerKind::Inactive => register_counting(runtime, effects, rule, tab_id, now),
    }
}

/// Cancels the entry's timer, if any, and removes the entry.
pub fn unregister(
    runtime: &mut RuntimeState,
    effects: &mut Effects,
    tab_id: TabId,
) -> Option<ManagedTabEntry> {
    let entry = runtime.managed_tabs.remove(&tab_id)?;
    effects.cancel(&entry.timer_name);
    debug!(tab_id, rule_id = %entry.rule_id, "Unregistered");
    Some(entry)
}

/// Unregisters every entry owned by `rule_id`. Returns how many were removed.
pub fn unregister_rule(runtime: &mut RuntimeState, effects: &mut Effects, rule_id: &str) -> usize {
    let tab_ids: Vec<TabId> = runtime
        .managed_tabs
        .values()
        .filter(|entry| entry.rule_id == rule_id)
        .map(|entry| entry.tab_id)
        .collect();
    for tab_id in &tab_ids {
        unregister(runtime, effects, *tab_id);
    }
    tab_ids.len()
}

/// Registers every open, unprotected tab matching `rule`.
///
/// A tab already Counting under this rule keeps its progress, and a tab owned
/// by another rule is left alone. Pending entries of this rule are
/// re-evaluated, so a tab that should be counting starts counting.
pub fn rebuild_for_rule(
    runtime: &mut RuntimeState,
    effects: &mut Effects,
    rule: &Rule,
    protected_domains: &[String],
    tabs: &dyn TabInventory,
    now: Millis,
) -> usize {
    if !rule.enabled {
        return 0;
    }

    let active = tabs.active_tab_ids();
    let mut registered = 0;
    for tab in tabs.all_tabs() {
        let Some(url) = tab.url.as_deref() else {
            continue;
        };
        if is_protected(url, protected_domains) || !rule_matches_url(rule, url) {
            continue;
        }

        let is_active = active.contains(&tab.id);
        if let Some(existing) = runtime.managed_tabs.get(&tab.id) {
            if existing.rule_id != rule.id || existing.is_counting() {
                continue;
            }
            if rule.trigger.kind == TriggerKind::Inactive && is_active {
                continue;
            }
        }

        register_for_match(runtime, effects, rule, tab.id, is_active, now);
        registered += 1;
    }
    registered
}

/// [`rebuild_for_rule`] for every enabled rule, in stored order.
pub fn rebuild_all(
    runtime: &mut RuntimeState,
    effects: &mut Effects,
    rules: &[Rule],
    protected_domains: &[String],
    tabs: &dyn TabInventory,
    now: Millis,
) -> usize {
    rules
        .iter()
        .filter(|rule| rule.enabled)
        .map(|rule| rebuild_for_rule(runtime, effects, rule, protected_domains, tabs, now))
        .sum()
}

/// Counting entries ordered by how soon they fire.
pub fn soon_tabs(runtime: &RuntimeState, now: Millis) -> Vec<SoonTab> {
    let mut soon: Vec<SoonTab> = runtime
        .managed_tabs
        .values()
        .filter(|entry| entry.is_counting())
        .map(|entry| SoonTab {
            tab_id: entry.tab_id,
            rule_id: entry.rule_id.clone(),
            rule_name: entry.rule_name.clone(),
            trigger_type: entry.trigger_type,
            trigger_at: entry.trigger_at,
            remaining_ms: (entry.trigger_at - now).max(0),
        })
        .collect();
    soon.sort_by_key(|tab| (tab.trigger_at, tab.tab_id));
    soon
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Effect;
    use crate::types::{RuleAction, RuleSource, RuleStats, TabInfo, Trigger};

    struct Tabs(Vec<TabInfo>);

    impl TabInventory for Tabs {
        fn all_tabs(&self) -> Vec<TabInfo> {
            self.0.clone()
        }

        fn get_tab(&self, tab_id: TabId) -> Option<TabInfo> {
            self.0.iter().find(|tab| tab.id == tab_id).cloned()
        }
    }

    fn tab(id: TabId, url: &str, active: bool) -> TabInfo {
        TabInfo {
            id,
            window_id: 1,
            url: Some(url.to_string()),
            title: None,
            fav_icon_url: None,
            active,
        }
    }

    fn rule(id: &str, domain: &str, trigger: Trigger) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("{} rule", domain),
            enabled: true,
            domains: vec![domain.to_string()],
            trigger,
            action: RuleAction::CloseStash,
            source: RuleSource::Manual,
            stats: RuleStats::default(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn timer_names_are_unique_and_parseable() {
        let first = timer_name("01HRULE", 42);
        let second = timer_name("01HRULE", 42);
        assert_ne!(first, second);
        assert!(first.starts_with("rule_01HRULE_42_"));
        assert_eq!(parse_timer_tab_id(&first), Some(42));
    }

    #[test]
    fn parses_rule_ids_containing_underscores() {
        assert_eq!(parse_timer_tab_id("rule_my_rule_7_NONCE"), Some(7));
        assert_eq!(parse_timer_tab_id("undo_expire"), None);
        assert_eq!(parse_timer_tab_id("rule_7_NONCE"), None);
        assert_eq!(parse_timer_tab_id("rule_r_x_NONCE"), None);
    }

    #[test]
    fn counting_registration_cancels_previous_timer() {
        let mut runtime = RuntimeState::default();
        let mut effects = Effects::new();
        let rule = rule("r1", "video.test", Trigger::open_duration(60));

        register_counting(&mut runtime, &mut effects, &rule, 5, 1_000);
        let first_name = runtime.managed_tabs[&5].timer_name.clone();
        register_counting(&mut runtime, &mut effects, &rule, 5, 2_000);

        let entry = &runtime.managed_tabs[&5];
        assert_eq!(entry.trigger_at, 2_000 + 3_600_000);
        assert_ne!(entry.timer_name, first_name);
        assert_eq!(
            effects.as_slice()[1],
            Effect::CancelTimer { name: first_name }
        );
    }

    #[test]
    fn pending_registration_has_no_timer() {
        let mut runtime = RuntimeState::default();
        let mut effects = Effects::new();
        let rule = rule("r1", "social.test", Trigger::inactive(10));

        register_pending(&mut runtime, &mut effects, &rule, 9);
        let entry = &runtime.managed_tabs[&9];
        assert!(entry.is_pending());
        assert!(entry.timer_name.is_empty());
        assert!(effects.is_empty());
    }

    #[test]
    fn unregister_rule_removes_only_its_entries() {
        let mut runtime = RuntimeState::default();
        let mut effects = Effects::new();
        let a = rule("a", "a.test", Trigger::open_duration(5));
        let b = rule("b", "b.test", Trigger::open_duration(5));
        register_counting(&mut runtime, &mut effects, &a, 1, 0);
        register_counting(&mut runtime, &mut effects, &a, 2, 0);
        register_counting(&mut runtime, &mut effects, &b, 3, 0);

        assert_eq!(unregister_rule(&mut runtime, &mut effects, "a"), 2);
        assert_eq!(runtime.managed_tabs.len(), 1);
        assert!(runtime.managed_tabs.contains_key(&3));
    }

    #[test]
    fn rebuild_respects_activity_protection_and_existing_progress() {
        let tabs = Tabs(vec![
            tab(1, "https://social.test/feed", true),
            tab(2, "https://social.test/other", false),
            tab(3, "https://social.test/kept", false),
            tab(4, "https://other.test", false),
        ]);
        let rule = rule("r1", "social.test", Trigger::inactive(10));
        let mut runtime = RuntimeState::default();
        let mut effects = Effects::new();
        register_counting(&mut runtime, &mut effects, &rule, 3, 100);
        let kept = runtime.managed_tabs[&3].clone();

        let registered = rebuild_for_rule(&mut runtime, &mut effects, &rule, &[], &tabs, 5_000);

        assert_eq!(registered, 2);
        assert!(runtime.managed_tabs[&1].is_pending());
        assert_eq!(runtime.managed_tabs[&2].trigger_at, 5_000 + 600_000);
        assert_eq!(runtime.managed_tabs[&3], kept);
        assert!(!runtime.managed_tabs.contains_key(&4));
    }

    #[test]
    fn rebuild_skips_protected_tabs_and_disabled_rules() {
        let tabs = Tabs(vec![tab(1, "https://github.com/x", false)]);
        let mut gh = rule("r1", "github.com", Trigger::open_duration(5));
        let mut runtime = RuntimeState::default();
        let mut effects = Effects::new();

        let protected = vec!["github.com".to_string()];
        assert_eq!(
            rebuild_for_rule(&mut runtime, &mut effects, &gh, &protected, &tabs, 0),
            0
        );
        gh.enabled = false;
        assert_eq!(rebuild_all(&mut runtime, &mut effects, &[gh], &[], &tabs, 0), 0);
        assert!(runtime.managed_tabs.is_empty());
    }

    #[test]
    fn soon_tabs_orders_counting_entries() {
        let mut runtime = RuntimeState::default();
        let mut effects = Effects::new();
        let slow = rule("slow", "a.test", Trigger::open_duration(30));
        let fast = rule("fast", "b.test", Trigger::open_duration(5));
        let idle = rule("idle", "c.test", Trigger::inactive(5));
        register_counting(&mut runtime, &mut effects, &slow, 1, 0);
        register_counting(&mut runtime, &mut effects, &fast, 2, 0);
        register_pending(&mut runtime, &mut effects, &idle, 3);

        let soon = soon_tabs(&runtime, 60_000);
        let ids: Vec<TabId> = soon.iter().map(|tab| tab.tab_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(soon[0].remaining_ms, 5 * 60_000 - 60_000);
    }
}
