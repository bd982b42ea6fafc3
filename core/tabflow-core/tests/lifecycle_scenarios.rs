//! End-to-end lifecycle scenarios driven through `TabflowEngine` with a fake
//! browser that applies effects the way a host would.

use std::cell::RefCell;
use std::collections::BTreeMap;

use tabflow_core::{
    Command, CommandOutcome, Effect, EngineConfig, MemoryStore, Millis, RuleDraft, TabEvent,
    TabId, TabInfo, TabInventory, TabflowEngine, Trigger, UNDO_EXPIRE_TIMER,
};

const MINUTE: Millis = 60_000;

#[derive(Default)]
struct FakeBrowser {
    tabs: RefCell<Vec<TabInfo>>,
    timers: RefCell<BTreeMap<String, Millis>>,
    opened: RefCell<Vec<String>>,
}

impl TabInventory for FakeBrowser {
    fn all_tabs(&self) -> Vec<TabInfo> {
        self.tabs.borrow().clone()
    }

    fn get_tab(&self, tab_id: TabId) -> Option<TabInfo> {
        self.tabs.borrow().iter().find(|tab| tab.id == tab_id).cloned()
    }
}

impl FakeBrowser {
    fn open(&self, id: TabId, url: &str, active: bool) {
        let mut tabs = self.tabs.borrow_mut();
        if active {
            for tab in tabs.iter_mut() {
                tab.active = false;
            }
        }
        tabs.push(TabInfo {
            id,
            window_id: 1,
            url: Some(url.to_string()),
            title: Some(format!("Tab {}", id)),
            fav_icon_url: None,
            active,
        });
    }

    fn set_active(&self, id: TabId) {
        for tab in self.tabs.borrow_mut().iter_mut() {
            tab.active = tab.id == id;
        }
    }

    fn is_open(&self, id: TabId) -> bool {
        self.tabs.borrow().iter().any(|tab| tab.id == id)
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ScheduleTimer { name, at } => {
                    self.timers.borrow_mut().insert(name, at);
                }
                Effect::CancelTimer { name } => {
                    self.timers.borrow_mut().remove(&name);
                }
                Effect::CloseTab { tab_id } => self.tabs.borrow_mut().retain(|tab| tab.id != tab_id),
                Effect::OpenTab { url } => self.opened.borrow_mut().push(url),
            }
        }
    }

    fn timer_at(&self, name: &str) -> Option<Millis> {
        self.timers.borrow().get(name).copied()
    }
}

struct Harness {
    engine: TabflowEngine<MemoryStore>,
    browser: FakeBrowser,
}

impl Harness {
    fn new() -> Self {
        Self {
            engine: TabflowEngine::new(MemoryStore::new(), EngineConfig::default()),
            browser: FakeBrowser::default(),
        }
    }

    fn event(&self, event: TabEvent, now: Millis) {
        let effects = self
            .engine
            .handle_event(&event, &self.browser, now)
            .expect("handle event");
        self.browser.apply(effects);
    }

    fn command(&self, command: Command, now: Millis) -> CommandOutcome {
        let (outcome, effects) = self
            .engine
            .handle_command(command, &self.browser, now)
            .expect("handle command");
        self.browser.apply(effects);
        outcome
    }

    fn add_rule(&self, domain: &str, trigger: Trigger) {
        self.command(
            Command::CreateRule {
                rule: RuleDraft {
                    name: None,
                    domains: vec![domain.to_string()],
                    trigger,
                    enabled: None,
                },
                replace: false,
            },
            0,
        );
    }

    fn open_tab(&self, id: TabId, url: &str, active: bool, now: Millis) {
        self.browser.open(id, url, active);
        self.event(TabEvent::Created { tab_id: id }, now);
        self.event(
            TabEvent::Navigated {
                tab_id: id,
                url: url.to_string(),
            },
            now,
        );
    }

    fn activate(&self, id: TabId, now: Millis) {
        self.browser.set_active(id);
        self.event(TabEvent::Activated { tab_id: id }, now);
    }

    /// Fires every timer due at or before `now`, earliest first.
    fn advance_to(&self, now: Millis) {
        loop {
            let due = self
                .browser
                .timers
                .borrow()
                .iter()
                .filter(|(_, at)| **at <= now)
                .min_by_key(|(_, at)| **at)
                .map(|(name, at)| (name.clone(), *at));
            let Some((name, at)) = due else {
                break;
            };
            self.browser.timers.borrow_mut().remove(&name);
            self.event(TabEvent::TimerFired { name }, at);
        }
    }

    fn entry_trigger_at(&self, tab_id: TabId) -> Option<Millis> {
        self.engine
            .snapshot()
            .expect("snapshot")
            .runtime
            .managed_tabs
            .get(&tab_id)
            .map(|entry| entry.trigger_at)
    }
}

#[test]
fn open_duration_tab_closes_after_an_hour_despite_navigation() {
    let h = Harness::new();
    h.add_rule("video.test", Trigger::open_duration(60));
    h.open_tab(1, "https://video.test/watch?v=1", false, 0);
    assert_eq!(h.entry_trigger_at(1), Some(60 * MINUTE));

    h.event(
        TabEvent::Navigated {
            tab_id: 1,
            url: "https://www.video.test/watch?v=2".to_string(),
        },
        10 * MINUTE,
    );
    assert_eq!(h.entry_trigger_at(1), Some(60 * MINUTE));

    h.advance_to(59 * MINUTE);
    assert!(h.browser.is_open(1));

    h.advance_to(60 * MINUTE);
    assert!(!h.browser.is_open(1));

    let snapshot = h.engine.snapshot().expect("snapshot");
    assert_eq!(snapshot.stash.len(), 1);
    assert_eq!(snapshot.stash[0].url, "https://video.test/watch?v=1");
    assert_eq!(snapshot.stash[0].closed_by, "video.test · 1hr");
    assert_eq!(snapshot.rules[0].stats.triggered_count, 1);
    assert_eq!(snapshot.settings.pending_clean_count, 1);
    assert!(snapshot.runtime.managed_tabs.is_empty());
}

#[test]
fn inactive_countdown_pauses_while_viewed() {
    let h = Harness::new();
    h.add_rule("social.test", Trigger::inactive(10));
    h.open_tab(1, "https://social.test/feed", true, 0);
    h.activate(1, 0);
    assert_eq!(h.entry_trigger_at(1), Some(0));

    h.open_tab(2, "https://docs.test", false, MINUTE);
    h.activate(2, MINUTE);
    assert_eq!(h.entry_trigger_at(1), Some(11 * MINUTE));

    h.activate(1, 5 * MINUTE);
    let snapshot = h.engine.snapshot().expect("snapshot");
    let entry = &snapshot.runtime.managed_tabs[&1];
    assert_eq!(entry.trigger_at, 0);
    assert_eq!(entry.paused_at, Some(5 * MINUTE));
    assert_eq!(entry.remaining_ms, Some(6 * MINUTE));
    assert!(h.browser.timers.borrow().is_empty());

    h.activate(2, 6 * MINUTE);
    assert_eq!(h.entry_trigger_at(1), Some(16 * MINUTE));

    h.advance_to(15 * MINUTE);
    assert!(h.browser.is_open(1));
    h.advance_to(16 * MINUTE);
    assert!(!h.browser.is_open(1));
}

#[test]
fn protected_domain_is_never_managed() {
    let h = Harness::new();
    h.command(
        Command::ProtectDomain {
            domain: "github.com".to_string(),
        },
        0,
    );
    h.add_rule("github.com", Trigger::open_duration(1));
    h.open_tab(1, "https://gist.github.com/x", false, 0);

    h.advance_to(24 * 60 * MINUTE);
    assert!(h.browser.is_open(1));
    assert_eq!(h.entry_trigger_at(1), None);
}

#[test]
fn recent_interaction_defers_closure() {
    let h = Harness::new();
    h.add_rule("video.test", Trigger::open_duration(1));
    h.open_tab(1, "https://video.test", false, 0);
    h.open_tab(2, "https://docs.test", true, 0);
    h.activate(2, MINUTE - 5_000);

    h.advance_to(MINUTE);
    assert!(h.browser.is_open(1));
    assert_eq!(h.entry_trigger_at(1), Some(2 * MINUTE));

    h.advance_to(2 * MINUTE);
    assert!(!h.browser.is_open(1));
}

#[test]
fn closures_within_five_seconds_undo_together() {
    let h = Harness::new();
    h.add_rule("a.test", Trigger::open_duration(1));
    h.add_rule("b.test", Trigger::open_duration(1));
    h.add_rule("c.test", Trigger::open_duration(1));
    h.open_tab(1, "https://a.test", false, 0);
    h.open_tab(2, "https://b.test", false, 2_000);
    h.open_tab(3, "https://c.test", false, 20_000);

    h.advance_to(MINUTE + 2_000);
    assert!(!h.browser.is_open(1));
    assert!(!h.browser.is_open(2));
    assert_eq!(h.browser.timer_at(UNDO_EXPIRE_TIMER), Some(MINUTE + 7_000));

    h.advance_to(MINUTE + 20_000);
    assert!(!h.browser.is_open(3));

    let outcome = h.command(Command::Undo, MINUTE + 21_000);
    assert_eq!(outcome, CommandOutcome::Restored { count: 1 });
    assert_eq!(*h.browser.opened.borrow(), vec!["https://c.test".to_string()]);

    let snapshot = h.engine.snapshot().expect("snapshot");
    assert_eq!(snapshot.stash.len(), 2);
    assert!(snapshot.runtime.pending_undo_group.is_none());
    assert_eq!(snapshot.settings.pending_clean_count, 2);
}

#[test]
fn undo_of_a_coalesced_group_reopens_every_tab() {
    let h = Harness::new();
    h.add_rule("a.test", Trigger::open_duration(1));
    h.add_rule("b.test", Trigger::open_duration(1));
    h.open_tab(1, "https://a.test", false, 0);
    h.open_tab(2, "https://b.test", false, 3_000);
    h.advance_to(MINUTE + 3_000);

    let outcome = h.command(Command::Undo, MINUTE + 4_000);
    assert_eq!(outcome, CommandOutcome::Restored { count: 2 });
    assert_eq!(h.browser.opened.borrow().len(), 2);
    assert!(h.engine.snapshot().expect("snapshot").stash.is_empty());
    assert_eq!(h.browser.timer_at(UNDO_EXPIRE_TIMER), None);
}

#[test]
fn restart_never_closes_past_due_tabs() {
    let h = Harness::new();
    h.add_rule("video.test", Trigger::open_duration(60));
    h.open_tab(1, "https://video.test", false, 0);

    // The daemon was down past the deadline; its timers are gone.
    h.browser.timers.borrow_mut().clear();
    let (report, effects) = h
        .engine
        .startup(&h.browser, 3 * 60 * MINUTE)
        .expect("startup");
    assert_eq!(report.reset, 1);
    assert!(!effects
        .iter()
        .any(|effect| matches!(effect, Effect::CloseTab { .. })));
    h.browser.apply(effects);

    assert!(h.browser.is_open(1));
    assert_eq!(h.entry_trigger_at(1), Some(4 * 60 * MINUTE));
}

#[test]
fn restart_releases_tabs_that_navigated_away() {
    let h = Harness::new();
    h.add_rule("video.test", Trigger::open_duration(60));
    h.open_tab(1, "https://video.test/watch", false, 0);

    // The tab moved on while nobody was listening for navigation.
    for tab in h.browser.tabs.borrow_mut().iter_mut() {
        tab.url = Some("https://docs.test/page".to_string());
    }
    let (report, effects) = h.engine.startup(&h.browser, 10 * MINUTE).expect("startup");
    h.browser.apply(effects);

    assert_eq!(report.mismatched, 1);
    assert_eq!(h.entry_trigger_at(1), None);
    h.advance_to(3 * 60 * MINUTE);
    assert!(h.browser.is_open(1));
    assert!(h.engine.snapshot().expect("snapshot").stash.is_empty());
}

#[test]
fn startup_is_idempotent() {
    let h = Harness::new();
    h.add_rule("social.test", Trigger::inactive(10));
    h.open_tab(1, "https://social.test", false, 0);
    h.open_tab(2, "https://social.test/other", true, 0);

    let (_, first_effects) = h.engine.startup(&h.browser, MINUTE).expect("first");
    h.browser.apply(first_effects);
    let after_first = h.engine.snapshot().expect("snapshot").runtime;

    let (report, second_effects) = h.engine.startup(&h.browser, MINUTE).expect("second");
    h.browser.apply(second_effects);
    let after_second = h.engine.snapshot().expect("snapshot").runtime;

    assert_eq!(report.registered, 0);
    assert_eq!(after_first, after_second);
}

#[test]
fn deleting_a_rule_cancels_its_timers() {
    let h = Harness::new();
    h.add_rule("video.test", Trigger::open_duration(5));
    h.open_tab(1, "https://video.test", false, 0);
    let rule_id = h.engine.snapshot().expect("snapshot").rules[0].id.clone();

    h.command(Command::DeleteRule { rule_id }, MINUTE);
    assert!(h.browser.timers.borrow().is_empty());

    h.advance_to(60 * MINUTE);
    assert!(h.browser.is_open(1));
}
