//! The single writer.
//!
//! Every request that reads or mutates engine state, and every timer fire,
//! becomes a [`Job`] on one FIFO channel consumed by one thread. The writer
//! owns the engine, the tab mirror, the timer service and the host-action
//! outbox, so no two transitions ever interleave.

use std::sync::mpsc::{Receiver, Sender};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use tabflow_core::{now_ms, Command, Effect, Millis, TabEvent, TabflowEngine, TabflowError};
use tabflow_protocol::{focused_window, ErrorInfo, HostAction, HostEvent, PROTOCOL_VERSION};

use crate::db::Db;
use crate::tabs::TabMirror;
use crate::timers::TimerService;

pub type Reply = Sender<Result<Value, ErrorInfo>>;

pub enum Job {
    Request { work: Work, reply: Reply },
    TimerFired { name: String },
}

#[derive(Debug)]
pub enum Work {
    Health,
    HostEvent(HostEvent),
    Command(Command),
    DrainHostActions,
    GetRules,
    GetSettings,
    GetStash,
    GetRuntime,
    GetSoonTabs,
    GetChanges { since: i64 },
}

pub struct Writer {
    engine: TabflowEngine<Db>,
    tabs: TabMirror,
    timers: TimerService,
    outbox: Vec<HostAction>,
}

impl Writer {
    pub fn new(engine: TabflowEngine<Db>, timers: TimerService) -> Self {
        Self {
            engine,
            tabs: TabMirror::new(),
            timers,
            outbox: Vec::new(),
        }
    }

    /// Serves jobs until every sender is gone.
    pub fn run(mut self, jobs: Receiver<Job>) {
        for job in jobs {
            match job {
                Job::Request { work, reply } => {
                    let result = self.execute(work, now_ms());
                    if reply.send(result).is_err() {
                        debug!("Requester went away before the reply was sent");
                    }
                }
                Job::TimerFired { name } => {
                    let event = TabEvent::TimerFired { name };
                    if let Err(err) = self.dispatch(&event, now_ms()) {
                        warn!(code = %err.code, message = %err.message, "Failed to handle timer fire");
                    }
                }
            }
        }
        info!("Writer queue closed");
    }

    pub fn execute(&mut self, work: Work, now: Millis) -> Result<Value, ErrorInfo> {
        match work {
            Work::Health => Ok(json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "tabs": self.tabs.len(),
                "focused_window_id": self.tabs.focused_window(),
                "timers": self.timers.pending_count(),
                "queued_host_actions": self.outbox.len(),
            })),
            Work::HostEvent(event) => self.on_host_event(event, now),
            Work::Command(command) => {
                let (outcome, effects) = self
                    .engine
                    .handle_command(command, &self.tabs, now)
                    .map_err(|err| error_info(&err))?;
                self.apply_effects(effects);
                to_value(&outcome)
            }
            Work::DrainHostActions => {
                let actions = std::mem::take(&mut self.outbox);
                to_value(&actions)
            }
            Work::GetRules => to_value(&self.snapshot()?.rules),
            Work::GetSettings => to_value(&self.snapshot()?.settings),
            Work::GetStash => {
                let mut stash = self.snapshot()?.stash;
                stash.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
                to_value(&stash)
            }
            Work::GetRuntime => to_value(&self.snapshot()?.runtime),
            Work::GetSoonTabs => {
                let soon = self.engine.soon_tabs(now).map_err(|err| error_info(&err))?;
                to_value(&soon)
            }
            Work::GetChanges { since } => {
                let db = self.engine.store();
                let revision = db.current_revision().map_err(storage_error)?;
                let changes = db.changed_since(since).map_err(storage_error)?;
                Ok(json!({ "revision": revision, "changes": changes }))
            }
        }
    }

    fn on_host_event(&mut self, event: HostEvent, now: Millis) -> Result<Value, ErrorInfo> {
        match event {
            HostEvent::Sync {
                tabs,
                focused_window_id,
            } => {
                self.tabs.replace_all(tabs, focused_window(focused_window_id));
                let (report, effects) = self
                    .engine
                    .startup(&self.tabs, now)
                    .map_err(|err| error_info(&err))?;
                self.apply_effects(effects);
                return to_value(&report);
            }
            HostEvent::TabCreated { tab } => {
                let tab_id = tab.id;
                let url = tab.url.clone();
                self.tabs.upsert(tab);
                self.dispatch(&TabEvent::Created { tab_id }, now)?;
                if let Some(url) = url {
                    self.dispatch(&TabEvent::Navigated { tab_id, url }, now)?;
                }
            }
            HostEvent::TabUpdated {
                tab_id,
                url,
                title,
                fav_icon_url,
            } => {
                let known = self
                    .tabs
                    .update(tab_id, url.clone(), title, fav_icon_url);
                if !known {
                    debug!(tab_id, "Update for a tab the mirror has not seen");
                }
                if let Some(url) = url {
                    self.dispatch(&TabEvent::Navigated { tab_id, url }, now)?;
                }
            }
            HostEvent::TabActivated { tab_id, window_id } => {
                self.tabs.activate(tab_id, window_id);
                self.dispatch(&TabEvent::Activated { tab_id }, now)?;
            }
            HostEvent::TabRemoved { tab_id } => {
                self.tabs.remove(tab_id);
                self.dispatch(&TabEvent::Removed { tab_id }, now)?;
            }
            HostEvent::WindowFocusChanged { window_id } => {
                let window_id = focused_window(window_id);
                self.tabs.focus(window_id);
                self.dispatch(&TabEvent::FocusChanged { window_id }, now)?;
            }
        }
        Ok(json!({ "accepted": true }))
    }

    fn dispatch(&mut self, event: &TabEvent, now: Millis) -> Result<(), ErrorInfo> {
        let effects = self
            .engine
            .handle_event(event, &self.tabs, now)
            .map_err(|err| error_info(&err))?;
        self.apply_effects(effects);
        Ok(())
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ScheduleTimer { name, at } => self.timers.schedule(&name, at),
                Effect::CancelTimer { name } => self.timers.cancel(&name),
                Effect::CloseTab { tab_id } => {
                    // Gone from our view now, whether or not the host has acted yet.
                    self.tabs.remove(tab_id);
                    self.outbox.push(HostAction::CloseTab { tab_id });
                }
                Effect::OpenTab { url } => self.outbox.push(HostAction::OpenTab { url }),
            }
        }
    }

    fn snapshot(&self) -> Result<tabflow_core::Snapshot, ErrorInfo> {
        self.engine.snapshot().map_err(|err| error_info(&err))
    }
}

/// Maps an engine error to its wire form. Conflicts carry the conflict list.
pub fn error_info(err: &TabflowError) -> ErrorInfo {
    let info = ErrorInfo::new(err.code(), err.to_string());
    match err {
        TabflowError::RuleConflict { conflicts } => match serde_json::to_value(conflicts) {
            Ok(details) => info.with_details(details),
            Err(_) => info,
        },
        TabflowError::StorageRead { .. }
        | TabflowError::StorageWrite { .. }
        | TabflowError::Json { .. } => {
            warn!(error = %err, "Persistence failure");
            info
        }
        _ => info,
    }
}

fn storage_error(message: String) -> ErrorInfo {
    warn!(error = %message, "Persistence failure");
    ErrorInfo::new("storage_error", message)
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ErrorInfo> {
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabflow_core::{EngineConfig, RuleDraft, TabInventory, Trigger};
    use tabflow_protocol::TabSnapshot;

    fn writer(dir: &tempfile::TempDir) -> Writer {
        let db = Db::new(dir.path().join("state.db")).expect("db");
        let engine = TabflowEngine::new(db, EngineConfig::default());
        Writer::new(engine, TimerService::start(|_| {}))
    }

    fn tab(id: i64, url: &str, active: bool) -> TabSnapshot {
        TabSnapshot {
            id,
            window_id: 1,
            url: Some(url.to_string()),
            title: Some("Video".to_string()),
            fav_icon_url: None,
            active,
        }
    }

    fn create_rule(writer: &mut Writer, domain: &str, minutes: u32, now: Millis) -> Result<Value, ErrorInfo> {
        writer.execute(
            Work::Command(Command::CreateRule {
                rule: RuleDraft {
                    name: None,
                    domains: vec![domain.to_string()],
                    trigger: Trigger::open_duration(minutes),
                    enabled: None,
                },
                replace: false,
            }),
            now,
        )
    }

    #[test]
    fn sync_registers_tabs_and_arms_timers() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut writer = writer(&dir);
        let now = now_ms();
        create_rule(&mut writer, "video.test", 60, now).expect("create");

        let report = writer
            .execute(
                Work::HostEvent(HostEvent::Sync {
                    tabs: vec![tab(1, "https://video.test", false), tab(2, "https://docs.test", true)],
                    focused_window_id: Some(1),
                }),
                now,
            )
            .expect("sync");
        assert_eq!(report["registered"], 1);

        // One countdown plus the stash sweep.
        assert_eq!(writer.timers.pending_count(), 2);
    }

    #[test]
    fn firing_queues_close_action_for_the_host() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut writer = writer(&dir);
        let start = now_ms();
        create_rule(&mut writer, "video.test", 1, start).expect("create");
        writer
            .execute(
                Work::HostEvent(HostEvent::TabCreated {
                    tab: tab(5, "https://video.test/watch", false),
                }),
                start,
            )
            .expect("created");

        let runtime = writer.execute(Work::GetRuntime, start).expect("runtime");
        let timer = runtime["managed_tabs"]["5"]["timer_name"]
            .as_str()
            .expect("timer name")
            .to_string();

        writer
            .dispatch(&TabEvent::TimerFired { name: timer }, start + 60_000)
            .expect("fire");

        let actions = writer.execute(Work::DrainHostActions, start).expect("drain");
        assert_eq!(actions, json!([{ "action": "close_tab", "tab_id": 5 }]));
        let again = writer.execute(Work::DrainHostActions, start).expect("drain again");
        assert_eq!(again, json!([]));

        let stash = writer.execute(Work::GetStash, start).expect("stash");
        assert_eq!(stash[0]["url"], "https://video.test/watch");
        assert!(writer.tabs.get_tab(5).is_none());
    }

    #[test]
    fn conflicts_carry_details() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut writer = writer(&dir);
        let now = now_ms();
        create_rule(&mut writer, "x.com", 30, now).expect("first");

        let err = create_rule(&mut writer, "mobile.x.com", 30, now).expect_err("conflict");
        assert_eq!(err.code, "rule_conflict");
        let details = err.details.expect("details");
        assert_eq!(details[0]["domain"], "mobile.x.com");
    }

    #[test]
    fn changes_report_revisions() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut writer = writer(&dir);
        let now = now_ms();
        create_rule(&mut writer, "x.com", 30, now).expect("create");

        let changes = writer
            .execute(Work::GetChanges { since: 0 }, now)
            .expect("changes");
        assert_eq!(changes["revision"], 1);
        assert_eq!(changes["changes"][0]["key"], "rules");

        let none = writer
            .execute(Work::GetChanges { since: 1 }, now)
            .expect("no changes");
        assert_eq!(none["changes"], json!([]));
    }
}
