//! TabflowEngine - the entry point for hosts of the rule engine.
//!
//! Each call is one transaction over the [`KvStore`]:
//! - load a [`Snapshot`] of every persisted key
//! - run a pure transition that mutates the snapshot and collects [`Effect`]s
//! - commit the changed keys in one write
//! - hand the effects back to the caller
//!
//! A failing transition or a failed commit returns an error and no effects, so
//! a tab is never closed unless its stash entry was persisted first.
//!
//! The engine is **not** thread-safe with respect to ordering: callers must
//! serialize calls (the daemon funnels them through one writer thread).
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use tabflow_core::{EngineConfig, MemoryStore, TabEvent, TabflowEngine};
//!
//! let engine = TabflowEngine::new(MemoryStore::new(), EngineConfig::default());
//! let effects = engine.handle_event(&TabEvent::Activated { tab_id: 7 }, &tabs, now)?;
//! ```

use chrono::Utc;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::host::{Effect, Effects, TabInventory};
use crate::lifecycle::{apply_event, TabEvent};
use crate::reconcile::{startup, ReconcileReport};
use crate::rules::{apply_command, Command, CommandOutcome};
use crate::scheduler::soon_tabs;
use crate::store::{KvStore, Snapshot};
use crate::types::{Millis, SoonTab};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> Millis {
    Utc::now().timestamp_millis()
}

pub struct TabflowEngine<S> {
    store: S,
    config: EngineConfig,
}

impl<S: KvStore> TabflowEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────────

    /// Applies one host event (tab/window change or timer fire).
    pub fn handle_event(
        &self,
        event: &TabEvent,
        tabs: &dyn TabInventory,
        now: Millis,
    ) -> Result<Vec<Effect>> {
        let ((), effects) = self.transact(|snapshot, effects| {
            apply_event(snapshot, effects, tabs, &self.config, now, event);
            Ok(())
        })?;
        Ok(effects)
    }

    /// Applies one UI command. On error nothing is persisted.
    pub fn handle_command(
        &self,
        command: Command,
        tabs: &dyn TabInventory,
        now: Millis,
    ) -> Result<(CommandOutcome, Vec<Effect>)> {
        self.transact(|snapshot, effects| apply_command(snapshot, effects, tabs, now, command))
    }

    /// Startup reconciliation against the live inventory. Safe to repeat.
    pub fn startup(
        &self,
        tabs: &dyn TabInventory,
        now: Millis,
    ) -> Result<(ReconcileReport, Vec<Effect>)> {
        self.transact(|snapshot, effects| Ok(startup(snapshot, effects, tabs, &self.config, now)))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Result<Snapshot> {
        Snapshot::load(&self.store)
    }

    pub fn soon_tabs(&self, now: Millis) -> Result<Vec<SoonTab>> {
        Ok(soon_tabs(&self.snapshot()?.runtime, now))
    }

    fn transact<T>(
        &self,
        transition: impl FnOnce(&mut Snapshot, &mut Effects) -> Result<T>,
    ) -> Result<(T, Vec<Effect>)> {
        let mut snapshot = Snapshot::load(&self.store)?;
        let mut effects = Effects::new();
        let value = transition(&mut snapshot, &mut effects)?;
        snapshot.commit(&self.store)?;
        Ok((value, effects.into_vec()))
    }
}
