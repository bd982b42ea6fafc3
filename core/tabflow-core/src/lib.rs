//! # tabflow-core
//!
//! Rule engine that closes browser tabs after a configurable period of
//! inactivity or total open time, stashing each closed tab so it can be
//! restored, with undo of the most recent batch.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency.
//! - **Storage is the source of truth**: Every call loads state from a
//!   [`KvStore`] and commits it back; nothing is cached between calls.
//! - **Effects, not side effects**: Transitions return [`Effect`]s (timers,
//!   close/open tab) for the host to apply after the commit.
//! - **Fail closed**: Malformed URLs match nothing; stale timers and vanished
//!   tabs are no-ops.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tabflow_core::{EngineConfig, MemoryStore, TabflowEngine};
//!
//! let engine = TabflowEngine::new(MemoryStore::new(), EngineConfig::default());
//! let (report, effects) = engine.startup(&tabs, tabflow_core::now_ms())?;
//! ```

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod reconcile;
pub mod rules;
pub mod scheduler;
pub mod stash;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use domain::{find_matching_rule, match_domain, normalize_domain};
pub use engine::{now_ms, TabflowEngine};
pub use error::{Result, RuleConflict, TabflowError};
pub use host::{Effect, Effects, TabInventory};
pub use lifecycle::TabEvent;
pub use reconcile::ReconcileReport;
pub use rules::{Command, CommandOutcome, RuleDraft, PRESETS};
pub use scheduler::soon_tabs;
pub use stash::{STASH_SWEEP_TIMER, UNDO_EXPIRE_TIMER};
pub use store::{KvStore, MemoryStore, Snapshot, ALL_KEYS};
pub use types::*;
