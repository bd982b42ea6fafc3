//! Runtime State Store access.
//!
//! The persistent key-value store is the only source of truth; nothing is
//! assumed to survive in memory between handlers. Every handler loads a
//! [`Snapshot`], mutates it, and commits the keys it changed in one
//! [`KvStore::set_many`] call.
//!
//! # Keys
//!
//! | Key        | Value                 |
//! |------------|-----------------------|
//! | `rules`    | `Vec<Rule>`           |
//! | `settings` | `Settings`            |
//! | `runtime`  | `RuntimeState`        |
//! | `stash`    | `Vec<StashedTab>`     |
//!
//! Missing keys decode to their defaults; malformed values are errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TabflowError};
use crate::types::{Rule, RuntimeState, Settings, StashedTab};

pub const RULES_KEY: &str = "rules";
pub const SETTINGS_KEY: &str = "settings";
pub const RUNTIME_KEY: &str = "runtime";
pub const STASH_KEY: &str = "stash";

pub const ALL_KEYS: [&str; 4] = [RULES_KEY, SETTINGS_KEY, RUNTIME_KEY, STASH_KEY];

/// Persistent key-value storage provided by the host.
pub trait KvStore {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes every pair, all-or-nothing where the backend supports it.
    fn set_many(&self, entries: &[(&str, String)]) -> Result<()>;

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, value.to_string())])
    }
}

impl<T: KvStore + ?Sized> KvStore for &T {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<()> {
        (**self).set_many(entries)
    }
}

/// In-memory store for tests and embedders without persistence.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, to exercise error propagation.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().map_err(|_| TabflowError::StorageRead {
            key: key.to_string(),
            details: "memory store lock poisoned".to_string(),
        })?;
        Ok(values.get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TabflowError::StorageWrite {
                details: "memory store configured to fail writes".to_string(),
            });
        }
        let mut values = self.values.lock().map_err(|_| TabflowError::StorageWrite {
            details: "memory store lock poisoned".to_string(),
        })?;
        for (key, value) in entries {
            values.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }
}

/// One handler's working copy of every persisted key.
///
/// Fields are public so transitions can borrow them independently; commit
/// compares against the encoding taken at load time and writes only what changed.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub rules: Vec<Rule>,
    pub settings: Settings,
    pub runtime: RuntimeState,
    pub stash: Vec<StashedTab>,
    baseline: HashMap<&'static str, String>,
}

impl Snapshot {
    pub fn load(store: &dyn KvStore) -> Result<Self> {
        let mut snapshot = Snapshot {
            rules: decode(store, RULES_KEY)?,
            settings: decode(store, SETTINGS_KEY)?,
            runtime: decode(store, RUNTIME_KEY)?,
            stash: decode(store, STASH_KEY)?,
            baseline: HashMap::new(),
        };
        snapshot.baseline = snapshot.encode_all()?.into_iter().collect();
        Ok(snapshot)
    }

    /// Keys whose value differs from what was loaded, with their new encoding.
    pub fn changed(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(self
            .encode_all()?
            .into_iter()
            .filter(|(key, value)| self.baseline.get(key) != Some(value))
            .collect())
    }

    /// Writes changed keys in one call and returns their names.
    pub fn commit(&mut self, store: &dyn KvStore) -> Result<Vec<&'static str>> {
        let changed = self.changed()?;
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        store.set_many(&changed)?;
        let keys = changed.iter().map(|(key, _)| *key).collect();
        self.baseline.extend(changed);
        Ok(keys)
    }

    pub fn rule(&self, rule_id: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.id == rule_id)
    }

    fn encode_all(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            (RULES_KEY, encode(RULES_KEY, &self.rules)?),
            (SETTINGS_KEY, encode(SETTINGS_KEY, &self.settings)?),
            (RUNTIME_KEY, encode(RUNTIME_KEY, &self.runtime)?),
            (STASH_KEY, encode(STASH_KEY, &self.stash)?),
        ])
    }
}

fn decode<T: DeserializeOwned + Default>(store: &dyn KvStore, key: &str) -> Result<T> {
    match store.get(key)? {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).map_err(|source| TabflowError::Json {
                key: key.to_string(),
                source,
            })
        }
        _ => Ok(T::default()),
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|source| TabflowError::Json {
        key: key.to_string(),
        source,
    })
}
