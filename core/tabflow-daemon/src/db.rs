//! SQLite persistence for tabflow-daemon.
//!
//! One `kv` table backs the engine's [`KvStore`]. Every write bumps a global
//! revision, stamped on each key it touched, so clients can poll for changes
//! with `get_changes { since }`.

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;

use tabflow_core::{KvStore, TabflowError};

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyChange {
    pub key: String,
    pub revision: i64,
    pub updated_at: String,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>, String> {
        self.with_connection(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .map_err(|err| format!("Failed to read key {}: {}", key, err))
        })
    }

    /// Writes all entries in one transaction under a fresh revision, which is returned.
    pub fn put_values(&self, entries: &[(&str, String)]) -> Result<i64, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin kv transaction: {}", err))?;
            let revision: i64 = tx
                .query_row("SELECT COALESCE(MAX(revision), 0) + 1 FROM kv", [], |row| {
                    row.get(0)
                })
                .map_err(|err| format!("Failed to compute next revision: {}", err))?;
            let updated_at = Utc::now().to_rfc3339();

            for (key, value) in entries {
                tx.execute(
                    "INSERT INTO kv (key, value, revision, updated_at) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(key) DO UPDATE SET \
                        value = excluded.value, \
                        revision = excluded.revision, \
                        updated_at = excluded.updated_at",
                    params![key, value, revision, updated_at],
                )
                .map_err(|err| format!("Failed to write key {}: {}", key, err))?;
            }

            tx.commit()
                .map_err(|err| format!("Failed to commit kv transaction: {}", err))?;
            Ok(revision)
        })
    }

    pub fn current_revision(&self) -> Result<i64, String> {
        self.with_connection(|conn| {
            conn.query_row("SELECT COALESCE(MAX(revision), 0) FROM kv", [], |row| {
                row.get(0)
            })
            .map_err(|err| format!("Failed to read current revision: {}", err))
        })
    }

    /// Keys written after revision `since`, oldest first.
    pub fn changed_since(&self, since: i64) -> Result<Vec<KeyChange>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key, revision, updated_at FROM kv \
                     WHERE revision > ?1 ORDER BY revision ASC, key ASC",
                )
                .map_err(|err| format!("Failed to prepare changes query: {}", err))?;

            let rows = stmt
                .query_map(params![since], |row| {
                    Ok(KeyChange {
                        key: row.get(0)?,
                        revision: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                })
                .map_err(|err| format!("Failed to read change rows: {}", err))?;

            let mut changes = Vec::new();
            for row in rows {
                changes.push(row.map_err(|err| format!("Failed to decode change row: {}", err))?);
            }
            Ok(changes)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    revision INTEGER NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS kv_revision ON kv(revision);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

impl KvStore for Db {
    fn get(&self, key: &str) -> tabflow_core::Result<Option<String>> {
        self.get_value(key)
            .map_err(|details| TabflowError::StorageRead {
                key: key.to_string(),
                details,
            })
    }

    fn set_many(&self, entries: &[(&str, String)]) -> tabflow_core::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let revision = self
            .put_values(entries)
            .map_err(|details| TabflowError::StorageWrite { details })?;
        tracing::debug!(
            revision,
            keys = ?entries.iter().map(|(key, _)| *key).collect::<Vec<_>>(),
            "Persisted state"
        );
        Ok(())
    }
}
