//! Persistence contract for orchestration state.
//!
//! The core only needs a flat key/value store: every record is a JSON
//! document addressed by `(kind, id)`.  Two backends are provided:
//!
//! - [`MemoryStore`] – a process-local map, for tests and throwaway runs.
//! - [`SqliteStore`] – a single SQLite table, durable across restarts.
//!
//! # Storage layout
//!
//! [`SqliteStore`] creates one table `state_records`:
//!
//! | column     | type | description                           |
//! |------------|------|---------------------------------------|
//! | kind       | TEXT | Record family, e.g. `"task"`          |
//! | id         | TEXT | Record id within its family           |
//! | body       | TEXT | JSON document                         |
//! | updated_at | TEXT | RFC-3339 timestamp of the last write  |
//!
//! `(kind, id)` is the primary key; `put` is an upsert.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use skyward_types::SkyError;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for SkyError {
    fn from(err: StoreError) -> Self {
        SkyError::Storage(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StateStore trait
// ─────────────────────────────────────────────────────────────────────────────

/// Flat JSON document store keyed by `(kind, id)`.
pub trait StateStore: Send + Sync {
    /// Insert or replace a record.
    fn put(&self, kind: &str, id: &str, body: &Value) -> Result<(), StoreError>;

    fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Every record of `kind`, ordered by id.
    fn list(&self, kind: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Remove a record.  Returns `true` when something was deleted.
    fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(String, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<(String, String), Value>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for MemoryStore {
    fn put(&self, kind: &str, id: &str, body: &Value) -> Result<(), StoreError> {
        self.records()
            .insert((kind.to_string(), id.to_string()), body.clone());
        Ok(())
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .records()
            .get(&(kind.to_string(), id.to_string()))
            .cloned())
    }

    fn list(&self, kind: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .records()
            .iter()
            .filter(|((k, _), _)| k == kind)
            .map(|((_, id), body)| (id.clone(), body.clone()))
            .collect())
    }

    fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .records()
            .remove(&(kind.to_string(), id.to_string()))
            .is_some())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed [`StateStore`].
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use skyward_memory::store::{SqliteStore, StateStore};
///
/// let store = SqliteStore::open_in_memory().unwrap();
/// store.put("task", "task-1", &json!({ "priority": 5 })).unwrap();
///
/// let body = store.get("task", "task-1").unwrap().unwrap();
/// assert_eq!(body["priority"], 5);
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a persistent store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open a temporary in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS state_records (
                kind       TEXT NOT NULL,
                id         TEXT NOT NULL,
                body       TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for SqliteStore {
    fn put(&self, kind: &str, id: &str, body: &Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(body)?;
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO state_records (kind, id, body, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, id) DO UPDATE SET body = excluded.body,
                                                 updated_at = excluded.updated_at",
            params![kind, id, text, now],
        )?;
        Ok(())
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let text: Option<String> = self
            .conn()
            .query_row(
                "SELECT body FROM state_records WHERE kind = ?1 AND id = ?2",
                params![kind, id],
                |row| row.get(0),
            )
            .optional()?;
        text.map(|t| serde_json::from_str(&t))
            .transpose()
            .map_err(StoreError::from)
    }

    fn list(&self, kind: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, body FROM state_records WHERE kind = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map(params![kind], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, text)| Ok((id, serde_json::from_str(&text)?)))
            .collect()
    }

    fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let n = self.conn().execute(
            "DELETE FROM state_records WHERE kind = ?1 AND id = ?2",
            params![kind, id],
        )?;
        Ok(n > 0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(store: &dyn StateStore) {
        assert!(store.get("task", "task-1").unwrap().is_none());

        store.put("task", "task-1", &json!({"status": "pending"})).unwrap();
        store.put("task", "task-2", &json!({"status": "running"})).unwrap();
        store.put("module", "mount", &json!({"status": "idle"})).unwrap();

        // Upsert replaces the body.
        store.put("task", "task-1", &json!({"status": "completed"})).unwrap();
        assert_eq!(
            store.get("task", "task-1").unwrap(),
            Some(json!({"status": "completed"}))
        );

        let tasks = store.list("task").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].0, "task-1");
        assert_eq!(tasks[1].1["status"], "running");

        assert!(store.delete("task", "task-2").unwrap());
        assert!(!store.delete("task", "task-2").unwrap());
        assert_eq!(store.list("task").unwrap().len(), 1);
        assert_eq!(store.list("module").unwrap().len(), 1);
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn sqlite_store_contract() {
        exercise(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skyward.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("task", "task-7", &json!({"priority": 3})).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("task", "task-7").unwrap(), Some(json!({"priority": 3})));
    }

    #[test]
    fn store_error_maps_to_storage() {
        let err = serde_json::from_str::<Value>("{").unwrap_err();
        let sky: SkyError = StoreError::from(err).into();
        assert!(matches!(sky, SkyError::Storage(_)));
    }
}
