//! Small key-value state shared between flow runs.
//!
//! Flows keep two kinds of state: single values (last execution timestamps,
//! published API payloads) and short bounded lists (per camera prediction
//! history). [`SqliteStateStore`] persists both in one file;
//! [`MemoryStateStore`] backs tests and dry runs.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::error::FlowError;
use crate::error::FlowResult;

/// Storage contract for flow state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> FlowResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> FlowResult<()>;

    /// Appends `value` to the list at `key`, keeps only the newest `max_len`
    /// entries and returns the list oldest first.
    fn push_bounded(&self, key: &str, value: &str, max_len: usize) -> FlowResult<Vec<String>>;

    /// Returns the list at `key` oldest first; missing lists are empty.
    fn list(&self, key: &str) -> FlowResult<Vec<String>>;
}

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS list_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_list_items_key ON list_items (key, id);
";

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish_non_exhaustive()
    }
}

impl SqliteStateStore {
    /// Opens or creates the state database at `path`.
    pub fn open(path: &Path) -> FlowResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| FlowError::io(parent, err))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> FlowResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> FlowResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| FlowError::StatePoisoned)
    }
}

fn select_list(conn: &Connection, key: &str) -> FlowResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT value FROM list_items WHERE key = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: &str) -> FlowResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> FlowResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE
             SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    fn push_bounded(&self, key: &str, value: &str, max_len: usize) -> FlowResult<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO list_items (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        let keep = i64::try_from(max_len).unwrap_or(i64::MAX);
        tx.execute(
            "DELETE FROM list_items WHERE key = ?1 AND id NOT IN (
                SELECT id FROM list_items WHERE key = ?1 ORDER BY id DESC LIMIT ?2
            )",
            params![key, keep],
        )?;
        let values = select_list(&tx, key)?;
        tx.commit()?;
        Ok(values)
    }

    fn list(&self, key: &str) -> FlowResult<Vec<String>> {
        let conn = self.lock()?;
        select_list(&conn, key)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, String>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> FlowResult<Option<String>> {
        let values = self.values.lock().map_err(|_| FlowError::StatePoisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> FlowResult<()> {
        let mut values = self.values.lock().map_err(|_| FlowError::StatePoisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn push_bounded(&self, key: &str, value: &str, max_len: usize) -> FlowResult<Vec<String>> {
        let mut lists = self.lists.lock().map_err(|_| FlowError::StatePoisoned)?;
        let list = lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        while list.len() > max_len {
            list.pop_front();
        }
        Ok(list.iter().cloned().collect())
    }

    fn list(&self, key: &str) -> FlowResult<Vec<String>> {
        let lists = self.lists.lock().map_err(|_| FlowError::StatePoisoned)?;
        Ok(lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }
}
