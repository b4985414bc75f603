//! Key-value stores backing the token cache

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::TokenError;

/// Minimal get/set contract for persisting the token
pub trait TokenStore: Send + Sync {
    /// Read the value stored under `key`
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the backend cannot be read
    fn get(&self, key: &str) -> Result<Option<String>, TokenError>;

    /// Store `value` under `key`, replacing any previous value
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the backend cannot be written
    fn set(&self, key: &str, value: &str) -> Result<(), TokenError>;

    /// Remove the value stored under `key`
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the backend cannot be written
    fn remove(&self, key: &str) -> Result<(), TokenError>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>, TokenError> {
        self.entries
            .lock()
            .map(|entries| entries.get(key).cloned())
            .map_err(|e| TokenError::Storage(e.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), TokenError> {
        self.entries
            .lock()
            .map(|mut entries| {
                entries.insert(key.to_string(), value.to_string());
            })
            .map_err(|e| TokenError::Storage(e.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), TokenError> {
        self.entries
            .lock()
            .map(|mut entries| {
                entries.remove(key);
            })
            .map_err(|e| TokenError::Storage(e.to_string()))
    }
}

/// `SQLite`-backed store surviving process restarts
pub struct SqliteTokenStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteTokenStore {
    /// Open (or create) the store at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or initialized
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TokenError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| TokenError::Storage(e.to_string()))?;
        }

        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = Pool::builder()
            .max_size(2)
            .build(manager)
            .map_err(|e| TokenError::Storage(e.to_string()))?;

        let store = Self { pool };
        store.init()?;

        tracing::debug!(path = %path.as_ref().display(), "token store opened");
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be initialized
    pub fn open_in_memory() -> Result<Self, TokenError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| TokenError::Storage(e.to_string()))?;

        let store = Self { pool };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), TokenError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|e| TokenError::Storage(e.to_string()))
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, TokenError> {
        self.pool
            .get()
            .map_err(|e| TokenError::Storage(e.to_string()))
    }
}

impl TokenStore for SqliteTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>, TokenError> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(TokenError::Storage(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), TokenError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            rusqlite::params![key, value],
        )
        .map_err(|e| TokenError::Storage(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), TokenError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])
            .map_err(|e| TokenError::Storage(e.to_string()))?;
        Ok(())
    }
}
