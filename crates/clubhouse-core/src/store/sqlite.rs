//! `SQLite`-backed counter store.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::{CounterStore, StoreError};

/// Counter table schema.
const COUNTER_SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS counters (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
";

/// [`CounterStore`] persisted in a single `SQLite` table.
///
/// Writes run with `synchronous = FULL` so that an acknowledged allocation
/// survives power loss.
#[derive(Clone)]
pub struct SqliteCounterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCounterStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema cannot
    /// be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened counter store");
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(COUNTER_SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

impl CounterStore for SqliteCounterStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM counters WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO counters (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            params![key, value, i64::try_from(now).unwrap_or(i64::MAX)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn in_memory_get_set() {
        let store = SqliteCounterStore::open_in_memory().unwrap();
        assert_eq!(store.get("allocation_count").unwrap(), None);

        store.set("allocation_count", "3").unwrap();
        store.set("allocation_count", "4").unwrap();
        assert_eq!(
            store.get("allocation_count").unwrap().as_deref(),
            Some("4")
        );
    }

    #[test]
    fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counters.db");

        {
            let store = SqliteCounterStore::open(&path).unwrap();
            store.set("session_id", "cafe").unwrap();
        }

        let reopened = SqliteCounterStore::open(&path).unwrap();
        assert_eq!(reopened.get("session_id").unwrap().as_deref(), Some("cafe"));
    }
}
