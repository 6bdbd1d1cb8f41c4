//! Persistent counter store.
//!
//! The engine persists exactly two strings: the session id and the number of
//! tickets allocated in that session. Everything else is derived. This module
//! defines the [`CounterStore`] seam and its two backends:
//!
//! - [`MemoryCounterStore`]: process-local, for tests and dry runs
//! - [`SqliteCounterStore`]: durable, used by the daemon

mod sqlite;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub use sqlite::SqliteCounterStore;
use thiserror::Error;

/// Errors surfaced by a [`CounterStore`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The backing database rejected the operation.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A lock guarding the backend was poisoned by a panicking writer.
    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),

    /// The backend refused the write for another reason.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable string key/value storage that survives process restarts.
///
/// Implementations must make a successful [`set`](Self::set) visible to every
/// later [`get`](Self::get), including one issued by a new process.
pub trait CounterStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write is not durable.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-memory [`CounterStore`].
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `entries`.
    #[must_use]
    pub fn with_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl CounterStore for MemoryCounterStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
