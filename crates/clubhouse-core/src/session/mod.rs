//! Event sessions and ticket allocation.
//!
//! A session is one logical event occurrence. It is identified by a
//! [`SessionId`] and carries a single durable counter: the number of tickets
//! allocated so far. Ticket `n` of a session always has challenge
//! [`challenge_for(n, id)`](crate::challenge::challenge_for), which is what
//! makes restart rehydration possible from the count alone.
//!
//! # Persistence Layout
//!
//! | Key | Value |
//! |-----|-------|
//! | [`SESSION_ID_KEY`] | session id |
//! | [`ALLOCATION_COUNT_KEY`] | decimal allocation count |
//!
//! A new session writes the count before the id, so a new id is never paired
//! with the previous session's count. When the id write fails during
//! [`Session::replace`], the previous count is written back.

mod allocator;
mod error;


pub use allocator::TicketAllocator;
pub use error::SessionError;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::challenge::SessionId;
use crate::store::CounterStore;

/// Store key holding the current session id.
pub const SESSION_ID_KEY: &str = "session_id";

/// Store key holding the allocation count of the current session.
pub const ALLOCATION_COUNT_KEY: &str = "allocation_count";

/// A numbered admission slot and the challenge that approves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Sequential ticket number, starting at 1.
    pub number: u64,
    /// The exact text an authority must publish to approve this ticket.
    pub challenge: String,
}

/// The current session and its allocation count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    allocation_count: u64,
}

impl Session {
    /// Loads the session from `store`, starting a new one if none exists.
    ///
    /// A missing count under an existing id is treated as zero and written
    /// back.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the store fails or holds a value that
    /// cannot be parsed.
    pub fn load_or_create(store: &dyn CounterStore) -> Result<Self, SessionError> {
        let Some(raw_id) = store.get(SESSION_ID_KEY)? else {
            return Self::begin(store);
        };
        let id = SessionId::parse(&raw_id).map_err(|source| SessionError::CorruptSessionId {
            value: raw_id.clone(),
            source,
        })?;

        let allocation_count = match store.get(ALLOCATION_COUNT_KEY)? {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| SessionError::CorruptAllocationCount { value: raw })?,
            None => {
                store.set(ALLOCATION_COUNT_KEY, "0")?;
                0
            },
        };

        info!(session_id = %id, allocation_count, "loaded session");
        Ok(Self {
            id,
            allocation_count,
        })
    }

    /// Starts a fresh session with a random id and persists it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Persistence`] if either write fails.
    pub fn begin(store: &dyn CounterStore) -> Result<Self, SessionError> {
        let id = SessionId::generate();
        store.set(ALLOCATION_COUNT_KEY, "0")?;
        store.set(SESSION_ID_KEY, id.as_str())?;
        info!(session_id = %id, "started new session");
        Ok(Self {
            id,
            allocation_count: 0,
        })
    }

    /// Starts a fresh session that supersedes `self` and persists it.
    ///
    /// If the new id cannot be written, the count of `self` is written back
    /// so the store keeps describing `self`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Persistence`] if either write fails.
    pub fn replace(&self, store: &dyn CounterStore) -> Result<Self, SessionError> {
        let id = SessionId::generate();
        store.set(ALLOCATION_COUNT_KEY, "0")?;
        if let Err(e) = store.set(SESSION_ID_KEY, id.as_str()) {
            if let Err(restore) =
                store.set(ALLOCATION_COUNT_KEY, &self.allocation_count.to_string())
            {
                error!(
                    session_id = %self.id,
                    allocation_count = self.allocation_count,
                    error = %restore,
                    "failed to restore allocation count after aborted reset"
                );
            }
            return Err(e.into());
        }
        info!(previous_session = %self.id, session_id = %id, "started new session");
        Ok(Self {
            id,
            allocation_count: 0,
        })
    }

    /// Returns the session id.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the number of tickets allocated in this session.
    #[must_use]
    pub const fn allocation_count(&self) -> u64 {
        self.allocation_count
    }
}
