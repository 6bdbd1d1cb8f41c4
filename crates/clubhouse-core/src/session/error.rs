//! Session lifecycle error types.

use thiserror::Error;

use crate::challenge::SessionIdError;
use crate::store::StoreError;

/// Errors that can occur while loading, allocating in, or resetting a session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The counter store failed. During allocation this means the ticket was
    /// not issued.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// The stored session id is not a valid id.
    #[error("stored session id {value:?} is corrupt: {source}")]
    CorruptSessionId {
        /// The raw stored value.
        value: String,
        /// Why it was rejected.
        source: SessionIdError,
    },

    /// The stored allocation count is not a decimal `u64`.
    #[error("stored allocation count {value:?} is corrupt")]
    CorruptAllocationCount {
        /// The raw stored value.
        value: String,
    },

    /// The allocation count cannot grow any further.
    #[error("allocation count exhausted at {count}")]
    CountExhausted {
        /// The count that could not be incremented.
        count: u64,
    },

    /// A reset was confirmed against a session that is no longer current.
    #[error("reset confirmation names session {provided}, current session is {current}")]
    ConfirmationMismatch {
        /// The session currently in effect.
        current: String,
        /// The session named by the caller.
        provided: String,
    },
}

impl SessionError {
    /// Returns `true` if the error came from the counter store.
    #[must_use]
    pub const fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
