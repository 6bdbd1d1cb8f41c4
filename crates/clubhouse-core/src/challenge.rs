//! Session identifiers and challenge text.
//!
//! A challenge is the exact string an authority must publish on the ledger to
//! admit a ticket. It is a pure function of the ticket number and the session
//! id, so the engine never persists challenge text: a restart recomputes every
//! challenge from the stored allocation count.
//!
//! # Injectivity
//!
//! Session ids are restricted to ASCII alphanumerics and ticket numbers are
//! rendered in canonical decimal, so `"Admit ticket {n} to event {id}."`
//! parses back to exactly one `(n, id)` pair. Two sessions can only share a
//! challenge if they share an id; freshly generated ids carry 122 bits of
//! randomness.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum accepted length of a session id.
pub const MAX_SESSION_ID_LEN: usize = 64;

const CHALLENGE_PREFIX: &str = "Admit ticket ";
const CHALLENGE_INFIX: &str = " to event ";
const CHALLENGE_SUFFIX: &str = ".";

/// Errors produced when parsing a session id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionIdError {
    /// The id is empty.
    #[error("session id is empty")]
    Empty,

    /// The id exceeds [`MAX_SESSION_ID_LEN`].
    #[error("session id too long: {len} > {MAX_SESSION_ID_LEN}")]
    TooLong {
        /// Length of the rejected id in bytes.
        len: usize,
    },

    /// The id contains a character outside `[0-9A-Za-z]`.
    #[error("session id contains invalid character {ch:?} at byte {position}")]
    InvalidCharacter {
        /// The offending character.
        ch: char,
        /// Byte offset of the character.
        position: usize,
    },
}

/// Opaque identifier scoping every challenge issued during one event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random session id (32 lowercase hex characters).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parses a session id read from storage or supplied by a caller.
    ///
    /// Ids written by earlier releases (eight hex characters) are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionIdError`] if the id is empty, too long, or contains
    /// anything other than ASCII letters and digits.
    pub fn parse(raw: &str) -> Result<Self, SessionIdError> {
        if raw.is_empty() {
            return Err(SessionIdError::Empty);
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong { len: raw.len() });
        }
        if let Some((position, ch)) = raw.char_indices().find(|(_, c)| !c.is_ascii_alphanumeric())
        {
            return Err(SessionIdError::InvalidCharacter { ch, position });
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

/// Returns the challenge text for ticket `number` in `session`.
///
/// This format is what authorities copy into the ledger transaction. It must
/// not change while a session is live.
#[must_use]
pub fn challenge_for(number: u64, session: &SessionId) -> String {
    format!("{CHALLENGE_PREFIX}{number}{CHALLENGE_INFIX}{session}{CHALLENGE_SUFFIX}")
}

/// Parses challenge text produced by [`challenge_for`].
///
/// Returns `None` for anything that [`challenge_for`] could not have produced,
/// including non-canonical numbers such as `01` or `+1`.
#[must_use]
pub fn parse_challenge(text: &str) -> Option<(u64, SessionId)> {
    let rest = text
        .strip_prefix(CHALLENGE_PREFIX)?
        .strip_suffix(CHALLENGE_SUFFIX)?;
    let (number_text, session_text) = rest.split_once(CHALLENGE_INFIX)?;
    if number_text.is_empty()
        || number_text.starts_with('0')
        || !number_text.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let number = number_text.parse().ok()?;
    let session = SessionId::parse(session_text).ok()?;
    Some((number, session))
}
