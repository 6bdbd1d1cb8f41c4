//! `GrantAdmission(string passphrase)` log decoding.
//!
//! The passphrase is the event's only parameter and is not indexed, so it is
//! ABI-encoded in the log data as a dynamic `string`:
//!
//! ```text
//! word 0            offset of the string head (normally 0x20)
//! word at offset    byte length L
//! following words   L bytes of UTF-8, zero-padded to a word boundary
//! ```
//!
//! Anything that does not fit this shape is a malformed event. Decoding never
//! panics on hostile input; the `grant_log_decode` fuzz target holds it to
//! that.

use thiserror::Error;

use super::RawLog;

/// ABI word size in bytes.
pub const WORD: usize = 32;

/// Errors produced while decoding a `GrantAdmission` log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LogDecodeError {
    /// The log has no topics.
    #[error("log has no event topic")]
    MissingTopic,

    /// `topics[0]` is not the `GrantAdmission` signature.
    #[error("unexpected event topic {found}")]
    UnexpectedTopic {
        /// The topic found on the log.
        found: String,
    },

    /// The data field is not valid hex.
    #[error("log data is not valid hex: {0}")]
    InvalidHex(String),

    /// The data ends before a word or the string body it declares.
    #[error("log data truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// An offset or length word does not fit in memory.
    #[error("ABI word out of range")]
    WordOutOfRange,

    /// The passphrase bytes are not UTF-8.
    #[error("passphrase is not valid UTF-8")]
    InvalidUtf8,
}

/// Extracts the passphrase from a `GrantAdmission` log.
///
/// # Errors
///
/// Returns [`LogDecodeError`] if the log carries a different event or its
/// data is not a well-formed ABI `string`.
pub fn decode_grant_passphrase(log: &RawLog, expected_topic: &str) -> Result<String, LogDecodeError> {
    let topic = log.topics.first().ok_or(LogDecodeError::MissingTopic)?;
    if !topic.eq_ignore_ascii_case(expected_topic) {
        return Err(LogDecodeError::UnexpectedTopic {
            found: topic.clone(),
        });
    }
    let data = decode_hex(&log.data)?;
    decode_string(&data)
}

/// Decodes a single ABI-encoded dynamic `string` from `data`.
///
/// # Errors
///
/// Returns [`LogDecodeError`] if offsets or lengths point outside `data` or
/// the bytes are not UTF-8.
pub fn decode_string(data: &[u8]) -> Result<String, LogDecodeError> {
    let offset = read_word(data, 0)?;
    let length = read_word(data, offset)?;
    let start = offset
        .checked_add(WORD)
        .ok_or(LogDecodeError::WordOutOfRange)?;
    let end = start
        .checked_add(length)
        .ok_or(LogDecodeError::WordOutOfRange)?;
    let bytes = data.get(start..end).ok_or(LogDecodeError::Truncated {
        needed: end,
        available: data.len(),
    })?;
    String::from_utf8(bytes.to_vec()).map_err(|_| LogDecodeError::InvalidUtf8)
}

/// ABI-encodes `passphrase` as `GrantAdmission` log data (`0x`-prefixed hex).
#[must_use]
pub fn encode_grant_passphrase(passphrase: &str) -> String {
    let bytes = passphrase.as_bytes();
    let padded = bytes.len().div_ceil(WORD) * WORD;
    let mut data = Vec::with_capacity(2 * WORD + padded);
    data.extend_from_slice(&word(WORD));
    data.extend_from_slice(&word(bytes.len()));
    data.extend_from_slice(bytes);
    data.resize(2 * WORD + padded, 0);
    format!("0x{}", hex::encode(data))
}

fn decode_hex(data: &str) -> Result<Vec<u8>, LogDecodeError> {
    let digits = data
        .strip_prefix("0x")
        .or_else(|| data.strip_prefix("0X"))
        .unwrap_or(data);
    hex::decode(digits).map_err(|e| LogDecodeError::InvalidHex(e.to_string()))
}

fn read_word(data: &[u8], at: usize) -> Result<usize, LogDecodeError> {
    let end = at.checked_add(WORD).ok_or(LogDecodeError::WordOutOfRange)?;
    let word = data.get(at..end).ok_or(LogDecodeError::Truncated {
        needed: end,
        available: data.len(),
    })?;
    let (high, low) = word.split_at(WORD - 8);
    if high.iter().any(|b| *b != 0) {
        return Err(LogDecodeError::WordOutOfRange);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(low);
    usize::try_from(u64::from_be_bytes(buf)).map_err(|_| LogDecodeError::WordOutOfRange)
}

fn word(value: usize) -> [u8; WORD] {
    let mut out = [0u8; WORD];
    let value = u64::try_from(value).unwrap_or(u64::MAX);
    out[WORD - 8..].copy_from_slice(&value.to_be_bytes());
    out
}
