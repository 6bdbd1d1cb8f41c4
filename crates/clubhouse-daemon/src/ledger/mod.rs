//! Ledger access.
//!
//! The daemon reads three things from the ledger: the current head, the block
//! behind it, and `GrantAdmission` logs emitted by the authorization
//! contract. [`LedgerClient`] is the seam between the daemon and whatever
//! node it talks to:
//!
//! - [`rpc::JsonRpcLedgerClient`]: JSON-RPC over HTTP(S)
//! - [`memory::MemoryLedger`]: scriptable in-process ledger for tests
//!
//! Every call may fail transiently. Callers log the error and retry on their
//! next tick; nothing here is fatal to the daemon.

pub mod abi;
pub mod memory;
pub mod rpc;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors returned by a [`LedgerClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    /// The node could not be reached.
    #[error("ledger unreachable: {0}")]
    Unreachable(String),

    /// The call did not complete within the configured timeout.
    #[error("ledger call {operation} timed out after {timeout:?}")]
    Timeout {
        /// Name of the timed-out call.
        operation: &'static str,
        /// Timeout that expired.
        timeout: Duration,
    },

    /// The requested block does not exist (yet).
    #[error("block {number} not found")]
    NotFound {
        /// Requested block number.
        number: u64,
    },

    /// The node returned a JSON-RPC error object.
    #[error("ledger rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// The node answered with something that is not a valid response.
    #[error("invalid ledger response: {0}")]
    InvalidResponse(String),

    /// The provider endpoint cannot be used.
    #[error("invalid provider endpoint: {0}")]
    InvalidEndpoint(String),
}

impl LedgerError {
    /// Returns `true` if the node could not be reached at all.
    ///
    /// Drives the `connected` flag shown to operators.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout { .. })
    }
}

/// A block as seen by the head monitor.
///
/// A head whose `hash` is `None` is provisional: its number is known but the
/// block itself has not been fetched yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    /// Block number.
    pub number: u64,
    /// Block hash, once resolved.
    pub hash: Option<String>,
    /// Block timestamp in seconds since the Unix epoch, once resolved.
    pub timestamp: Option<u64>,
}

impl ChainHead {
    /// Creates a provisional head carrying only a number.
    #[must_use]
    pub const fn provisional(number: u64) -> Self {
        Self {
            number,
            hash: None,
            timestamp: None,
        }
    }

    /// Returns `true` once the block details have been fetched.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.hash.is_some()
    }
}

/// A raw log entry as returned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    /// Emitting contract address.
    pub address: String,
    /// Indexed topics, `topics[0]` being the event signature hash.
    pub topics: Vec<String>,
    /// `0x`-prefixed hex of the non-indexed data.
    pub data: String,
    /// Block containing the log, if mined.
    pub block_number: Option<u64>,
    /// Transaction that emitted the log.
    pub transaction_hash: Option<String>,
    /// Position of the log within its block.
    pub log_index: Option<u64>,
}

/// Selects the logs of one event on one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    /// Contract address.
    pub address: String,
    /// Event signature topic.
    pub topic: String,
}

impl LogFilter {
    /// Creates a filter for `topic` events emitted by `address`.
    #[must_use]
    pub fn new(address: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topic: topic.into(),
        }
    }

    /// Returns `true` if `log` was emitted by the filtered contract with the
    /// filtered topic. Hex comparisons ignore case.
    #[must_use]
    pub fn matches(&self, log: &RawLog) -> bool {
        log.address.eq_ignore_ascii_case(&self.address)
            && log
                .topics
                .first()
                .is_some_and(|topic| topic.eq_ignore_ascii_case(&self.topic))
    }
}

/// Push-delivered stream of logs.
///
/// Errors are delivered in-band and do not end the stream. Dropping the
/// subscription stops the producer.
pub struct Subscription {
    receiver: mpsc::Receiver<Result<RawLog, LedgerError>>,
    producer: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wraps a channel fed by `producer`.
    #[must_use]
    pub fn new(
        receiver: mpsc::Receiver<Result<RawLog, LedgerError>>,
        producer: Option<JoinHandle<()>>,
    ) -> Self {
        Self { receiver, producer }
    }

    /// Waits for the next delivery.
    ///
    /// Returns `None` only if the producer has gone away.
    pub async fn next(&mut self) -> Option<Result<RawLog, LedgerError>> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("has_producer", &self.producer.is_some())
            .finish_non_exhaustive()
    }
}

/// Read access to the ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Returns the number of the latest block.
    async fn head_block_number(&self) -> Result<u64, LedgerError>;

    /// Fetches block `number`.
    async fn block(&self, number: u64) -> Result<ChainHead, LedgerError>;

    /// Returns logs matching `filter` in blocks `from..=to`.
    async fn grant_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, LedgerError>;

    /// Streams logs matching `filter` from `from_block` onwards.
    async fn subscribe(
        &self,
        filter: &LogFilter,
        from_block: u64,
    ) -> Result<Subscription, LedgerError>;

    /// Returns `true` if the node is still catching up with the network.
    async fn is_syncing(&self) -> Result<bool, LedgerError>;
}
