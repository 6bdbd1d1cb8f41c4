//! In-process ledger.
//!
//! [`MemoryLedger`] mines blocks on demand and delivers logs to live
//! subscribers as soon as they are emitted. Connectivity loss, missing block
//! hashes, and subscription errors can be injected, which makes it the ledger
//! of choice for monitor, ingestor, and end-to-end tests.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::abi::encode_grant_passphrase;
use super::{ChainHead, LedgerClient, LedgerError, LogFilter, RawLog, Subscription};

/// Buffer of each subscription channel.
const SUBSCRIPTION_BUFFER: usize = 1024;

struct Subscriber {
    filter: LogFilter,
    from_block: u64,
    sender: mpsc::Sender<Result<RawLog, LedgerError>>,
}

#[derive(Default)]
struct LedgerState {
    head: u64,
    logs: Vec<RawLog>,
    subscribers: Vec<Subscriber>,
    unreachable: bool,
    withhold_hashes: bool,
    syncing: bool,
    history_failures: usize,
}

/// Scriptable in-memory ledger.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Creates a ledger whose head is block 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ledger whose head is `head`.
    #[must_use]
    pub fn at_height(head: u64) -> Self {
        let ledger = Self::new();
        ledger.lock().head = head;
        ledger
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mines an empty block and returns its number.
    pub fn mine_block(&self) -> u64 {
        let mut state = self.lock();
        state.head += 1;
        state.head
    }

    /// Mines a block containing a `GrantAdmission(passphrase)` log from
    /// `address` and returns the log.
    pub fn grant(&self, address: &str, topic: &str, passphrase: &str) -> RawLog {
        self.emit(address, topic, encode_grant_passphrase(passphrase))
    }

    /// Mines a block containing a log with arbitrary `data`.
    pub fn emit(&self, address: &str, topic: &str, data: String) -> RawLog {
        let mut state = self.lock();
        state.head += 1;
        let block = state.head;
        let log = RawLog {
            address: address.to_string(),
            topics: vec![topic.to_string()],
            data,
            block_number: Some(block),
            transaction_hash: Some(format!("0x{block:064x}")),
            log_index: Some(0),
        };
        state.logs.push(log.clone());
        state.subscribers.retain(|sub| {
            if !sub.filter.matches(&log) || block < sub.from_block {
                return !sub.sender.is_closed();
            }
            sub.sender.try_send(Ok(log.clone())).is_ok()
        });
        log
    }

    /// Delivers `error` to every live subscriber.
    pub fn fail_subscriptions(&self, error: &LedgerError) {
        let mut state = self.lock();
        state
            .subscribers
            .retain(|sub| sub.sender.try_send(Err(error.clone())).is_ok());
    }

    /// Makes every call fail with [`LedgerError::Unreachable`] until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Makes [`LedgerClient::block`] return heads without a hash.
    pub fn withhold_hashes(&self, withhold: bool) {
        self.lock().withhold_hashes = withhold;
    }

    /// Sets the value reported by [`LedgerClient::is_syncing`].
    pub fn set_syncing(&self, syncing: bool) {
        self.lock().syncing = syncing;
    }

    /// Makes the next `count` historical log queries fail.
    pub fn fail_history_queries(&self, count: usize) {
        self.lock().history_failures = count;
    }

    /// Returns the number of open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|sub| !sub.sender.is_closed());
        state.subscribers.len()
    }

    fn reachable(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        let state = self.lock();
        if state.unreachable {
            return Err(LedgerError::Unreachable("connection refused".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn head_block_number(&self) -> Result<u64, LedgerError> {
        Ok(self.reachable()?.head)
    }

    async fn block(&self, number: u64) -> Result<ChainHead, LedgerError> {
        let state = self.reachable()?;
        if number > state.head {
            return Err(LedgerError::NotFound { number });
        }
        if state.withhold_hashes {
            return Ok(ChainHead::provisional(number));
        }
        Ok(ChainHead {
            number,
            hash: Some(format!("0x{number:064x}")),
            timestamp: Some(1_500_000_000 + number * 15),
        })
    }

    async fn grant_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, LedgerError> {
        let mut state = self.reachable()?;
        if state.history_failures > 0 {
            state.history_failures -= 1;
            return Err(LedgerError::Rpc {
                code: -32005,
                message: "query returned more than 10000 results".to_string(),
            });
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| filter.matches(log))
            .filter(|log| log.block_number.is_some_and(|b| (from..=to).contains(&b)))
            .cloned()
            .collect())
    }

    async fn subscribe(
        &self,
        filter: &LogFilter,
        from_block: u64,
    ) -> Result<Subscription, LedgerError> {
        let mut state = self.reachable()?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // Logs already mined at or after `from_block` are delivered first, as
        // a polling provider would.
        for log in state.logs.iter().filter(|log| {
            filter.matches(log) && log.block_number.is_some_and(|b| b >= from_block)
        }) {
            if sender.try_send(Ok(log.clone())).is_err() {
                break;
            }
        }
        state.subscribers.push(Subscriber {
            filter: filter.clone(),
            from_block,
            sender,
        });
        Ok(Subscription::new(receiver, None))
    }

    async fn is_syncing(&self) -> Result<bool, LedgerError> {
        Ok(self.reachable()?.syncing)
    }
}
