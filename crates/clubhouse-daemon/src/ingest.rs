//! Authorization event ingestion.
//!
//! [`EventIngestor`] turns `GrantAdmission` logs into passphrase
//! observations. It is activated once, when the ledger is first reachable,
//! and then runs two feeds side by side:
//!
//! - history over `[deploy_block, head]`, queried in
//!   [`HISTORY_CHUNK_BLOCKS`]-sized ranges, each retried until it succeeds
//! - live logs from `head + 1`, resubscribing if the stream ends
//!
//! A history range the provider keeps rejecting therefore never holds back
//! live grants. Both feeds push into the same bounded queue, drained by a single
//! [`run_reconciler`] task that feeds the
//! [`AccessEngine`](clubhouse_core::engine::AccessEngine). Historical and live
//! deliveries may interleave with allocations in any order; the engine does
//! not care.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clubhouse_core::engine::AccessEngine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ledger::abi::decode_grant_passphrase;
use crate::ledger::{LedgerClient, LogFilter, RawLog};
use crate::metrics::{ObservationOrigin, SharedMetricsRegistry};
use crate::state::SharedState;

/// Default delay before retrying a failed historical query or subscription.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Widest block range requested by one historical query.
pub const HISTORY_CHUNK_BLOCKS: u64 = 2_000;

/// Default capacity of the observation queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A passphrase read from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// The decoded passphrase.
    pub passphrase: String,
    /// Whether it came from history or the live stream.
    pub origin: ObservationOrigin,
    /// Block of the originating log.
    pub block_number: Option<u64>,
}

/// Ingestor configuration.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Contract and event to follow.
    pub filter: LogFilter,
    /// First block of the historical replay.
    pub deploy_block: u64,
    /// Delay between retries.
    pub retry_delay: Duration,
}

/// Reads `GrantAdmission` logs and queues their passphrases.
pub struct EventIngestor {
    ledger: Arc<dyn LedgerClient>,
    config: IngestorConfig,
    queue: mpsc::Sender<Observation>,
    metrics: SharedMetricsRegistry,
    state: SharedState,
    activated: AtomicBool,
}

impl EventIngestor {
    /// Creates an inactive ingestor.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        config: IngestorConfig,
        queue: mpsc::Sender<Observation>,
        metrics: SharedMetricsRegistry,
        state: SharedState,
    ) -> Self {
        Self {
            ledger,
            config,
            queue,
            metrics,
            state,
            activated: AtomicBool::new(false),
        }
    }

    /// Returns `true` once [`activate`](Self::activate) has run.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Starts ingestion with `latest_head` as the history/live boundary.
    ///
    /// Only the first call has any effect; later calls return `None`.
    pub fn activate(self: &Arc<Self>, latest_head: u64) -> Option<JoinHandle<()>> {
        if self.activated.swap(true, Ordering::SeqCst) {
            debug!(latest_head, "event ingestor already active");
            return None;
        }
        info!(
            from_block = self.config.deploy_block,
            latest_head, "activating event ingestor"
        );
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let state = Arc::clone(&this.state);
            tokio::select! {
                () = this.ingest(latest_head) => {},
                () = state.shutdown_requested() => {
                    info!("event ingestor shutting down");
                },
            }
        }))
    }

    async fn ingest(&self, latest_head: u64) {
        tokio::join!(
            self.replay_history(latest_head),
            self.follow(latest_head.saturating_add(1)),
        );
    }

    async fn replay_history(&self, latest_head: u64) {
        let first = self.config.deploy_block;
        if first > latest_head {
            debug!(from = first, latest_head, "no history to replay");
            return;
        }

        let mut replayed = 0usize;
        let mut from = first;
        while from <= latest_head {
            let to = latest_head.min(from.saturating_add(HISTORY_CHUNK_BLOCKS - 1));
            let logs = self.history_chunk(from, to).await;
            debug!(events = logs.len(), from, to, "replaying historical grants");
            for log in &logs {
                if !self.forward(log, ObservationOrigin::Historical).await {
                    return;
                }
            }
            replayed += logs.len();
            if to == u64::MAX {
                break;
            }
            from = to + 1;
        }
        info!(events = replayed, from = first, to = latest_head, "historical replay complete");
    }

    async fn history_chunk(&self, from: u64, to: u64) -> Vec<RawLog> {
        loop {
            match self.ledger.grant_logs(&self.config.filter, from, to).await {
                Ok(logs) => return logs,
                Err(e) => {
                    warn!(error = %e, from, to, "historical grant query failed (will retry)");
                    self.metrics.clubhouse_metrics().ledger_error("grant_logs");
                    tokio::time::sleep(self.config.retry_delay).await;
                },
            }
        }
    }

    async fn follow(&self, from_block: u64) {
        let mut next = from_block;
        loop {
            let mut subscription = match self.ledger.subscribe(&self.config.filter, next).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(error = %e, from_block = next, "grant subscription failed (will retry)");
                    self.metrics.clubhouse_metrics().ledger_error("subscribe");
                    tokio::time::sleep(self.config.retry_delay).await;
                    continue;
                },
            };
            info!(from_block = next, "following live grants");

            while let Some(delivery) = subscription.next().await {
                match delivery {
                    Ok(log) => {
                        if let Some(block) = log.block_number {
                            next = next.max(block);
                        }
                        if !self.forward(&log, ObservationOrigin::Live).await {
                            return;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "grant subscription error");
                        self.metrics.clubhouse_metrics().ledger_error("subscription");
                    },
                }
            }

            // Resubscribing from the last delivered block may repeat logs;
            // observations are idempotent.
            warn!(from_block = next, "grant subscription ended; resubscribing");
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Decodes `log` and queues its passphrase. Returns `false` if the queue
    /// closed.
    async fn forward(&self, log: &RawLog, origin: ObservationOrigin) -> bool {
        let passphrase = match decode_grant_passphrase(log, &self.config.filter.topic) {
            Ok(passphrase) => passphrase,
            Err(e) => {
                warn!(
                    error = %e,
                    block = ?log.block_number,
                    transaction = ?log.transaction_hash,
                    "skipping malformed grant event"
                );
                self.metrics.clubhouse_metrics().malformed_event();
                return true;
            },
        };
        self.metrics.clubhouse_metrics().passphrase_observed(origin);
        let observation = Observation {
            passphrase,
            origin,
            block_number: log.block_number,
        };
        if self.queue.send(observation).await.is_err() {
            debug!("observation queue closed");
            return false;
        }
        true
    }
}

/// Applies queued observations to `engine` until every sender is dropped.
pub async fn run_reconciler(
    engine: Arc<AccessEngine>,
    mut queue: mpsc::Receiver<Observation>,
    metrics: SharedMetricsRegistry,
) {
    while let Some(observation) = queue.recv().await {
        // The engine lock may be held across a durable store write.
        let observer = Arc::clone(&engine);
        let passphrase = observation.passphrase.clone();
        let outcome = match tokio::task::spawn_blocking(move || observer.observe(&passphrase)).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "observation task failed");
                continue;
            },
        };
        if let Some(ticket) = outcome.newly_approved() {
            metrics.clubhouse_metrics().ticket_approved();
            debug!(
                ticket,
                origin = observation.origin.as_str(),
                block = ?observation.block_number,
                "approval from ledger"
            );
        }
    }
    debug!("observation queue drained");
}
