//! Chain head monitor.
//!
//! Polls the ledger head on a fixed interval and keeps the shared
//! [`LedgerView`](crate::state::LedgerView) current:
//!
//! ```text
//!   Unknown ──first successful poll──► Polling ──new block fetched──► Advancing
//!                                         ▲                              │
//!                                         └── block fetch failed ◄── Stale (same head)
//! ```
//!
//! The first successful poll emits [`HeadEvent::LedgerReachable`] exactly
//! once. Each newly fetched block emits [`HeadEvent::HeadAdvanced`]. Ledger
//! errors are logged and retried on the next tick; the monitor runs until
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::ledger::{ChainHead, LedgerClient, LedgerError};
use crate::metrics::SharedMetricsRegistry;
use crate::state::SharedState;

/// Notifications emitted by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadEvent {
    /// The ledger answered for the first time; carries the head at that
    /// moment.
    LedgerReachable {
        /// Head block number.
        head: u64,
    },
    /// A block with a new number was fetched.
    HeadAdvanced(ChainHead),
}

/// Monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    /// No successful poll yet.
    Unknown,
    /// Reachable, waiting for the current head's block.
    Polling,
    /// The last tick fetched a new block.
    Advancing,
    /// The last tick saw the same head as before.
    Stale,
}

/// Polls the ledger head.
pub struct HeadMonitor {
    ledger: Arc<dyn LedgerClient>,
    state: SharedState,
    metrics: SharedMetricsRegistry,
    events: mpsc::UnboundedSender<HeadEvent>,
    poll_interval: Duration,
    phase: MonitorPhase,
    last_seen: Option<u64>,
}

impl HeadMonitor {
    /// Creates a monitor publishing to `events`.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        state: SharedState,
        metrics: SharedMetricsRegistry,
        events: mpsc::UnboundedSender<HeadEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            state,
            metrics,
            events,
            poll_interval,
            phase: MonitorPhase::Unknown,
            last_seen: None,
        }
    }

    /// Returns the current phase.
    #[must_use]
    pub const fn phase(&self) -> MonitorPhase {
        self.phase
    }

    /// Polls until shutdown is requested.
    #[allow(clippy::cast_possible_truncation)] // poll_interval is bounded by config validation
    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "head monitor starting"
        );
        let state = Arc::clone(&self.state);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                () = state.shutdown_requested() => break,
            }
        }
        info!("head monitor shutting down");
    }

    /// Runs one poll.
    pub async fn tick(&mut self) -> MonitorPhase {
        let number = match self.ledger.head_block_number().await {
            Ok(number) => number,
            Err(e) => {
                self.ledger_failed("head_block_number", &e).await;
                return self.phase;
            },
        };

        let first_contact = {
            let mut view = self.state.write().await;
            view.connected = true;
            !std::mem::replace(&mut view.reachable_once, true)
        };
        if first_contact {
            info!(head = number, "ledger reachable");
            self.publish(HeadEvent::LedgerReachable { head: number });
        }
        if self.phase == MonitorPhase::Unknown {
            self.phase = MonitorPhase::Polling;
        }

        if self.last_seen == Some(number) {
            self.phase = MonitorPhase::Stale;
            return self.phase;
        }

        {
            let mut view = self.state.write().await;
            if !view.head.as_ref().is_some_and(ChainHead::is_resolved) {
                view.set_head(ChainHead::provisional(number));
            }
        }
        self.metrics.clubhouse_metrics().chain_head(number);

        match self.ledger.block(number).await {
            Ok(head) => {
                debug!(block = number, resolved = head.is_resolved(), "chain head advanced");
                self.last_seen = Some(number);
                self.state.write().await.set_head(head.clone());
                self.publish(HeadEvent::HeadAdvanced(head));
                self.phase = MonitorPhase::Advancing;
            },
            Err(e) => {
                self.ledger_failed("block", &e).await;
                self.phase = MonitorPhase::Polling;
            },
        }
        self.phase
    }

    async fn ledger_failed(&self, operation: &'static str, error: &LedgerError) {
        warn!(operation, error = %error, "ledger call failed (will retry)");
        self.metrics.clubhouse_metrics().ledger_error(operation);
        if error.is_connectivity() {
            self.state.write().await.connected = false;
        }
    }

    fn publish(&self, event: HeadEvent) {
        if self.events.send(event).is_err() {
            debug!("no head event listener");
        }
    }
}
