//! Wiring of the ledger-facing tasks.
//!
//! ```text
//!   HeadMonitor ──HeadEvent──► coordinator ──activate(head)──► EventIngestor
//!                                   │                              │
//!                              is_syncing                     Observation
//!                                                                  ▼
//!                                                     run_reconciler ──► AccessEngine
//! ```
//!
//! The coordinator reacts to the first [`HeadEvent::LedgerReachable`] by
//! querying the sync status once and activating the ingestor with the head
//! reported at that moment.

use std::sync::Arc;
use std::time::Duration;

use clubhouse_core::config::LedgerConfig;
use clubhouse_core::engine::AccessEngine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::head_monitor::{HeadEvent, HeadMonitor};
use crate::ingest::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRY_DELAY, EventIngestor, IngestorConfig, run_reconciler,
};
use crate::ledger::{LedgerClient, LogFilter};
use crate::metrics::SharedMetricsRegistry;
use crate::state::SharedState;

/// Bound on draining queued observations at shutdown.
const RECONCILER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Head poll interval.
    pub poll_interval: Duration,
    /// Ingestor settings.
    pub ingestor: IngestorConfig,
    /// Capacity of the observation queue.
    pub queue_capacity: usize,
}

impl PipelineConfig {
    /// Derives the pipeline settings from the ledger section of the config.
    #[must_use]
    pub fn from_ledger_config(config: &LedgerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            ingestor: IngestorConfig {
                filter: LogFilter::new(&config.contract_address, &config.grant_event_topic),
                deploy_block: config.deploy_block,
                retry_delay: DEFAULT_RETRY_DELAY,
            },
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Handles to the running pipeline tasks.
pub struct Pipeline {
    ingestor: Arc<EventIngestor>,
    monitor: JoinHandle<()>,
    coordinator: JoinHandle<()>,
    reconciler: JoinHandle<()>,
}

impl Pipeline {
    /// Spawns the monitor, coordinator and reconciler tasks.
    ///
    /// `engine` must already be rehydrated; observations start flowing as
    /// soon as the ledger answers.
    #[must_use]
    pub fn spawn(
        ledger: Arc<dyn LedgerClient>,
        engine: Arc<AccessEngine>,
        state: SharedState,
        metrics: SharedMetricsRegistry,
        config: PipelineConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ingestor = Arc::new(EventIngestor::new(
            Arc::clone(&ledger),
            config.ingestor,
            queue_tx,
            Arc::clone(&metrics),
            Arc::clone(&state),
        ));

        let reconciler = tokio::spawn(run_reconciler(engine, queue_rx, Arc::clone(&metrics)));

        let monitor = HeadMonitor::new(
            Arc::clone(&ledger),
            Arc::clone(&state),
            Arc::clone(&metrics),
            events_tx,
            config.poll_interval,
        );
        let monitor = tokio::spawn(monitor.run());

        let coordinator = tokio::spawn(coordinate(
            events_rx,
            ledger,
            Arc::clone(&ingestor),
            state,
            metrics,
        ));

        Self {
            ingestor,
            monitor,
            coordinator,
            reconciler,
        }
    }

    /// Returns the ingestor.
    #[must_use]
    pub fn ingestor(&self) -> &Arc<EventIngestor> {
        &self.ingestor
    }

    /// Waits for the monitor and coordinator to stop, then stops the
    /// reconciler.
    ///
    /// Call after requesting shutdown.
    pub async fn join(self) {
        if let Err(e) = self.monitor.await {
            warn!(error = %e, "head monitor task failed");
        }
        if let Err(e) = self.coordinator.await {
            warn!(error = %e, "coordinator task failed");
        }
        // The ingestor holds the only queue sender; once it is gone the
        // reconciler drains and exits.
        drop(self.ingestor);
        match tokio::time::timeout(RECONCILER_DRAIN_TIMEOUT, self.reconciler).await {
            Ok(Ok(())) => debug!("pipeline stopped"),
            Ok(Err(e)) => warn!(error = %e, "reconciler task failed"),
            Err(_) => warn!("reconciler did not drain before timeout"),
        }
    }
}

async fn coordinate(
    mut events: mpsc::UnboundedReceiver<HeadEvent>,
    ledger: Arc<dyn LedgerClient>,
    ingestor: Arc<EventIngestor>,
    state: SharedState,
    metrics: SharedMetricsRegistry,
) {
    let mut ingest_task = None;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            () = state.shutdown_requested() => None,
        };
        let Some(event) = event else { break };

        match event {
            HeadEvent::LedgerReachable { head } => {
                match ledger.is_syncing().await {
                    Ok(syncing) => {
                        info!(syncing, "ledger sync status");
                        state.write().await.is_syncing = Some(syncing);
                    },
                    Err(e) => {
                        warn!(error = %e, "failed to query sync status");
                        metrics.clubhouse_metrics().ledger_error("is_syncing");
                    },
                }
                if let Some(task) = ingestor.activate(head) {
                    ingest_task = Some(task);
                }
            },
            HeadEvent::HeadAdvanced(head) => {
                debug!(block = head.number, "head advanced");
            },
        }
    }

    if let Some(task) = ingest_task {
        if let Err(e) = task.await {
            warn!(error = %e, "event ingestor task failed");
        }
    }
}
