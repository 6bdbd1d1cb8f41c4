//! Shared fixtures for the daemon integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clubhouse_core::config::GRANT_ADMISSION_TOPIC;
use clubhouse_core::engine::AccessEngine;
use clubhouse_core::store::{CounterStore, MemoryCounterStore, StoreError};
use clubhouse_daemon::ingest::IngestorConfig;
use clubhouse_daemon::ledger::LogFilter;
use clubhouse_daemon::ledger::memory::MemoryLedger;
use clubhouse_daemon::metrics::{SharedMetricsRegistry, new_shared_registry};
use clubhouse_daemon::pipeline::{Pipeline, PipelineConfig};
use clubhouse_daemon::state::{DaemonStateHandle, SharedState};

/// Address of the authorization contract in every fixture.
pub const CONTRACT: &str = "0x5e6dd3a6e5f2f8e5a1b6c0ea5f8c2b1d3c4e5f60";

/// How long `wait_until` polls before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory store whose writes can be refused, as on a full disk.
#[derive(Debug, Default)]
pub struct RefusingStore {
    inner: MemoryCounterStore,
    refuse_writes: AtomicBool,
}

impl RefusingStore {
    /// Makes every later write fail until switched back.
    pub fn refuse_writes(&self, refuse: bool) {
        self.refuse_writes.store(refuse, Ordering::SeqCst);
    }
}

impl CounterStore for RefusingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.refuse_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        self.inner.set(key, value)
    }
}

/// A running pipeline over an in-memory ledger and store.
pub struct Fixture {
    pub ledger: Arc<MemoryLedger>,
    pub store: Arc<dyn CounterStore>,
    pub engine: Arc<AccessEngine>,
    pub state: SharedState,
    pub metrics: SharedMetricsRegistry,
    pub pipeline: Option<Pipeline>,
}

impl Fixture {
    /// Opens an engine on a fresh store without starting the pipeline.
    pub fn new(ledger: MemoryLedger) -> Self {
        Self::with_store(ledger, Arc::new(MemoryCounterStore::new()))
    }

    /// Opens an engine on `store` without starting the pipeline.
    pub fn with_store(ledger: MemoryLedger, store: Arc<dyn CounterStore>) -> Self {
        let engine = Arc::new(AccessEngine::open(Arc::clone(&store)).expect("engine opens"));
        Self {
            ledger: Arc::new(ledger),
            store,
            engine,
            state: DaemonStateHandle::shared(),
            metrics: new_shared_registry().expect("registry"),
            pipeline: None,
        }
    }

    /// Starts the pipeline scanning from `deploy_block`.
    pub fn start(&mut self, deploy_block: u64) {
        let config = PipelineConfig {
            poll_interval: Duration::from_millis(10),
            ingestor: IngestorConfig {
                filter: LogFilter::new(CONTRACT, GRANT_ADMISSION_TOPIC),
                deploy_block,
                retry_delay: Duration::from_millis(10),
            },
            queue_capacity: 64,
        };
        self.pipeline = Some(Pipeline::spawn(
            self.ledger.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.state),
            Arc::clone(&self.metrics),
            config,
        ));
    }

    /// Publishes `passphrase` from the watched contract.
    pub fn grant(&self, passphrase: &str) {
        self.ledger.grant(CONTRACT, GRANT_ADMISSION_TOPIC, passphrase);
    }

    /// Waits until the live subscription is open.
    pub async fn wait_for_subscription(&self) {
        let ledger = Arc::clone(&self.ledger);
        wait_until("live subscription", move || {
            let ledger = Arc::clone(&ledger);
            async move { ledger.subscriber_count() > 0 }
        })
        .await;
    }

    /// Waits until ticket `number` is approved.
    pub async fn wait_for_approval(&self, number: u64) {
        let engine = Arc::clone(&self.engine);
        wait_until("ticket approval", move || {
            let engine = Arc::clone(&engine);
            async move { engine.is_approved(number) }
        })
        .await;
    }

    /// Requests shutdown and waits for every task to stop.
    pub async fn stop(&mut self) {
        self.state.request_shutdown();
        if let Some(pipeline) = self.pipeline.take() {
            tokio::time::timeout(WAIT_TIMEOUT, pipeline.join())
                .await
                .expect("pipeline stops");
        }
    }
}

/// Polls `condition` every few milliseconds until it holds.
///
/// # Panics
///
/// Panics with `what` if the condition does not hold within
/// [`WAIT_TIMEOUT`].
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
