//! Prometheus metrics for admission observability.
//!
//! # Metrics Families
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `clubhouse_tickets_allocated_total` | Counter | Tickets allocated | |
//! | `clubhouse_tickets_approved_total` | Counter | Tickets newly approved | |
//! | `clubhouse_passphrases_observed_total` | Counter | Passphrases delivered by the ledger | `origin` |
//! | `clubhouse_malformed_events_total` | Counter | Logs skipped as malformed | |
//! | `clubhouse_ledger_errors_total` | Counter | Failed ledger calls | `operation` |
//! | `clubhouse_chain_head_block` | Gauge | Latest observed head | |
//! | `clubhouse_session_resets_total` | Counter | Session resets | |
//!
//! # Usage
//!
//! ```rust
//! use clubhouse_daemon::metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new().unwrap();
//! registry.clubhouse_metrics().ticket_allocated();
//!
//! let output = registry.encode_text().unwrap();
//! assert!(output.contains("clubhouse_tickets_allocated_total 1"));
//! ```

use std::sync::Arc;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Where an observed passphrase came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationOrigin {
    /// Historical backlog query.
    Historical,
    /// Live subscription.
    Live,
}

impl ObservationOrigin {
    /// Returns the label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Live => "live",
        }
    }
}

/// Admission daemon metrics.
///
/// All metrics use interior mutability and are safe to share across threads.
#[derive(Clone)]
pub struct ClubhouseMetrics {
    tickets_allocated_total: IntCounter,
    tickets_approved_total: IntCounter,
    passphrases_observed_total: IntCounterVec,
    malformed_events_total: IntCounter,
    ledger_errors_total: IntCounterVec,
    chain_head_block: IntGauge,
    session_resets_total: IntCounter,
}

impl ClubhouseMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let tickets_allocated_total = IntCounter::new(
            "clubhouse_tickets_allocated_total",
            "Total tickets allocated",
        )?;
        registry.register(Box::new(tickets_allocated_total.clone()))?;

        let tickets_approved_total = IntCounter::new(
            "clubhouse_tickets_approved_total",
            "Total tickets newly approved",
        )?;
        registry.register(Box::new(tickets_approved_total.clone()))?;

        let passphrases_observed_total = IntCounterVec::new(
            Opts::new(
                "clubhouse_passphrases_observed_total",
                "Total passphrases delivered by the ledger",
            ),
            &["origin"],
        )?;
        registry.register(Box::new(passphrases_observed_total.clone()))?;

        let malformed_events_total = IntCounter::new(
            "clubhouse_malformed_events_total",
            "Total ledger logs skipped as malformed",
        )?;
        registry.register(Box::new(malformed_events_total.clone()))?;

        let ledger_errors_total = IntCounterVec::new(
            Opts::new("clubhouse_ledger_errors_total", "Total failed ledger calls"),
            &["operation"],
        )?;
        registry.register(Box::new(ledger_errors_total.clone()))?;

        let chain_head_block =
            IntGauge::new("clubhouse_chain_head_block", "Latest observed head block")?;
        registry.register(Box::new(chain_head_block.clone()))?;

        let session_resets_total =
            IntCounter::new("clubhouse_session_resets_total", "Total session resets")?;
        registry.register(Box::new(session_resets_total.clone()))?;

        Ok(Self {
            tickets_allocated_total,
            tickets_approved_total,
            passphrases_observed_total,
            malformed_events_total,
            ledger_errors_total,
            chain_head_block,
            session_resets_total,
        })
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Records a ticket allocation.
    pub fn ticket_allocated(&self) {
        self.tickets_allocated_total.inc();
    }

    /// Records a newly approved ticket.
    pub fn ticket_approved(&self) {
        self.tickets_approved_total.inc();
    }

    /// Returns the number of approvals recorded.
    #[must_use]
    pub fn approved_count(&self) -> u64 {
        self.tickets_approved_total.get()
    }

    /// Records a session reset.
    pub fn session_reset(&self) {
        self.session_resets_total.inc();
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    /// Records a passphrase delivered by the ledger.
    pub fn passphrase_observed(&self, origin: ObservationOrigin) {
        self.passphrases_observed_total
            .with_label_values(&[origin.as_str()])
            .inc();
    }

    /// Returns the number of passphrases observed from `origin`.
    #[must_use]
    pub fn observed_count(&self, origin: ObservationOrigin) -> u64 {
        self.passphrases_observed_total
            .with_label_values(&[origin.as_str()])
            .get()
    }

    /// Records a log skipped as malformed.
    pub fn malformed_event(&self) {
        self.malformed_events_total.inc();
    }

    /// Returns the number of malformed logs skipped.
    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.malformed_events_total.get()
    }

    /// Records a failed ledger call.
    ///
    /// # Arguments
    ///
    /// * `operation` - The failed call (e.g., `head_block_number`,
    ///   `grant_logs`)
    pub fn ledger_error(&self, operation: &'static str) {
        self.ledger_errors_total
            .with_label_values(&[operation])
            .inc();
    }

    /// Returns the number of failures recorded for `operation`.
    #[must_use]
    pub fn ledger_error_count(&self, operation: &'static str) -> u64 {
        self.ledger_errors_total
            .with_label_values(&[operation])
            .get()
    }

    /// Records the latest head.
    pub fn chain_head(&self, number: u64) {
        self.chain_head_block
            .set(i64::try_from(number).unwrap_or(i64::MAX));
    }
}

/// Metrics registry wrapper that holds the Prometheus registry and the
/// daemon metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    clubhouse_metrics: ClubhouseMetrics,
}

impl MetricsRegistry {
    /// Creates a new metrics registry with all daemon metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let clubhouse_metrics = ClubhouseMetrics::new(&registry)?;
        Ok(Self {
            registry,
            clubhouse_metrics,
        })
    }

    /// Returns a reference to the daemon metrics.
    #[must_use]
    pub const fn clubhouse_metrics(&self) -> &ClubhouseMetrics {
        &self.clubhouse_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry for use across the daemon.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}
