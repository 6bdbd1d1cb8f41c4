//! Shared daemon state.
//!
//! Holds what the daemon knows about the ledger connection. Admission state
//! (session, tickets, approvals) lives in
//! [`AccessEngine`](clubhouse_core::engine::AccessEngine); this handle only
//! tracks the chain view shown next to it.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, RwLock};

use crate::ledger::ChainHead;

/// Shared daemon state protected by `Arc<...>`.
pub type SharedState = Arc<DaemonStateHandle>;

/// Handle to daemon state with interior mutability.
pub struct DaemonStateHandle {
    /// The inner mutable state.
    inner: RwLock<LedgerView>,
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    /// Wakes tasks waiting in [`shutdown_requested`](Self::shutdown_requested).
    shutdown_notify: Notify,
    /// Time when the daemon started.
    started_at: DateTime<Utc>,
}

impl DaemonStateHandle {
    /// Create a new daemon state handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LedgerView::default()),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            started_at: Utc::now(),
        }
    }

    /// Create a new shared handle.
    #[must_use]
    pub fn shared() -> SharedState {
        Arc::new(Self::new())
    }

    /// Get read access to the ledger view.
    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, LedgerView> {
        self.inner.read().await
    }

    /// Get write access to the ledger view.
    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, LedgerView> {
        self.inner.write().await
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Completes once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut notified = pin!(self.shutdown_notify.notified());
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Get the daemon start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        let now = Utc::now();
        (now - self.started_at).num_seconds().max(0) as u64
    }
}

impl Default for DaemonStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// What the daemon currently knows about the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerView {
    /// Latest head, possibly provisional.
    pub head: Option<ChainHead>,
    /// When a resolved head last advanced.
    pub head_updated_at: Option<DateTime<Utc>>,
    /// Whether the last ledger call succeeded.
    pub connected: bool,
    /// Whether the ledger has ever been reached.
    pub reachable_once: bool,
    /// Whether the node reported it is still syncing; unknown until queried.
    pub is_syncing: Option<bool>,
}

impl LedgerView {
    /// Records a head.
    ///
    /// Only resolved heads refresh [`head_updated_at`](Self::head_updated_at).
    pub fn set_head(&mut self, head: ChainHead) {
        if head.is_resolved() {
            self.head_updated_at = Some(Utc::now());
        }
        self.head = Some(head);
    }

    /// Returns `true` if a resolved head arrived within `window`.
    #[must_use]
    pub fn is_fresh(&self, window: chrono::Duration) -> bool {
        self.head_updated_at
            .is_some_and(|at| Utc::now() - at <= window)
    }
}
