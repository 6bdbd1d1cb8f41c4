//! Access engine: the single owner of session, ticket, and approval state.
//!
//! [`AccessEngine`] wraps the [`TicketAllocator`] and the
//! [`ApprovalReconciler`] behind one mutex. Every public operation runs in a
//! single critical section, so no caller ever sees an allocation without its
//! reconciliation check, or a reset that cleared tickets but not approvals.
//!
//! # Lock Discipline
//!
//! `observe` and `on_allocated` are pure in-memory work. `allocate` and
//! `reset_session` also write to the counter store while holding the lock;
//! that write is what keeps the persisted count in step with the in-memory
//! index, so it cannot move outside the critical section.
//!
//! Any call may therefore wait for one durable store write. Async callers
//! reach the engine from a blocking task (`tokio::task::spawn_blocking`),
//! never directly from a runtime worker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::challenge::{SessionId, parse_challenge};
use crate::reconcile::{ApprovalReconciler, Reconciliation};
use crate::session::{Session, SessionError, Ticket, TicketAllocator};
use crate::store::CounterStore;

/// Explicit confirmation required to discard the current session.
///
/// The caller names the session it believes is current. If another reset
/// happened in between, the names differ and the reset is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetConfirmation {
    /// Id of the session being discarded.
    pub confirm_session_id: String,
}

impl ResetConfirmation {
    /// Confirms the reset of `session_id`.
    #[must_use]
    pub fn for_session(session_id: &SessionId) -> Self {
        Self {
            confirm_session_id: session_id.to_string(),
        }
    }
}

/// Point-in-time view of the engine for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Current session id.
    pub session_id: SessionId,
    /// Tickets allocated in the current session.
    pub allocation_count: u64,
    /// Approved ticket numbers, ascending.
    pub approved: Vec<u64>,
    /// The most recently allocated ticket in this process, if any.
    pub latest_ticket: Option<Ticket>,
    /// Distinct passphrases observed since startup.
    pub observed_passphrases: usize,
}

struct EngineState {
    allocator: TicketAllocator,
    reconciler: ApprovalReconciler,
    latest_ticket: Option<Ticket>,
}

/// Serialization point for all admission state.
pub struct AccessEngine {
    store: Arc<dyn CounterStore>,
    state: Mutex<EngineState>,
}

impl AccessEngine {
    /// Loads (or starts) the session and rehydrates its tickets.
    ///
    /// Must run before any ledger observation is delivered.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the store cannot be read or holds corrupt
    /// values.
    pub fn open(store: Arc<dyn CounterStore>) -> Result<Self, SessionError> {
        let session = Session::load_or_create(store.as_ref())?;
        let allocator = TicketAllocator::rehydrate(session);
        let mut reconciler = ApprovalReconciler::new();
        for ticket in allocator.tickets() {
            if let Reconciliation::Approved(number) = reconciler.on_allocated(&ticket) {
                info!(ticket = number, "found existing approved ticket");
            }
        }
        Ok(Self {
            store,
            state: Mutex::new(EngineState {
                allocator,
                reconciler,
                latest_ticket: None,
            }),
        })
    }

    // Every mutation below completes or leaves state untouched, so a panic in
    // another holder cannot leave a half-applied update behind.
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates the next ticket and reconciles it against passphrases
    /// already observed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Persistence`] if the new count cannot be
    /// stored; no ticket is issued in that case.
    pub fn allocate(&self) -> Result<Ticket, SessionError> {
        self.allocate_and_reconcile().map(|(ticket, _)| ticket)
    }

    /// Like [`allocate`](Self::allocate), also returning the outcome of the
    /// allocation-side check.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    pub fn allocate_and_reconcile(&self) -> Result<(Ticket, Reconciliation), SessionError> {
        let mut state = self.lock();
        let ticket = state.allocator.allocate(self.store.as_ref())?;
        let outcome = state.reconciler.on_allocated(&ticket);
        state.latest_ticket = Some(ticket.clone());
        debug!(ticket = ticket.number, "allocated ticket");
        Ok((ticket, outcome))
    }

    /// Re-runs the allocation-side check for `ticket`.
    ///
    /// [`allocate`](Self::allocate) already does this; calling it again is a
    /// no-op. Tickets from a previous session never match.
    pub fn on_allocated(&self, ticket: &Ticket) -> Reconciliation {
        let mut state = self.lock();
        let issued = state
            .allocator
            .ticket(ticket.number)
            .is_some_and(|current| current == *ticket);
        if !issued {
            return Reconciliation::Unmatched;
        }
        state.reconciler.on_allocated(ticket)
    }

    /// Records a passphrase observed on the ledger.
    pub fn observe(&self, passphrase: &str) -> Reconciliation {
        let mut state = self.lock();
        let EngineState {
            allocator,
            reconciler,
            ..
        } = &mut *state;
        let outcome = reconciler.observe(passphrase, &*allocator);
        if outcome == Reconciliation::Unmatched {
            if let Some((number, session)) = parse_challenge(passphrase) {
                debug!(
                    ticket = number,
                    passphrase_session = %session,
                    current_session = %allocator.session_id(),
                    "observed challenge for a ticket not issued in this session"
                );
            }
        }
        outcome
    }

    /// Discards the current session and starts a new one.
    ///
    /// Clears tickets and approvals. Observed passphrases are kept; they can
    /// no longer match because every challenge embeds the session id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConfirmationMismatch`] if `confirmation` does
    /// not name the current session, or [`SessionError::Persistence`] if the
    /// new session cannot be stored. State is unchanged on error.
    pub fn reset_session(
        &self,
        confirmation: &ResetConfirmation,
    ) -> Result<SessionId, SessionError> {
        let mut state = self.lock();
        let current = state.allocator.session_id();
        if confirmation.confirm_session_id != current.as_str() {
            return Err(SessionError::ConfirmationMismatch {
                current: current.to_string(),
                provided: confirmation.confirm_session_id.clone(),
            });
        }
        let previous = current.clone();

        let session = state.allocator.session().replace(self.store.as_ref())?;
        let id = session.id().clone();
        state.allocator = TicketAllocator::rehydrate(session);
        state.reconciler.clear_approvals();
        state.latest_ticket = None;

        info!(previous_session = %previous, session_id = %id, "session reset");
        Ok(id)
    }

    /// Returns the current session id.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.lock().allocator.session_id().clone()
    }

    /// Returns `true` if ticket `number` is approved in the current session.
    #[must_use]
    pub fn is_approved(&self, number: u64) -> bool {
        self.lock().reconciler.is_approved(number)
    }

    /// Returns a consistent view of the engine.
    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.lock();
        EngineSnapshot {
            session_id: state.allocator.session_id().clone(),
            allocation_count: state.allocator.allocation_count(),
            approved: state.reconciler.approved(),
            latest_ticket: state.latest_ticket.clone(),
            observed_passphrases: state.reconciler.observed_len(),
        }
    }
}

impl std::fmt::Debug for AccessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("AccessEngine")
            .field("session_id", &snapshot.session_id)
            .field("allocation_count", &snapshot.allocation_count)
            .field("approved", &snapshot.approved.len())
            .finish_non_exhaustive()
    }
}
