//! Approval reconciliation.
//!
//! Two producers race to complete a match: the allocator issues a ticket and
//! its challenge, and the ledger reveals a passphrase. Either can happen first.
//! The [`ApprovalReconciler`] checks for a match on both arrivals, so the end
//! state depends only on *which* tickets and passphrases exist, never on the
//! order they arrived in:
//!
//! ```text
//!   allocate ──► on_allocated(ticket) ──┐
//!                                       ├──► approved ⊇ { t | challenge(t) ∈ observed }
//!   ledger  ──► observe(passphrase)  ───┘
//! ```
//!
//! # Invariants
//!
//! - A ticket is approved iff its challenge is in the observed set.
//! - The approved set only grows until [`ApprovalReconciler::clear_approvals`]
//!   is called by a session reset.
//! - Observations are never cleared; stale ones cannot match a new session
//!   because challenges embed the session id.


use std::collections::{BTreeSet, HashSet};

use tracing::info;

use crate::session::Ticket;

/// Reverse index from challenge text to ticket number.
pub trait ChallengeIndex {
    /// Returns the ticket whose challenge is exactly `challenge`.
    fn ticket_for(&self, challenge: &str) -> Option<u64>;
}

/// Result of a reconciliation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The ticket was approved by this call.
    Approved(u64),
    /// The ticket was already approved; nothing changed.
    AlreadyApproved(u64),
    /// No ticket matched yet.
    Unmatched,
}

impl Reconciliation {
    /// Returns the ticket number newly approved by this call, if any.
    #[must_use]
    pub const fn newly_approved(self) -> Option<u64> {
        match self {
            Self::Approved(number) => Some(number),
            Self::AlreadyApproved(_) | Self::Unmatched => None,
        }
    }
}

/// Observed passphrases and approved tickets.
#[derive(Debug, Default)]
pub struct ApprovalReconciler {
    observed: HashSet<String>,
    approved: BTreeSet<u64>,
}

impl ApprovalReconciler {
    /// Creates an empty reconciler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a passphrase seen on the ledger and approves its ticket if one
    /// has been allocated.
    pub fn observe(&mut self, passphrase: &str, index: &impl ChallengeIndex) -> Reconciliation {
        self.observed.insert(passphrase.to_string());
        match index.ticket_for(passphrase) {
            Some(number) => self.approve(number),
            None => Reconciliation::Unmatched,
        }
    }

    /// Approves a freshly allocated ticket if its passphrase was already seen.
    pub fn on_allocated(&mut self, ticket: &Ticket) -> Reconciliation {
        if self.observed.contains(&ticket.challenge) {
            self.approve(ticket.number)
        } else {
            Reconciliation::Unmatched
        }
    }

    fn approve(&mut self, number: u64) -> Reconciliation {
        if self.approved.insert(number) {
            info!(ticket = number, "ticket approved");
            Reconciliation::Approved(number)
        } else {
            Reconciliation::AlreadyApproved(number)
        }
    }

    /// Drops every approval. Observations are kept.
    pub fn clear_approvals(&mut self) {
        self.approved.clear();
    }

    /// Returns `true` if `passphrase` has been observed.
    #[must_use]
    pub fn has_observed(&self, passphrase: &str) -> bool {
        self.observed.contains(passphrase)
    }

    /// Returns `true` if ticket `number` is approved.
    #[must_use]
    pub fn is_approved(&self, number: u64) -> bool {
        self.approved.contains(&number)
    }

    /// Returns the approved ticket numbers in ascending order.
    #[must_use]
    pub fn approved(&self) -> Vec<u64> {
        self.approved.iter().copied().collect()
    }

    /// Returns the number of distinct passphrases observed.
    #[must_use]
    pub fn observed_len(&self) -> usize {
        self.observed.len()
    }
}
