//! Ticket allocator.

use std::collections::HashMap;

use tracing::debug;

use super::{ALLOCATION_COUNT_KEY, Session, SessionError, Ticket};
use crate::challenge::{SessionId, challenge_for};
use crate::reconcile::ChallengeIndex;
use crate::store::CounterStore;

/// Issues sequential tickets and keeps the challenge -> ticket reverse index.
#[derive(Debug)]
pub struct TicketAllocator {
    pub(super) session: Session,
    pub(super) by_challenge: HashMap<String, u64>,
}

impl TicketAllocator {
    /// Rebuilds the allocator for `session` from its persisted count.
    ///
    /// Replays the bookkeeping for tickets `1..=count` without writing to the
    /// store; the stored count already reflects them.
    #[must_use]
    pub fn rehydrate(session: Session) -> Self {
        let by_challenge = (1..=session.allocation_count)
            .map(|number| (challenge_for(number, &session.id), number))
            .collect::<HashMap<_, _>>();
        debug!(
            session_id = %session.id,
            tickets = by_challenge.len(),
            "rehydrated ticket index"
        );
        Self {
            session,
            by_challenge,
        }
    }

    /// Allocates the next ticket.
    ///
    /// The incremented count is persisted before the ticket is recorded, so a
    /// failed write leaves the allocator exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Persistence`] if the count cannot be stored and
    /// [`SessionError::CountExhausted`] if it would overflow.
    pub fn allocate(&mut self, store: &dyn CounterStore) -> Result<Ticket, SessionError> {
        let count = self.session.allocation_count;
        let number = count
            .checked_add(1)
            .ok_or(SessionError::CountExhausted { count })?;
        let challenge = challenge_for(number, &self.session.id);

        store.set(ALLOCATION_COUNT_KEY, &number.to_string())?;

        self.session.allocation_count = number;
        self.by_challenge.insert(challenge.clone(), number);
        Ok(Ticket { number, challenge })
    }

    /// Returns the ticket issued as `number`, if it has been allocated.
    #[must_use]
    pub fn ticket(&self, number: u64) -> Option<Ticket> {
        (1..=self.session.allocation_count)
            .contains(&number)
            .then(|| Ticket {
                number,
                challenge: challenge_for(number, &self.session.id),
            })
    }

    /// Returns every allocated ticket in number order.
    pub fn tickets(&self) -> impl Iterator<Item = Ticket> + '_ {
        (1..=self.session.allocation_count).map(|number| Ticket {
            number,
            challenge: challenge_for(number, &self.session.id),
        })
    }

    /// Returns the current session.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the current session id.
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    /// Returns the number of tickets allocated in the current session.
    #[must_use]
    pub const fn allocation_count(&self) -> u64 {
        self.session.allocation_count
    }
}

impl ChallengeIndex for TicketAllocator {
    fn ticket_for(&self, challenge: &str) -> Option<u64> {
        self.by_challenge.get(challenge).copied()
    }
}
