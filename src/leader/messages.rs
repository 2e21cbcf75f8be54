//! Messages fanned out to sessions and caller-visible leader errors.

use crate::core::state::InvariantViolation;
use crate::event::Event;
use crate::store::StoreError;
use crate::types::EventSequenceNumber;

/// Broadcast to every connected local session after a committed apply.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// The leader extended its log; apply `new_events` in order.
    UpstreamAdvance {
        /// Committed new events.
        new_events: Vec<Event>,
    },
    /// The leader rebased; undo everything after `rollback_until`, then
    /// apply `new_events` in order.
    UpstreamRebase {
        /// Last position that survives on sessions.
        rollback_until: EventSequenceNumber,
        /// Replacement tail, upstream-confirmed events first, rewritten
        /// local events after.
        new_events: Vec<Event>,
    },
}

/// Non-recoverable defects that abort the leader.
#[derive(Debug)]
pub enum StructuralDefect {
    /// A local push produced a rebase outcome; the leader is authoritative
    /// over its own pushes, so this cannot be reconciled.
    LocalPushRebase,
    /// A reconciliation outcome violated the chaining invariant.
    ChainInvariant(InvariantViolation),
    /// The apply-path transaction failed.
    ApplyFailed(StoreError),
    /// The push loop reached the wrong backend instance.
    BackendIdMismatch,
    /// The algorithm rejected upstream input, which has no recovery path.
    UnexpectedReject,
}

/// Caller-visible leader errors.
///
/// `LeaderAhead` and `InvalidPush` are retryable by the caller after
/// refetching state; `Fatal` means the leader has aborted.
#[derive(Debug)]
pub enum LeaderError {
    /// The push chained behind the leader's current head; refetch state,
    /// re-author at or after `expected_min`, and retry.
    LeaderAhead {
        /// Smallest admissible sequence number for a retried push.
        expected_min: EventSequenceNumber,
    },
    /// The pushed events do not form a valid chain.
    InvalidPush(InvariantViolation),
    /// A store read failed on a query path.
    Store(StoreError),
    /// The leader aborted with a structural defect.
    Fatal(StructuralDefect),
    /// The leader is gone.
    ChannelClosed,
}

impl From<StoreError> for LeaderError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}
