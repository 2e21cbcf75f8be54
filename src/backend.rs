//! Backend boundary: the pull/push contract the leader consumes.

use std::future::Future;

use crate::{
    event::{Event, SyncMetadata},
    types::EventSequenceNumber,
};

/// One chunk of the backend's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamChunk {
    /// The backend extended its log.
    Advance {
        /// Events after the pull cursor, in backend order.
        events: Vec<Event>,
        /// Backend's estimate of events still queued behind this chunk.
        /// A UI/backpressure hint, never a correctness signal.
        remaining: usize,
    },
    /// The backend discarded everything after `rollback_until`.
    Rebase {
        /// Last surviving backend position.
        rollback_until: EventSequenceNumber,
        /// Replacement events chaining from `rollback_until`.
        events: Vec<Event>,
        /// Backlog hint, as above.
        remaining: usize,
    },
}

/// Push-path errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The caller's view of the backend head is stale; wait for the next
    /// pull chunk before retrying.
    ServerAhead,
    /// Talking to the wrong backend instance. Fatal.
    BackendIdMismatch,
    /// Retryable transport failure.
    Transport(String),
}

/// Pull-path errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullError {
    /// The stream is permanently closed.
    Closed,
    /// Retryable transport failure.
    Transport(String),
}

/// Connection to the single authoritative backend.
///
/// Clones share the underlying connection: the pull loop and the push loop
/// each own one clone and drive it independently.
pub trait Backend: Clone + Send + 'static {
    /// Waits for and returns the next chunk after `cursor`.
    fn pull_next(
        &mut self,
        cursor: EventSequenceNumber,
    ) -> impl Future<Output = Result<UpstreamChunk, PullError>> + Send;

    /// Pushes a batch, returning one ack token per event on success.
    fn push(
        &mut self,
        batch: &[Event],
    ) -> impl Future<Output = Result<Vec<SyncMetadata>, PushError>> + Send;

    /// Resolves once the backend is reachable.
    fn wait_connected(&mut self) -> impl Future<Output = ()> + Send;
}
