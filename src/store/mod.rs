//! Durable, transactional event log plus materialized state.

pub mod sqlite;

use std::sync::atomic::AtomicBool;

use crate::{
    event::{Event, SyncMetadata},
    materialize::{MaterializeError, MaterializerRegistry},
    types::EventSequenceNumber,
};

/// Errors from the event log store.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite failure.
    Sqlite(rusqlite::Error),
    /// Changeset or metadata (de)serialization failure.
    Serde(serde_json::Error),
    /// Handler failure while materializing an event.
    Materialize(MaterializeError),
    /// The apply batch was cancelled; the transaction was rolled back.
    Interrupted,
    /// A rollback referenced an event the log does not hold.
    MissingEvent(EventSequenceNumber),
    /// Anything else.
    Message(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

impl From<MaterializeError> for StoreError {
    fn from(value: MaterializeError) -> Self {
        Self::Materialize(value)
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable event log with transactional apply and rollback.
///
/// Writers are single-owner: the leader moves the log into its apply task
/// and back, so no two transactions ever race.
pub trait EventLog: Send {
    /// Applies a batch of events in one transaction: runs each registered
    /// handler, persists the event row and its invertible changeset, and
    /// optionally advances the stored backend head.
    ///
    /// `cancel` is observed between events and before commit; once it is
    /// set the whole transaction rolls back and [`StoreError::Interrupted`]
    /// is returned. No partial application of a batch is ever observable.
    fn apply_batch(
        &mut self,
        events: &[Event],
        registry: &MaterializerRegistry,
        cancel: &AtomicBool,
        new_backend_head: Option<EventSequenceNumber>,
    ) -> StoreResult<()>;

    /// Undoes `rollback` (given newest first) and applies `new_events`, all
    /// in one transaction, optionally advancing the stored backend head.
    fn rollback_and_apply(
        &mut self,
        rollback: &[EventSequenceNumber],
        new_events: &[Event],
        registry: &MaterializerRegistry,
        new_backend_head: Option<EventSequenceNumber>,
    ) -> StoreResult<()>;

    /// Undoes the listed events (newest first) in one transaction: inverts
    /// each stored changeset and deletes the event and changeset rows.
    fn rollback_events(&mut self, seqs: &[EventSequenceNumber]) -> StoreResult<()>;

    /// Stamps backend ack tokens onto pushed rows. The only permitted
    /// update to a log row.
    fn attach_sync_metadata(
        &mut self,
        acks: &[(EventSequenceNumber, SyncMetadata)],
    ) -> StoreResult<()>;

    /// Last backend-confirmed position, [`EventSequenceNumber::ROOT`] when
    /// nothing has been confirmed.
    fn backend_head(&self) -> StoreResult<EventSequenceNumber>;

    /// Events strictly after `seq`, in order.
    fn events_after(&self, seq: EventSequenceNumber) -> StoreResult<Vec<Event>>;

    /// Highest position present in the log, ROOT when empty.
    fn latest_head(&self) -> StoreResult<EventSequenceNumber>;

    /// Deletes changeset rows strictly before `seq` once the revertible
    /// tail has been trimmed past them. Returns the number removed.
    fn prune_changesets_before(&mut self, seq: EventSequenceNumber) -> StoreResult<usize>;
}
