//! Domain event model: opaque payloads, authorship, and rebase rewriting.

use serde::{Deserialize, Serialize};

use crate::types::{ClientId, EventSequenceNumber, SessionId};

/// Opaque encoded event payload.
///
/// The core never decodes this; registered materializer handlers do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventArgs {
    /// Raw payload bytes.
    pub bytes: Vec<u8>,
}

impl EventArgs {
    /// Wraps already-encoded payload bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Encodes a serde value as JSON payload bytes.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Decodes the payload as JSON into `T`.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.bytes)
    }
}

/// Opaque backend acknowledgment token attached to a pushed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncMetadata {
    /// Raw token bytes.
    pub bytes: Vec<u8>,
}

/// Immutable domain event.
///
/// A rebase never mutates an event in place; it produces a new value via
/// [`Event::rebased_onto`] with a fresh sequence number and an incremented
/// rebase generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Position of this event in the total order.
    pub seq: EventSequenceNumber,
    /// Position of the event this one chains onto.
    pub parent_seq: EventSequenceNumber,
    /// Event type name, resolved against the materializer registry.
    pub name: String,
    /// Opaque encoded payload.
    pub args: EventArgs,
    /// Authoring client.
    pub client_id: ClientId,
    /// Authoring session within the client.
    pub session_id: SessionId,
    /// Backend ack token, present once the push has been acknowledged.
    pub sync_metadata: Option<SyncMetadata>,
}

impl Event {
    /// Authors a fresh event chained onto `head`.
    ///
    /// Pushable events take the next optimistic global position; local-only
    /// events take the next client-local position.
    pub fn new_local(
        head: EventSequenceNumber,
        name: impl Into<String>,
        args: EventArgs,
        client_id: ClientId,
        session_id: SessionId,
        local_only: bool,
    ) -> Self {
        let seq = if local_only {
            head.next_local()
        } else {
            head.next_global()
        };
        Self {
            seq,
            parent_seq: head,
            name: name.into(),
            args,
            client_id,
            session_id,
            sync_metadata: None,
        }
    }

    /// Rewrites this event under a new parent.
    ///
    /// Payload and authorship are preserved; the sequence number is reissued
    /// after `parent` in the same numbering class the event already used, and
    /// the rebase generation is incremented.
    pub fn rebased_onto(&self, parent: EventSequenceNumber) -> Self {
        let mut seq = if self.seq.is_client_local() {
            parent.next_local()
        } else {
            parent.next_global()
        };
        seq.rebase_generation = self.seq.rebase_generation + 1;
        Self {
            seq,
            parent_seq: parent,
            name: self.name.clone(),
            args: self.args.clone(),
            client_id: self.client_id,
            session_id: self.session_id,
            sync_metadata: None,
        }
    }

    /// Identity-and-payload equality.
    ///
    /// True only when position, rebase generation, name, and payload all
    /// match. Ack metadata is excluded: a confirmed echo of a pushed event is
    /// still the same event.
    pub fn same_as(&self, other: &Event) -> bool {
        self.seq == other.seq
            && self.seq.rebase_generation == other.seq.rebase_generation
            && self.name == other.name
            && self.args == other.args
            && self.client_id == other.client_id
    }
}
