//! Shared primitive IDs and the event ordering key.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Per-device client identifier.
pub type ClientId = u64;
/// Per-session identifier within one client.
pub type SessionId = u64;

/// Total ordering key for events.
///
/// `global` orders events once the backend has acknowledged them; `client`
/// orders client-local events that are never acknowledged (acknowledged
/// events always carry `client = 0`); `rebase_generation` counts how many
/// times the event has been rewritten under a new parent.
///
/// Ordering and equality are lexicographic over `(global, client)` only.
/// `rebase_generation` is metadata: two sequence numbers that occupy the same
/// position compare equal even when their generations differ.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EventSequenceNumber {
    /// Backend-acknowledged position.
    pub global: u64,
    /// Client-local position after `global`.
    pub client: u64,
    /// Rewrite counter, bumped on every rebase.
    pub rebase_generation: u32,
}

impl EventSequenceNumber {
    /// Reserved value preceding all events.
    pub const ROOT: Self = Self {
        global: 0,
        client: 0,
        rebase_generation: 0,
    };

    /// Next client-local sequence number after `self`.
    ///
    /// Used for local-only events, which interleave between acknowledged
    /// positions and are never confirmed by the backend.
    pub fn next_local(self) -> Self {
        Self {
            global: self.global,
            client: self.client + 1,
            rebase_generation: 0,
        }
    }

    /// Next acknowledged-form sequence number after `self`.
    ///
    /// Pushable events are numbered optimistically in this form; the backend
    /// either confirms them verbatim or forces a rebase.
    pub fn next_global(self) -> Self {
        Self {
            global: self.global + 1,
            client: 0,
            rebase_generation: 0,
        }
    }

    /// True when this number orders client-locally (`client > 0`).
    pub fn is_client_local(&self) -> bool {
        self.client > 0
    }
}

impl PartialEq for EventSequenceNumber {
    fn eq(&self, other: &Self) -> bool {
        self.global == other.global && self.client == other.client
    }
}

impl Eq for EventSequenceNumber {}

impl PartialOrd for EventSequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventSequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.global, self.client).cmp(&(other.global, other.client))
    }
}

impl Hash for EventSequenceNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.global.hash(state);
        self.client.hash(state);
    }
}
