//! Local-first sync reconciliation over a durable SQLite event log.
//!
//! Application changes are events chained by sequence number. A pure
//! reconciliation algorithm ([`core::state::update`]) decides, for every
//! local push and every upstream delivery, whether history advances or must
//! be rebased; the store applies the decision transactionally, keeping an
//! invertible changeset per event so confirmed-but-revertible history can be
//! rolled back byte for byte.
//!
//! # Examples
//!
//! Pure algorithm usage with [`core::state::update`]:
//! ```
//! use synclog::{
//!     core::state::{update, Outcome, SyncState, Update, UpdateContext},
//!     event::{Event, EventArgs},
//!     types::EventSequenceNumber,
//! };
//!
//! let state = SyncState::new();
//! let event = Event::new_local(
//!     EventSequenceNumber::ROOT,
//!     "note_added",
//!     EventArgs::from_bytes(b"{}".to_vec()),
//!     1,
//!     1,
//!     false,
//! );
//! let is_local = |e: &Event| e.client_id == 1;
//! let is_equal = |a: &Event, b: &Event| a.same_as(b);
//! let rebase = |e: &Event, parent| e.rebased_onto(parent);
//! let ctx = UpdateContext {
//!     is_local_event: &is_local,
//!     is_equal_event: &is_equal,
//!     rebase: &rebase,
//! };
//! let outcome = update(state, Update::LocalPush { new_events: vec![event] }, &ctx)
//!     .expect("valid chain");
//! assert!(matches!(outcome, Outcome::Advance { .. }));
//! ```
//!
//! Leader usage with a SQLite log:
//! ```no_run
//! use std::sync::Arc;
//! use synclog::{
//!     backend::Backend,
//!     leader::processor::{spawn_leader, LeaderConfig},
//!     materialize::MaterializerRegistry,
//!     store::sqlite::SqliteEventLog,
//! };
//!
//! # async fn run<B: Backend>(backend: B, registry: MaterializerRegistry) {
//! let mut log = SqliteEventLog::open("synclog.db").expect("open sqlite");
//! log.ensure_state_schema("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT);")
//!     .expect("state schema");
//! let handle = spawn_leader(
//!     Box::new(log),
//!     Arc::new(registry),
//!     backend,
//!     LeaderConfig::default(),
//! )
//! .expect("boot");
//! handle.wait_ready().await;
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Upstream backend abstraction for pull and push.
pub mod backend;
/// Pure reconciliation algorithm and its state.
pub mod core;
/// Event identity, payloads, and rebase rewriting.
pub mod event;
/// Single-writer leader processor and session fan-out.
pub mod leader;
/// Event handlers, changeset capture, and inverse application.
pub mod materialize;
/// Durable transactional event log over SQLite.
pub mod store;
/// Shared identifier and sequence-number types.
pub mod types;
