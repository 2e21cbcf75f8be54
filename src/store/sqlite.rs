//! SQLite-backed event log with transactional apply and rollback.
//!
//! One database holds the log tables and the application state tables, so a
//! single transaction spans both — the two-database split in the data model
//! is logical, not physical.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::{
    event::{Event, EventArgs, SyncMetadata},
    materialize::{Changeset, MaterializerRegistry, StateWriter},
    types::EventSequenceNumber,
};

use super::{EventLog, StoreError, StoreResult};

const BACKEND_HEAD: &str = "backend";

/// SQLite implementation of [`EventLog`].
pub struct SqliteEventLog {
    conn: Connection,
}

impl SqliteEventLog {
    /// Opens or creates the log at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory log.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Installs application state tables on the same connection the
    /// materializer writes through.
    pub fn ensure_state_schema(&mut self, sql: &str) -> StoreResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Loads the stored changeset of one event, if present.
    pub fn changeset_for(&self, seq: EventSequenceNumber) -> StoreResult<Option<Changeset>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT changeset FROM event_changesets WHERE seq_global = ?1 AND seq_client = ?2",
                params![seq.global as i64, seq.client as i64],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn apply_one(
        tx: &Transaction<'_>,
        event: &Event,
        registry: &MaterializerRegistry,
    ) -> StoreResult<()> {
        let handler = registry.handler(&event.name)?;
        let mut writer = StateWriter::new(tx);
        handler.apply(&event.args, &mut writer)?;
        let changeset = writer.into_changeset();

        tx.execute(
            "INSERT INTO event_log (seq_global, seq_client, rebase_generation, \
             parent_global, parent_client, parent_generation, name, args, \
             client_id, session_id, sync_metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL)",
            params![
                event.seq.global as i64,
                event.seq.client as i64,
                event.seq.rebase_generation as i64,
                event.parent_seq.global as i64,
                event.parent_seq.client as i64,
                event.parent_seq.rebase_generation as i64,
                event.name,
                event.args.bytes,
                event.client_id as i64,
                event.session_id as i64,
            ],
        )?;
        tx.execute(
            "INSERT INTO event_changesets (seq_global, seq_client, changeset, debug_info) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.seq.global as i64,
                event.seq.client as i64,
                serde_json::to_vec(&changeset)?,
                format!("{} ({} changes)", event.name, changeset.changes.len()),
            ],
        )?;
        Ok(())
    }

    fn rollback_one(tx: &Transaction<'_>, seq: EventSequenceNumber) -> StoreResult<()> {
        let payload: Option<Vec<u8>> = tx
            .query_row(
                "SELECT changeset FROM event_changesets WHERE seq_global = ?1 AND seq_client = ?2",
                params![seq.global as i64, seq.client as i64],
                |row| row.get(0),
            )
            .optional()?;
        let Some(payload) = payload else {
            return Err(StoreError::MissingEvent(seq));
        };
        let changeset: Changeset = serde_json::from_slice(&payload)?;
        changeset.apply_inverse(tx)?;
        tx.execute(
            "DELETE FROM event_changesets WHERE seq_global = ?1 AND seq_client = ?2",
            params![seq.global as i64, seq.client as i64],
        )?;
        tx.execute(
            "DELETE FROM event_log WHERE seq_global = ?1 AND seq_client = ?2",
            params![seq.global as i64, seq.client as i64],
        )?;
        Ok(())
    }

    fn store_backend_head(tx: &Transaction<'_>, head: EventSequenceNumber) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO sync_heads (name, seq_global, seq_client) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET seq_global = ?2, seq_client = ?3",
            params![BACKEND_HEAD, head.global as i64, head.client as i64],
        )?;
        Ok(())
    }
}

impl EventLog for SqliteEventLog {
    fn apply_batch(
        &mut self,
        events: &[Event],
        registry: &MaterializerRegistry,
        cancel: &AtomicBool,
        new_backend_head: Option<EventSequenceNumber>,
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        for event in events {
            if cancel.load(Ordering::SeqCst) {
                return Err(StoreError::Interrupted);
            }
            Self::apply_one(&tx, event, registry)?;
        }
        if let Some(head) = new_backend_head {
            Self::store_backend_head(&tx, head)?;
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(StoreError::Interrupted);
        }
        tx.commit()?;
        Ok(())
    }

    fn rollback_and_apply(
        &mut self,
        rollback: &[EventSequenceNumber],
        new_events: &[Event],
        registry: &MaterializerRegistry,
        new_backend_head: Option<EventSequenceNumber>,
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        for seq in rollback {
            Self::rollback_one(&tx, *seq)?;
        }
        for event in new_events {
            Self::apply_one(&tx, event, registry)?;
        }
        if let Some(head) = new_backend_head {
            Self::store_backend_head(&tx, head)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn rollback_events(&mut self, seqs: &[EventSequenceNumber]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        for seq in seqs {
            Self::rollback_one(&tx, *seq)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn attach_sync_metadata(
        &mut self,
        acks: &[(EventSequenceNumber, SyncMetadata)],
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        for (seq, metadata) in acks {
            tx.execute(
                "UPDATE event_log SET sync_metadata = ?3 \
                 WHERE seq_global = ?1 AND seq_client = ?2",
                params![seq.global as i64, seq.client as i64, metadata.bytes],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn backend_head(&self) -> StoreResult<EventSequenceNumber> {
        let head: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT seq_global, seq_client FROM sync_heads WHERE name = ?1",
                params![BACKEND_HEAD],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(head
            .map(|(global, client)| EventSequenceNumber {
                global: global as u64,
                client: client as u64,
                rebase_generation: 0,
            })
            .unwrap_or(EventSequenceNumber::ROOT))
    }

    fn events_after(&self, seq: EventSequenceNumber) -> StoreResult<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq_global, seq_client, rebase_generation, parent_global, parent_client, \
             parent_generation, name, args, client_id, session_id, sync_metadata \
             FROM event_log \
             WHERE seq_global > ?1 OR (seq_global = ?1 AND seq_client > ?2) \
             ORDER BY seq_global ASC, seq_client ASC",
        )?;
        let rows = stmt.query_map(params![seq.global as i64, seq.client as i64], |row| {
            let metadata: Option<Vec<u8>> = row.get(10)?;
            Ok(Event {
                seq: EventSequenceNumber {
                    global: row.get::<_, i64>(0)? as u64,
                    client: row.get::<_, i64>(1)? as u64,
                    rebase_generation: row.get::<_, i64>(2)? as u32,
                },
                parent_seq: EventSequenceNumber {
                    global: row.get::<_, i64>(3)? as u64,
                    client: row.get::<_, i64>(4)? as u64,
                    rebase_generation: row.get::<_, i64>(5)? as u32,
                },
                name: row.get(6)?,
                args: EventArgs {
                    bytes: row.get(7)?,
                },
                client_id: row.get::<_, i64>(8)? as u64,
                session_id: row.get::<_, i64>(9)? as u64,
                sync_metadata: metadata.map(|bytes| SyncMetadata { bytes }),
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn latest_head(&self) -> StoreResult<EventSequenceNumber> {
        let head: Option<(i64, i64, i64)> = self
            .conn
            .query_row(
                "SELECT seq_global, seq_client, rebase_generation FROM event_log \
                 ORDER BY seq_global DESC, seq_client DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(head
            .map(|(global, client, generation)| EventSequenceNumber {
                global: global as u64,
                client: client as u64,
                rebase_generation: generation as u32,
            })
            .unwrap_or(EventSequenceNumber::ROOT))
    }

    fn prune_changesets_before(&mut self, seq: EventSequenceNumber) -> StoreResult<usize> {
        let count = self.conn.execute(
            "DELETE FROM event_changesets \
             WHERE seq_global < ?1 OR (seq_global = ?1 AND seq_client < ?2)",
            params![seq.global as i64, seq.client as i64],
        )?;
        Ok(count)
    }
}
