use std::sync::atomic::AtomicBool;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use synclog::{
    event::{Event, EventArgs, SyncMetadata},
    materialize::{EventHandler, MaterializeError, MaterializerRegistry, SqlValue, StateWriter},
    store::{EventLog, StoreError, sqlite::SqliteEventLog},
    types::EventSequenceNumber,
};

const STATE_SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);";

#[derive(Serialize, Deserialize)]
struct NotePayload {
    id: i64,
    body: String,
}

struct NoteAdded;

impl EventHandler for NoteAdded {
    fn apply(
        &self,
        args: &EventArgs,
        w: &mut StateWriter<'_, '_>,
    ) -> Result<(), MaterializeError> {
        let p: NotePayload = args.decode()?;
        w.insert_row(
            "notes",
            "id",
            SqlValue::Integer(p.id),
            vec![
                ("id".to_string(), SqlValue::Integer(p.id)),
                ("body".to_string(), SqlValue::Text(p.body)),
            ],
        )
    }
}

struct NoteEdited;

impl EventHandler for NoteEdited {
    fn apply(
        &self,
        args: &EventArgs,
        w: &mut StateWriter<'_, '_>,
    ) -> Result<(), MaterializeError> {
        let p: NotePayload = args.decode()?;
        w.update_row(
            "notes",
            "id",
            SqlValue::Integer(p.id),
            vec![("body".to_string(), SqlValue::Text(p.body))],
        )
    }
}

struct NoteRemoved;

impl EventHandler for NoteRemoved {
    fn apply(
        &self,
        args: &EventArgs,
        w: &mut StateWriter<'_, '_>,
    ) -> Result<(), MaterializeError> {
        let p: NotePayload = args.decode()?;
        w.delete_row("notes", "id", SqlValue::Integer(p.id))
    }
}

fn registry() -> MaterializerRegistry {
    let mut registry = MaterializerRegistry::new();
    registry.register("note_added", false, Box::new(NoteAdded));
    registry.register("note_edited", false, Box::new(NoteEdited));
    registry.register("note_removed", false, Box::new(NoteRemoved));
    registry
}

fn note_event(head: EventSequenceNumber, name: &str, id: i64, body: &str) -> Event {
    Event::new_local(
        head,
        name,
        EventArgs::encode(&NotePayload {
            id,
            body: body.to_string(),
        })
        .unwrap(),
        1,
        1,
        false,
    )
}

fn open_log(dir: &tempfile::TempDir) -> SqliteEventLog {
    let mut log = SqliteEventLog::open(dir.path().join("log.db")).unwrap();
    log.ensure_state_schema(STATE_SCHEMA).unwrap();
    log
}

fn notes(dir: &tempfile::TempDir) -> Vec<(i64, String)> {
    let conn = Connection::open(dir.path().join("log.db")).unwrap();
    let mut stmt = conn
        .prepare("SELECT id, body FROM notes ORDER BY id")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap();
    rows.map(|r| r.unwrap()).collect()
}

#[test]
fn apply_batch_persists_events_state_and_changesets() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(&dir);
    let registry = registry();

    let e1 = note_event(EventSequenceNumber::ROOT, "note_added", 1, "first");
    let e2 = note_event(e1.seq, "note_added", 2, "second");
    log.apply_batch(
        &[e1.clone(), e2.clone()],
        &registry,
        &AtomicBool::new(false),
        None,
    )
    .unwrap();

    let stored = log.events_after(EventSequenceNumber::ROOT).unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored[0].same_as(&e1));
    assert!(stored[1].same_as(&e2));
    assert_eq!(log.latest_head().unwrap(), e2.seq);
    assert!(log.changeset_for(e1.seq).unwrap().is_some());
    assert_eq!(
        notes(&dir),
        vec![(1, "first".to_string()), (2, "second".to_string())]
    );
}

#[test]
fn rollback_restores_prior_state_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(&dir);
    let registry = registry();

    let e1 = note_event(EventSequenceNumber::ROOT, "note_added", 1, "first");
    log.apply_batch(&[e1.clone()], &registry, &AtomicBool::new(false), None)
        .unwrap();
    let snapshot = notes(&dir);

    let e2 = note_event(e1.seq, "note_edited", 1, "edited");
    let e3 = note_event(e2.seq, "note_added", 2, "second");
    log.apply_batch(
        &[e2.clone(), e3.clone()],
        &registry,
        &AtomicBool::new(false),
        None,
    )
    .unwrap();
    assert_ne!(notes(&dir), snapshot);

    // Newest first.
    log.rollback_events(&[e3.seq, e2.seq]).unwrap();

    assert_eq!(notes(&dir), snapshot);
    let stored = log.events_after(EventSequenceNumber::ROOT).unwrap();
    assert_eq!(stored.len(), 1);
    assert!(log.changeset_for(e2.seq).unwrap().is_none());
}

#[test]
fn delete_rollback_resurrects_the_full_row() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(&dir);
    let registry = registry();

    let e1 = note_event(EventSequenceNumber::ROOT, "note_added", 7, "keep me");
    let e2 = note_event(e1.seq, "note_removed", 7, "");
    log.apply_batch(
        &[e1.clone(), e2.clone()],
        &registry,
        &AtomicBool::new(false),
        None,
    )
    .unwrap();
    assert!(notes(&dir).is_empty());

    log.rollback_events(&[e2.seq]).unwrap();
    assert_eq!(notes(&dir), vec![(7, "keep me".to_string())]);
}

#[test]
fn rollback_and_apply_is_one_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(&dir);
    let registry = registry();

    let e1 = note_event(EventSequenceNumber::ROOT, "note_added", 1, "mine");
    log.apply_batch(&[e1.clone()], &registry, &AtomicBool::new(false), None)
        .unwrap();

    let n1 = note_event(EventSequenceNumber::ROOT, "note_added", 2, "theirs");
    log.rollback_and_apply(&[e1.seq], &[n1.clone()], &registry, Some(n1.seq))
        .unwrap();

    assert_eq!(notes(&dir), vec![(2, "theirs".to_string())]);
    assert_eq!(log.backend_head().unwrap(), n1.seq);
    let stored = log.events_after(EventSequenceNumber::ROOT).unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].same_as(&n1));
}

#[test]
fn cancelled_apply_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(&dir);
    let registry = registry();

    let e1 = note_event(EventSequenceNumber::ROOT, "note_added", 1, "first");
    let cancel = AtomicBool::new(true);
    let err = log
        .apply_batch(&[e1], &registry, &cancel, Some(EventSequenceNumber::ROOT))
        .unwrap_err();

    assert!(matches!(err, StoreError::Interrupted));
    assert!(log.events_after(EventSequenceNumber::ROOT).unwrap().is_empty());
    assert!(notes(&dir).is_empty());
}

#[test]
fn failing_handler_rolls_the_whole_batch_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(&dir);
    let registry = registry();

    let e1 = note_event(EventSequenceNumber::ROOT, "note_added", 1, "first");
    // No handler registered under this name.
    let e2 = note_event(e1.seq, "unregistered", 2, "second");
    let err = log
        .apply_batch(&[e1, e2], &registry, &AtomicBool::new(false), None)
        .unwrap_err();

    assert!(matches!(
        err,
        StoreError::Materialize(MaterializeError::UnknownEvent(_))
    ));
    assert!(log.events_after(EventSequenceNumber::ROOT).unwrap().is_empty());
    assert!(notes(&dir).is_empty());
}

#[test]
fn acks_and_backend_head_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let e1 = note_event(EventSequenceNumber::ROOT, "note_added", 1, "first");

    {
        let mut log = open_log(&dir);
        log.apply_batch(&[e1.clone()], &registry, &AtomicBool::new(false), None)
            .unwrap();
        log.attach_sync_metadata(&[(
            e1.seq,
            SyncMetadata {
                bytes: b"ack-1".to_vec(),
            },
        )])
        .unwrap();
        let tx = log.events_after(EventSequenceNumber::ROOT).unwrap();
        assert_eq!(
            tx[0].sync_metadata.as_ref().unwrap().bytes,
            b"ack-1".to_vec()
        );
    }

    let log = open_log(&dir);
    assert_eq!(log.backend_head().unwrap(), EventSequenceNumber::ROOT);
    let stored = log.events_after(EventSequenceNumber::ROOT).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        stored[0].sync_metadata.as_ref().unwrap().bytes,
        b"ack-1".to_vec()
    );
}

#[test]
fn prune_drops_changesets_but_keeps_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(&dir);
    let registry = registry();

    let e1 = note_event(EventSequenceNumber::ROOT, "note_added", 1, "a");
    let e2 = note_event(e1.seq, "note_added", 2, "b");
    let e3 = note_event(e2.seq, "note_added", 3, "c");
    log.apply_batch(
        &[e1.clone(), e2.clone(), e3.clone()],
        &registry,
        &AtomicBool::new(false),
        None,
    )
    .unwrap();

    let removed = log.prune_changesets_before(e3.seq).unwrap();
    assert_eq!(removed, 2);
    assert!(log.changeset_for(e1.seq).unwrap().is_none());
    assert!(log.changeset_for(e2.seq).unwrap().is_none());
    assert!(log.changeset_for(e3.seq).unwrap().is_some());
    assert_eq!(log.events_after(EventSequenceNumber::ROOT).unwrap().len(), 3);
}

#[test]
fn missing_changeset_fails_rollback_cleanly() {
    let mut log = SqliteEventLog::open_in_memory().unwrap();
    log.ensure_state_schema(STATE_SCHEMA).unwrap();
    let phantom = EventSequenceNumber {
        global: 9,
        client: 0,
        rebase_generation: 0,
    };
    let err = log.rollback_events(&[phantom]).unwrap_err();
    assert!(matches!(err, StoreError::MissingEvent(seq) if seq == phantom));
}
