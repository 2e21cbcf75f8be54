//! Per-event table mutation with invertible changeset capture.
//!
//! Handlers never touch the connection directly: they go through a
//! [`StateWriter`] that executes each row mutation and records enough of a
//! before-image to undo it later. The captured [`Changeset`] is persisted
//! next to the event row so exactly one event can be rolled back without
//! recomputing the whole state.

use hashbrown::HashMap;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Transaction, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::event::EventArgs;

/// Errors from decoding or applying an event.
#[derive(Debug)]
pub enum MaterializeError {
    /// No handler registered for the event name.
    UnknownEvent(String),
    /// Payload failed to decode.
    Decode(serde_json::Error),
    /// Targeted row was not found.
    MissingRow {
        /// Table queried.
        table: String,
        /// Primary key value looked up.
        key: SqlValue,
    },
    /// Underlying SQLite failure.
    Sqlite(rusqlite::Error),
}

impl From<serde_json::Error> for MaterializeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value)
    }
}

impl From<rusqlite::Error> for MaterializeError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// Serializable SQLite value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Float.
    Real(f64),
    /// Text.
    Text(String),
    /// Blob.
    Blob(Vec<u8>),
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(v) => Self::Integer(v),
            ValueRef::Real(v) => Self::Real(v),
            ValueRef::Text(v) => Self::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => Self::Blob(v.to_vec()),
        }
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            Self::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            Self::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Self::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

/// One named column value.
pub type Column = (String, SqlValue);

/// A single captured row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowChange {
    /// Row inserted.
    Insert {
        /// Target table.
        table: String,
        /// Primary key column name.
        key_column: String,
        /// Primary key value.
        key: SqlValue,
        /// Inserted columns, including the key.
        row: Vec<Column>,
    },
    /// Row updated in place.
    Update {
        /// Target table.
        table: String,
        /// Primary key column name.
        key_column: String,
        /// Primary key value.
        key: SqlValue,
        /// Prior values of the touched columns.
        before: Vec<Column>,
        /// New values of the touched columns.
        after: Vec<Column>,
    },
    /// Row deleted.
    Delete {
        /// Target table.
        table: String,
        /// Primary key column name.
        key_column: String,
        /// Primary key value.
        key: SqlValue,
        /// Full row content at deletion time.
        row: Vec<Column>,
    },
}

/// Invertible record of the state-database delta of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Changeset {
    /// Captured mutations in application order.
    pub changes: Vec<RowChange>,
}

impl Changeset {
    /// True when the event touched no rows.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Undoes every captured mutation, newest first.
    pub fn apply_inverse(&self, txn: &Transaction<'_>) -> Result<(), MaterializeError> {
        for change in self.changes.iter().rev() {
            match change {
                RowChange::Insert {
                    table,
                    key_column,
                    key,
                    ..
                } => {
                    txn.execute(
                        &format!("DELETE FROM {table} WHERE {key_column} = ?1"),
                        [key],
                    )?;
                }
                RowChange::Update {
                    table,
                    key_column,
                    key,
                    before,
                    ..
                } => {
                    execute_update(txn, table, key_column, key, before)?;
                }
                RowChange::Delete {
                    table,
                    key_column: _,
                    key: _,
                    row,
                } => {
                    execute_insert(txn, table, row)?;
                }
            }
        }
        Ok(())
    }
}

/// Capturing writer handed to handlers inside the apply transaction.
pub struct StateWriter<'conn, 'txn> {
    txn: &'txn Transaction<'conn>,
    changes: Vec<RowChange>,
}

impl<'conn, 'txn> StateWriter<'conn, 'txn> {
    /// Wraps an open transaction with an empty capture buffer.
    pub fn new(txn: &'txn Transaction<'conn>) -> Self {
        Self {
            txn,
            changes: Vec::new(),
        }
    }

    /// Inserts a row and records the insertion.
    pub fn insert_row(
        &mut self,
        table: &str,
        key_column: &str,
        key: SqlValue,
        row: Vec<Column>,
    ) -> Result<(), MaterializeError> {
        execute_insert(self.txn, table, &row)?;
        self.changes.push(RowChange::Insert {
            table: table.to_string(),
            key_column: key_column.to_string(),
            key,
            row,
        });
        Ok(())
    }

    /// Updates named columns of one row, capturing their before-image.
    pub fn update_row(
        &mut self,
        table: &str,
        key_column: &str,
        key: SqlValue,
        after: Vec<Column>,
    ) -> Result<(), MaterializeError> {
        let columns: Vec<&str> = after.iter().map(|(name, _)| name.as_str()).collect();
        let before = read_columns(self.txn, table, key_column, &key, &columns)?;
        execute_update(self.txn, table, key_column, &key, &after)?;
        self.changes.push(RowChange::Update {
            table: table.to_string(),
            key_column: key_column.to_string(),
            key,
            before,
            after,
        });
        Ok(())
    }

    /// Deletes one row, capturing its full content for restoration.
    pub fn delete_row(
        &mut self,
        table: &str,
        key_column: &str,
        key: SqlValue,
    ) -> Result<(), MaterializeError> {
        let row = read_full_row(self.txn, table, key_column, &key)?;
        self.txn.execute(
            &format!("DELETE FROM {table} WHERE {key_column} = ?1"),
            [&key],
        )?;
        self.changes.push(RowChange::Delete {
            table: table.to_string(),
            key_column: key_column.to_string(),
            key,
            row,
        });
        Ok(())
    }

    /// Finishes capture, yielding the changeset.
    pub fn into_changeset(self) -> Changeset {
        Changeset {
            changes: self.changes,
        }
    }
}

/// User-supplied per-event-type table mutation.
pub trait EventHandler: Send + Sync {
    /// Decodes `args` and applies the event through `w`.
    fn apply(&self, args: &EventArgs, w: &mut StateWriter<'_, '_>) -> Result<(), MaterializeError>;
}

struct Registered {
    handler: Box<dyn EventHandler>,
    local_only: bool,
}

/// Event-name to handler mapping plus the per-type local-only flag.
#[derive(Default)]
pub struct MaterializerRegistry {
    handlers: HashMap<String, Registered>,
}

impl MaterializerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `name`; replaces any previous registration.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        local_only: bool,
        handler: Box<dyn EventHandler>,
    ) {
        self.handlers.insert(
            name.into(),
            Registered {
                handler,
                local_only,
            },
        );
    }

    /// Looks up the handler for an event name.
    pub fn handler(&self, name: &str) -> Result<&dyn EventHandler, MaterializeError> {
        self.handlers
            .get(name)
            .map(|r| r.handler.as_ref())
            .ok_or_else(|| MaterializeError::UnknownEvent(name.to_string()))
    }

    /// True when events of this type must never reach the backend.
    ///
    /// Unknown names default to false; the apply path rejects them anyway.
    pub fn is_local_only(&self, name: &str) -> bool {
        self.handlers.get(name).is_some_and(|r| r.local_only)
    }
}

fn execute_insert(
    txn: &Transaction<'_>,
    table: &str,
    row: &[Column],
) -> Result<(), MaterializeError> {
    let names: Vec<&str> = row.iter().map(|(name, _)| name.as_str()).collect();
    let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    );
    txn.execute(&sql, params_from_iter(row.iter().map(|(_, v)| v)))?;
    Ok(())
}

fn execute_update(
    txn: &Transaction<'_>,
    table: &str,
    key_column: &str,
    key: &SqlValue,
    columns: &[Column],
) -> Result<(), MaterializeError> {
    if columns.is_empty() {
        return Ok(());
    }
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, (name, _))| format!("{name} = ?{}", i + 1))
        .collect();
    let sql = format!(
        "UPDATE {table} SET {} WHERE {key_column} = ?{}",
        assignments.join(", "),
        columns.len() + 1
    );
    let values: Vec<&SqlValue> = columns
        .iter()
        .map(|(_, v)| v)
        .chain(std::iter::once(key))
        .collect();
    txn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn read_columns(
    txn: &Transaction<'_>,
    table: &str,
    key_column: &str,
    key: &SqlValue,
    columns: &[&str],
) -> Result<Vec<Column>, MaterializeError> {
    let sql = format!(
        "SELECT {} FROM {table} WHERE {key_column} = ?1",
        columns.join(", ")
    );
    let mut stmt = txn.prepare(&sql)?;
    let mut rows = stmt.query([key])?;
    let row = rows.next()?.ok_or_else(|| MaterializeError::MissingRow {
        table: table.to_string(),
        key: key.clone(),
    })?;
    let mut out = Vec::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        out.push((name.to_string(), SqlValue::from(row.get_ref(idx)?)));
    }
    Ok(out)
}

fn read_full_row(
    txn: &Transaction<'_>,
    table: &str,
    key_column: &str,
    key: &SqlValue,
) -> Result<Vec<Column>, MaterializeError> {
    let sql = format!("SELECT * FROM {table} WHERE {key_column} = ?1");
    let mut stmt = txn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query([key])?;
    let row = rows.next()?.ok_or_else(|| MaterializeError::MissingRow {
        table: table.to_string(),
        key: key.clone(),
    })?;
    let mut out = Vec::with_capacity(names.len());
    for (idx, name) in names.iter().enumerate() {
        out.push((name.clone(), SqlValue::from(row.get_ref(idx)?)));
    }
    Ok(out)
}
