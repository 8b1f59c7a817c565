//! Persistence contract consumed by the ingest pipeline.
//!
//! The pipeline only ever talks to storage through [`Backend`]: equality
//! queries, inserts that return the stored row with its assigned id, and
//! deletes by id. Batch forms report one result per item so a single bad row
//! never fails its neighbours.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::DatabaseError;

/// A row as exchanged with the backend: column name → JSON value.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Sites,
    Medications,
    Persons,
    DispensingLogs,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sites => "sites",
            Self::Medications => "medications",
            Self::Persons => "persons",
            Self::DispensingLogs => "dispensing_logs",
        }
    }

    /// Every column of the table, `id` first.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::Sites => &["id", "name", "date"],
            Self::Medications => &[
                "id",
                "name",
                "strength",
                "dosage_form",
                "stock",
                "is_active",
                "notes",
            ],
            Self::Persons => &[
                "id",
                "email",
                "role",
                "first_name",
                "last_name",
                "credential_hash",
                "is_active",
            ],
            Self::DispensingLogs => &[
                "id",
                "log_date",
                "patient_id",
                "medication_name",
                "dose_instructions",
                "lot_number",
                "expiration_date",
                "amount",
                "physician_name",
                "student_name",
                "site_id",
                "physician_id",
                "student_id",
                "entered_by",
            ],
        }
    }

    /// Columns stored as 0/1 integers that read back as JSON booleans.
    pub fn boolean_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Medications | Self::Persons => &["is_active"],
            Self::Sites | Self::DispensingLogs => &[],
        }
    }

    /// Reject any column name outside the fixed schema before it reaches SQL.
    pub fn check_column(&self, column: &str) -> Result<(), DatabaseError> {
        if self.columns().contains(&column) {
            Ok(())
        } else {
            Err(DatabaseError::UnknownColumn {
                table: self.as_str().into(),
                column: column.into(),
            })
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Null-safe equality predicate: a `Null` value matches only NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: &'static str,
    pub value: Value,
}

impl Predicate {
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

/// Storage collaborator. All calls are blocking round trips.
pub trait Backend {
    /// Rows matching every predicate. An empty slice returns the whole table.
    fn query(&self, table: Table, predicates: &[Predicate]) -> Result<Vec<Record>, DatabaseError>;

    /// Insert a row; the backend assigns `id` and returns the stored row.
    fn insert(&self, table: Table, record: &Record) -> Result<Record, DatabaseError>;

    /// Delete one row by id. Deleting a missing id is `NotFound`.
    fn delete(&self, table: Table, id: &Uuid) -> Result<(), DatabaseError>;

    /// Bulk existence check: one result per predicate set, in order.
    fn query_batch(
        &self,
        table: Table,
        predicate_sets: &[Vec<Predicate>],
    ) -> Vec<Result<Vec<Record>, DatabaseError>> {
        predicate_sets
            .iter()
            .map(|predicates| self.query(table, predicates))
            .collect()
    }

    /// Bulk insert: one result per record, in order.
    fn insert_batch(&self, table: Table, records: &[Record]) -> Vec<Result<Record, DatabaseError>> {
        records
            .iter()
            .map(|record| self.insert(table, record))
            .collect()
    }
}

/// Extract the backend-assigned id from a stored row.
pub fn record_id(table: Table, record: &Record) -> Result<Uuid, DatabaseError> {
    let raw = record
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| DatabaseError::MalformedRow {
            table: table.as_str().into(),
            reason: "missing id".into(),
        })?;

    Uuid::parse_str(raw).map_err(|e| DatabaseError::MalformedRow {
        table: table.as_str().into(),
        reason: format!("invalid id {raw}: {e}"),
    })
}

/// Serialize an entity into a backend record.
pub fn to_record<T: Serialize>(table: Table, entity: &T) -> Result<Record, DatabaseError> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DatabaseError::MalformedRow {
            table: table.as_str().into(),
            reason: format!("expected an object, got {other}"),
        }),
        Err(e) => Err(DatabaseError::MalformedRow {
            table: table.as_str().into(),
            reason: e.to_string(),
        }),
    }
}
