use std::path::Path;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;
use uuid::Uuid;

use super::backend::{Backend, Predicate, Record, Table};
use super::DatabaseError;

/// Open a SQLite connection to the given path and run migrations
pub fn open_database(path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(path)?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "PRAGMA journal_mode=DELETE;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![(
        1,
        include_str!("../../resources/migrations/001_initial.sql"),
    )];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running migration v{version}");
            conn.execute_batch(sql).map_err(|e| DatabaseError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, i64>(0)
    })
    .unwrap_or(0)
}

/// Number of rows in a table.
pub fn count_rows(conn: &Connection, table: Table) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", table.as_str()),
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

// ═══════════════════════════════════════════
// Backend implementation
// ═══════════════════════════════════════════

/// [`Backend`] over a single SQLite connection.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: open_database(path)?,
        })
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: open_memory_database()?,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Backend for SqliteBackend {
    fn query(&self, table: Table, predicates: &[Predicate]) -> Result<Vec<Record>, DatabaseError> {
        for predicate in predicates {
            table.check_column(predicate.column)?;
        }

        let columns = table.columns();
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table.as_str());
        if !predicates.is_empty() {
            let clauses: Vec<String> = predicates
                .iter()
                .enumerate()
                .map(|(i, p)| format!("{} IS ?{}", p.column, i + 1))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY rowid");

        let booleans = table.boolean_columns();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(predicates.iter().map(|p| to_sql_value(&p.value))),
            |row| {
                let mut record = Record::new();
                for (i, column) in columns.iter().enumerate() {
                    let value = from_sql_ref(row.get_ref(i)?);
                    let value = match value {
                        Value::Number(n) if booleans.contains(column) => {
                            Value::Bool(n.as_i64().unwrap_or(0) != 0)
                        }
                        other => other,
                    };
                    record.insert((*column).to_string(), value);
                }
                Ok(record)
            },
        )?;

        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn insert(&self, table: Table, record: &Record) -> Result<Record, DatabaseError> {
        let mut stored = record.clone();
        stored.insert("id".into(), Value::String(Uuid::new_v4().to_string()));

        for column in stored.keys() {
            table.check_column(column)?;
        }

        let columns: Vec<&str> = stored.keys().map(String::as_str).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.as_str(),
            columns.join(", "),
            placeholders.join(", "),
        );

        self.conn
            .execute(&sql, params_from_iter(stored.values().map(to_sql_value)))?;
        Ok(stored)
    }

    fn delete(&self, table: Table, id: &Uuid) -> Result<(), DatabaseError> {
        let affected = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", table.as_str()),
            params![id.to_string()],
        )?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity_type: table.as_str().into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// One transaction per batch. A failed INSERT rolls back only its own
    /// statement, so the other rows of the batch still commit.
    fn insert_batch(
        &self,
        table: Table,
        records: &[Record],
    ) -> Vec<Result<Record, DatabaseError>> {
        let tx = match self.conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(e) => {
                tracing::debug!(
                    table = %table,
                    error = %e,
                    "Batch transaction unavailable, inserting row by row"
                );
                return records.iter().map(|r| self.insert(table, r)).collect();
            }
        };

        let results: Vec<Result<Record, DatabaseError>> =
            records.iter().map(|r| self.insert(table, r)).collect();

        match tx.commit() {
            Ok(()) => results,
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(table = %table, error = %reason, "Batch commit failed");
                results
                    .into_iter()
                    .map(|r| r.and(Err(DatabaseError::BatchCommit(reason.clone()))))
                    .collect()
            }
        }
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}
