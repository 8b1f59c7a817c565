//! Error taxonomy for the ingest pipeline.
//!
//! Only [`IngestError`] aborts a run. [`PersistenceError`] is caught per item
//! and counted; malformed fields and unresolved references never surface as
//! errors at all (see `IngestWarning`).

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;

/// Fatal: the run cannot start or cannot reach its backend.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recoverable, scoped to one entity or record.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Rejected record: {0}")]
    Rejected(String),
}

/// The upstream raw-record collaborator could not supply data.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Could not read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not parse {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}
