//! Per-stage counts and run summaries handed to the reporting side.

use serde::{Deserialize, Serialize};

use super::error::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Sites,
    Medications,
    Persons,
    DispensingRecords,
    FormularyDelete,
    FormularyInsert,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sites => "sites",
            Self::Medications => "medications",
            Self::Persons => "persons",
            Self::DispensingRecords => "dispensing_records",
            Self::FormularyDelete => "formulary_delete",
            Self::FormularyInsert => "formulary_insert",
        }
    }
}

/// One entity or record that could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub display_key: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub inserted: usize,
    pub reused: usize,
    pub deleted: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            inserted: 0,
            reused: 0,
            deleted: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    /// Entities now known to the run (new or pre-existing).
    pub fn resolved(&self) -> usize {
        self.inserted + self.reused
    }

    /// Count and log a per-item failure. The batch carries on.
    pub fn record_failure(&mut self, display_key: impl Into<String>, error: &PersistenceError) {
        let display_key = display_key.into();
        tracing::warn!(
            stage = self.stage.as_str(),
            item = %display_key,
            error = %error,
            "Failed to persist item"
        );
        self.failed += 1;
        self.failures.push(ItemFailure {
            display_key,
            error: error.to_string(),
        });
    }

    pub(crate) fn log_completion(&self) {
        tracing::info!(
            stage = self.stage.as_str(),
            inserted = self.inserted,
            reused = self.reused,
            deleted = self.deleted,
            failed = self.failed,
            "Stage complete"
        );
    }
}

/// Which foreign key a warning is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Site,
    Physician,
    Student,
    EnteredBy,
}

/// Non-fatal observations. None of these fail a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestWarning {
    /// A compound field did not have the expected shape; a fallback applied.
    MalformedField {
        record: String,
        field: String,
        value: String,
    },
    /// A reference had no match and was stored as null.
    UnresolvedReference {
        record: String,
        reference: ReferenceKind,
        name: String,
    },
    /// Several people matched; stored as null pending manual review.
    AmbiguousReference {
        record: String,
        reference: ReferenceKind,
        name: String,
        candidates: usize,
    },
}

/// Outcome of one full import run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub sites: StageReport,
    pub medications: StageReport,
    pub persons: StageReport,
    pub dispensing_records: StageReport,
    pub warnings: Vec<IngestWarning>,
}

impl ImportSummary {
    pub fn stages(&self) -> [&StageReport; 4] {
        [
            &self.sites,
            &self.medications,
            &self.persons,
            &self.dispensing_records,
        ]
    }

    pub fn total_errors(&self) -> usize {
        self.stages().iter().map(|s| s.failed).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.total_errors() == 0
    }
}

/// Outcome of a destructive formulary reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormularyRefreshReport {
    pub delete: StageReport,
    pub insert: StageReport,
}

impl FormularyRefreshReport {
    pub fn total_errors(&self) -> usize {
        self.delete.failed + self.insert.failed
    }
}
