//! Raw records as supplied by the document-extraction side.
//!
//! The pipeline does not parse DOCX/XLSX itself. It consumes already
//! tabulated rows: a JSON bundle of sites, medications, persons and
//! dispensing logs, or a formulary CSV export.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::SourceError;
use super::normalize::split_name_and_strength;
use super::report::Stage;
use crate::models::enums::PersonRole;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSite {
    #[serde(alias = "site_name")]
    pub name: String,
    #[serde(default, alias = "clinic_date")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMedication {
    /// Medication label; carries the strength too when `strength` is absent.
    pub name: String,
    #[serde(default)]
    pub strength: Option<String>,
    #[serde(default)]
    pub dosage_form: Option<String>,
    /// Free-text formulary quantity ("30 tabs", "Dispense on-site").
    #[serde(default)]
    pub quantity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPerson {
    #[serde(default, alias = "display_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    pub role: PersonRole,
}

impl RawPerson {
    pub fn new(name: impl Into<String>, role: PersonRole) -> Self {
        Self {
            name: Some(name.into()),
            first_name: None,
            last_name: None,
            role,
        }
    }

    /// Name as written on the logs; falls back to "first last".
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => [self.first_name.as_deref(), self.last_name.as_deref()]
                .into_iter()
                .flatten()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDispensingLog {
    #[serde(alias = "log_date")]
    pub date: String,
    pub patient_id: String,
    #[serde(alias = "medication_name")]
    pub medication: String,
    #[serde(default)]
    pub dose: Option<String>,
    /// Combined "lot, expiration" cell.
    #[serde(default)]
    pub lot_exp: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub physician: Option<String>,
    #[serde(default)]
    pub student: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
}

/// A bundle row that could not be read as its record type. It becomes a
/// per-item failure of the matching stage; the rest of the bundle loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub stage: Stage,
    pub index: usize,
    pub display_key: String,
    pub reason: String,
}

/// Everything one import run consumes, grouped by entity type.
///
/// Rows are decoded one at a time, so a malformed row lands in `rejected`
/// instead of failing the whole bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawBundle")]
pub struct RawBatch {
    pub sites: Vec<RawSite>,
    pub medications: Vec<RawMedication>,
    pub persons: Vec<RawPerson>,
    pub dispensing_logs: Vec<RawDispensingLog>,
    #[serde(skip)]
    pub rejected: Vec<RejectedRow>,
}

/// Wire shape of the JSON bundle before per-row decoding.
#[derive(Deserialize)]
struct RawBundle {
    #[serde(default, alias = "clinic_sites")]
    sites: Vec<Value>,
    #[serde(default)]
    medications: Vec<Value>,
    #[serde(default, alias = "users")]
    persons: Vec<Value>,
    #[serde(default)]
    dispensing_logs: Vec<Value>,
}

impl From<RawBundle> for RawBatch {
    fn from(bundle: RawBundle) -> Self {
        let mut rejected = Vec::new();
        let sites = decode_rows(
            bundle.sites,
            Stage::Sites,
            &["name", "site_name"],
            &mut rejected,
        );
        let medications = decode_rows(
            bundle.medications,
            Stage::Medications,
            &["name"],
            &mut rejected,
        );
        let persons = decode_rows(
            bundle.persons,
            Stage::Persons,
            &["name", "display_name", "email"],
            &mut rejected,
        );
        let dispensing_logs = decode_rows(
            bundle.dispensing_logs,
            Stage::DispensingRecords,
            &["patient_id", "medication"],
            &mut rejected,
        );

        Self {
            sites,
            medications,
            persons,
            dispensing_logs,
            rejected,
        }
    }
}

fn decode_rows<T: DeserializeOwned>(
    rows: Vec<Value>,
    stage: Stage,
    key_fields: &[&str],
    rejected: &mut Vec<RejectedRow>,
) -> Vec<T> {
    let mut decoded = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let display_key = row_display_key(&row, key_fields, index);
        match serde_json::from_value::<T>(row) {
            Ok(value) => decoded.push(value),
            Err(e) => {
                tracing::warn!(stage = stage.as_str(), index, error = %e, "Malformed source row");
                rejected.push(RejectedRow {
                    stage,
                    index,
                    display_key,
                    reason: e.to_string(),
                });
            }
        }
    }
    decoded
}

/// First string-valued key field of the row, else its position.
fn row_display_key(row: &Value, key_fields: &[&str], index: usize) -> String {
    key_fields
        .iter()
        .find_map(|field| row.get(field).and_then(Value::as_str))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("row {index}"))
}

impl RawBatch {
    /// Fill an empty medication list or roster from the dispensing logs.
    pub fn derive_missing(&mut self) {
        if self.medications.is_empty() {
            self.medications = derive_medications(&self.dispensing_logs);
            tracing::info!(
                count = self.medications.len(),
                "Derived medications from dispensing logs"
            );
        }
        if self.persons.is_empty() {
            self.persons = derive_roster(&self.dispensing_logs);
            tracing::info!(
                count = self.persons.len(),
                "Derived staff roster from dispensing logs"
            );
        }
    }
}

/// Unique (name, strength) pairs from the medication labels, sorted.
pub fn derive_medications(logs: &[RawDispensingLog]) -> Vec<RawMedication> {
    let unique: BTreeSet<(String, Option<String>)> = logs
        .iter()
        .map(|log| split_name_and_strength(&log.medication))
        .filter(|(name, _)| !name.is_empty())
        .collect();

    unique
        .into_iter()
        .map(|(name, strength)| RawMedication {
            name,
            strength,
            ..RawMedication::default()
        })
        .collect()
}

/// Unique physicians then unique students, each sorted by name.
pub fn derive_roster(logs: &[RawDispensingLog]) -> Vec<RawPerson> {
    let collect = |pick: fn(&RawDispensingLog) -> Option<&String>| -> BTreeSet<String> {
        logs.iter()
            .filter_map(pick)
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    };

    let physicians = collect(|log| log.physician.as_ref());
    let students = collect(|log| log.student.as_ref());

    physicians
        .into_iter()
        .map(|name| RawPerson::new(name, PersonRole::Physician))
        .chain(
            students
                .into_iter()
                .map(|name| RawPerson::new(name, PersonRole::Student)),
        )
        .collect()
}

/// Upstream collaborator that supplies raw records.
pub trait RecordSource {
    fn load(&self) -> Result<RawBatch, SourceError>;
}

impl RecordSource for RawBatch {
    fn load(&self) -> Result<RawBatch, SourceError> {
        Ok(self.clone())
    }
}

/// JSON bundle on disk: `{ "sites": [...], "medications": [...], ... }`.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSource for JsonFileSource {
    fn load(&self) -> Result<RawBatch, SourceError> {
        let path = self.path.display().to_string();
        let content = std::fs::read_to_string(&self.path).map_err(|source| SourceError::Read {
            path: path.clone(),
            source,
        })?;
        let batch: RawBatch =
            serde_json::from_str(&content).map_err(|source| SourceError::Json { path, source })?;

        tracing::info!(
            file = %self.path.display(),
            sites = batch.sites.len(),
            medications = batch.medications.len(),
            persons = batch.persons.len(),
            dispensing_logs = batch.dispensing_logs.len(),
            "Loaded raw records"
        );
        Ok(batch)
    }
}

// ═══════════════════════════════════════════
// Formulary
// ═══════════════════════════════════════════

/// One row of the formulary table: Name | Strength | Quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormularyRow {
    pub name: String,
    pub strength: String,
    pub quantity: String,
}

/// Read a formulary CSV export.
pub fn read_formulary_csv(path: &Path) -> Result<Vec<FormularyRow>, SourceError> {
    let display = path.display().to_string();
    let file = std::fs::File::open(path).map_err(|source| SourceError::Read {
        path: display.clone(),
        source,
    })?;
    let rows = parse_formulary_csv(file).map_err(|source| SourceError::Csv {
        path: display,
        source,
    })?;
    tracing::info!(file = %path.display(), rows = rows.len(), "Read formulary");
    Ok(rows)
}

/// The first row is the header. Rows with fewer than three cells, an empty
/// name, or a repeated `Name` header are skipped.
pub fn parse_formulary_csv<R: Read>(reader: R) -> Result<Vec<FormularyRow>, csv::Error> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        if record.len() < 3 {
            continue;
        }
        let name = record.get(0).unwrap_or_default();
        if name.is_empty() || name == "Name" {
            continue;
        }
        rows.push(FormularyRow {
            name: name.to_string(),
            strength: record.get(1).unwrap_or_default().to_string(),
            quantity: record.get(2).unwrap_or_default().to_string(),
        });
    }
    Ok(rows)
}
