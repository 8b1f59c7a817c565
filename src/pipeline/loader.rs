//! Dependency-ordered loader.
//!
//! Sites, medications and persons are upserted first so their ids exist
//! before dispensing records, which reference them, are appended.

use std::path::Path;

use base64::Engine;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::{IngestError, PersistenceError};
use super::normalize::{normalize_medication, split_lot_and_expiration};
use super::report::{
    FormularyRefreshReport, ImportSummary, IngestWarning, ReferenceKind, Stage, StageReport,
};
use super::resolve::{
    derive_email, split_display_name, Entity, MedicationKey, PersonDirectory, PersonResolution,
};
use super::source::{
    read_formulary_csv, FormularyRow, RawBatch, RawDispensingLog, RawMedication, RawPerson,
    RawSite, RecordSource, RejectedRow,
};
use super::upsert::{insert_only, upsert, upsert_batch, IdentityMap, UpsertOutcome};
use super::verify::{verify_formulary, VerificationReport};
use crate::config::IngestConfig;
use crate::db::{record_id, to_record, Backend, Record, SqliteBackend, Table};
use crate::models::{DispensingRecord, DosageForm, Medication, Person, PersonRole, Site};

/// Display name of the implicit person recorded as `entered_by`.
pub const PHARMACY_STAFF_NAME: &str = "Pharmacy Staff";

const LOG_DATE_FORMAT: &str = "%Y-%m-%d";

/// State owned by one import run: identity maps, the person directory,
/// rows the source could not decode and collected warnings. Dropped when
/// the run ends.
pub struct ImportRun<'a, B: Backend + ?Sized> {
    backend: &'a B,
    config: &'a IngestConfig,
    sites: IdentityMap<String>,
    medications: IdentityMap<MedicationKey>,
    persons: IdentityMap<String>,
    directory: PersonDirectory,
    pharmacy_staff: Option<Uuid>,
    rejected: Vec<RejectedRow>,
    warnings: Vec<IngestWarning>,
}

impl<'a, B: Backend + ?Sized> ImportRun<'a, B> {
    pub fn new(backend: &'a B, config: &'a IngestConfig) -> Self {
        Self {
            backend,
            config,
            sites: IdentityMap::new(),
            medications: IdentityMap::new(),
            persons: IdentityMap::new(),
            directory: PersonDirectory::new(),
            pharmacy_staff: None,
            rejected: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Run every stage in dependency order.
    pub fn run(mut self, batch: &RawBatch) -> ImportSummary {
        self.rejected = batch.rejected.clone();
        let sites = self.import_sites(&batch.sites);
        let medications = self.import_medications(&batch.medications);
        let persons = self.import_persons(&batch.persons);
        let dispensing_records = self.import_dispensing_logs(&batch.dispensing_logs);

        let summary = ImportSummary {
            sites,
            medications,
            persons,
            dispensing_records,
            warnings: self.warnings,
        };
        tracing::info!(
            errors = summary.total_errors(),
            warnings = summary.warnings.len(),
            "Import finished"
        );
        summary
    }

    pub fn import_sites(&mut self, raw: &[RawSite]) -> StageReport {
        let mut report = self.start_stage(Stage::Sites);
        let mut sites = Vec::with_capacity(raw.len());

        for site in raw {
            let name = site.name.trim();
            if name.is_empty() {
                report.record_failure("<unnamed site>", &rejected("site name is empty"));
                continue;
            }
            let raw_date = site.date.as_deref().map(str::trim).filter(|d| !d.is_empty());
            let date = raw_date.and_then(|d| match NaiveDate::parse_from_str(d, LOG_DATE_FORMAT) {
                Ok(date) => Some(date),
                Err(_) => {
                    self.warn(IngestWarning::MalformedField {
                        record: name.to_string(),
                        field: "date".into(),
                        value: d.to_string(),
                    });
                    None
                }
            });
            sites.push(Site {
                name: name.to_string(),
                date,
            });
        }

        upsert_batch(self.backend, &sites, &mut self.sites, self.config.batch_size, &mut report);
        report.log_completion();
        report
    }

    pub fn import_medications(&mut self, raw: &[RawMedication]) -> StageReport {
        let mut report = self.start_stage(Stage::Medications);
        let mut medications = Vec::with_capacity(raw.len());

        for medication in raw {
            let dosage_form = medication.dosage_form.as_deref().and_then(|form| {
                match form.trim().to_lowercase().parse::<DosageForm>() {
                    Ok(parsed) => Some(parsed),
                    Err(_) => {
                        self.warn(IngestWarning::MalformedField {
                            record: medication.name.clone(),
                            field: "dosage_form".into(),
                            value: form.to_string(),
                        });
                        None
                    }
                }
            });

            let normalized = normalize_medication(
                &medication.name,
                medication.strength.as_deref(),
                dosage_form,
                medication.quantity.as_deref(),
            );
            if normalized.name.is_empty() {
                let error = rejected("medication name is empty");
                report.record_failure(medication.name.as_str(), &error);
                continue;
            }

            medications.push(Medication {
                name: normalized.name,
                strength: normalized.strength,
                dosage_form: normalized.dosage_form,
                stock: normalized.stock,
                is_active: true,
                notes: normalized.notes,
            });
        }

        upsert_batch(
            self.backend,
            &medications,
            &mut self.medications,
            self.config.batch_size,
            &mut report,
        );
        report.log_completion();
        report
    }

    /// Upsert the roster, then the implicit pharmacy-staff person, and build
    /// the person directory from whatever resolved.
    pub fn import_persons(&mut self, raw: &[RawPerson]) -> StageReport {
        let mut report = self.start_stage(Stage::Persons);
        let credential_hash = placeholder_credential_hash(&self.config.placeholder_credential);

        let mut names = Vec::with_capacity(raw.len());
        let mut persons = Vec::with_capacity(raw.len());
        for person in raw {
            match self.build_person(person, &credential_hash) {
                Ok(built) => {
                    names.push((person.display_name(), person.role));
                    persons.push(built);
                }
                Err(e) => report.record_failure(format!("<unnamed {}>", person.role), &e),
            }
        }

        let ids = upsert_batch(
            self.backend,
            &persons,
            &mut self.persons,
            self.config.batch_size,
            &mut report,
        );
        for ((display_name, role), id) in names.iter().zip(ids) {
            if let Some(id) = id {
                self.directory.register(display_name, *role, id);
            }
        }

        self.pharmacy_staff = self.import_pharmacy_staff(&credential_hash, &mut report);
        tracing::debug!(entries = self.directory.len(), "Person directory built");

        report.log_completion();
        report
    }

    /// The person every dispensing row is `entered_by`. Reused when the
    /// roster already carried it.
    fn import_pharmacy_staff(
        &mut self,
        credential_hash: &str,
        report: &mut StageReport,
    ) -> Option<Uuid> {
        let staff = RawPerson::new(PHARMACY_STAFF_NAME, PersonRole::PharmacyStaff);
        let result = self
            .build_person(&staff, credential_hash)
            .and_then(|person| upsert(self.backend, &person, &mut self.persons));

        match result {
            Ok(outcome) => {
                match outcome {
                    UpsertOutcome::Inserted(_) => report.inserted += 1,
                    UpsertOutcome::Reused(_) => report.reused += 1,
                }
                self.directory.register(PHARMACY_STAFF_NAME, staff.role, outcome.id());
                Some(outcome.id())
            }
            Err(e) => {
                report.record_failure(PHARMACY_STAFF_NAME, &e);
                None
            }
        }
    }

    fn build_person(
        &self,
        person: &RawPerson,
        credential_hash: &str,
    ) -> Result<Person, PersistenceError> {
        let display_name = person.display_name();
        let email = derive_email(&display_name, person.role, self.config)
            .ok_or_else(|| rejected("person name is empty"))?;

        let (first, rest) = split_display_name(&display_name);
        Ok(Person {
            email,
            role: person.role,
            first_name: non_empty(person.first_name.as_deref()).unwrap_or(first),
            last_name: non_empty(person.last_name.as_deref()).unwrap_or(rest),
            credential_hash: credential_hash.to_string(),
            is_active: true,
        })
    }

    /// Append every dispensing row. Never deduplicated.
    pub fn import_dispensing_logs(&mut self, raw: &[RawDispensingLog]) -> StageReport {
        let mut report = self.start_stage(Stage::DispensingRecords);
        let mut items: Vec<(String, Record)> = Vec::with_capacity(raw.len());

        for log in raw {
            let label = format!("patient {} on {}", log.patient_id.trim(), log.date.trim());

            let log_date = match NaiveDate::parse_from_str(log.date.trim(), LOG_DATE_FORMAT) {
                Ok(date) => date,
                Err(_) => {
                    let error = rejected(&format!("invalid log date {:?}", log.date));
                    report.record_failure(label, &error);
                    continue;
                }
            };

            let lot_exp = log.lot_exp.as_deref().unwrap_or_default();
            if !lot_exp.trim().is_empty() && !lot_exp.contains(',') {
                self.warn(IngestWarning::MalformedField {
                    record: label.clone(),
                    field: "lot_exp".into(),
                    value: lot_exp.to_string(),
                });
            }
            let (lot_number, expiration_date) = split_lot_and_expiration(lot_exp);

            let site_id = self.resolve_site(&label, log.site.as_deref());
            let physician_id =
                self.resolve_person(&label, log.physician.as_deref(), ReferenceKind::Physician);
            let student_id =
                self.resolve_person(&label, log.student.as_deref(), ReferenceKind::Student);
            let entered_by = self.pharmacy_staff;
            if entered_by.is_none() {
                self.warn(IngestWarning::UnresolvedReference {
                    record: label.clone(),
                    reference: ReferenceKind::EnteredBy,
                    name: PHARMACY_STAFF_NAME.into(),
                });
            }

            let record = DispensingRecord {
                log_date,
                patient_id: log.patient_id.trim().to_string(),
                medication_name: log.medication.trim().to_string(),
                dose_instructions: log.dose.as_deref().unwrap_or_default().trim().to_string(),
                lot_number,
                expiration_date,
                amount: log.amount.as_deref().unwrap_or_default().trim().to_string(),
                physician_name: non_empty(log.physician.as_deref()),
                student_name: non_empty(log.student.as_deref()),
                site_id,
                physician_id,
                student_id,
                entered_by,
            };

            match to_record(Table::DispensingLogs, &record) {
                Ok(record) => items.push((label, record)),
                Err(e) => report.record_failure(label, &PersistenceError::from(e)),
            }
        }

        insert_only(
            self.backend,
            Table::DispensingLogs,
            &items,
            self.config.batch_size,
            &mut report,
        );
        report.log_completion();
        report
    }

    /// Fresh report for `stage`, holding the rows of that stage the source
    /// could not decode.
    fn start_stage(&self, stage: Stage) -> StageReport {
        let mut report = StageReport::new(stage);
        for row in self.rejected.iter().filter(|row| row.stage == stage) {
            let error = rejected(&format!("malformed row {}: {}", row.index, row.reason));
            report.record_failure(row.display_key.as_str(), &error);
        }
        report
    }

    fn resolve_site(&mut self, label: &str, site: Option<&str>) -> Option<Uuid> {
        let name = non_empty(site)?;
        let id = self.sites.get(&name);
        if id.is_none() {
            self.warn(IngestWarning::UnresolvedReference {
                record: label.to_string(),
                reference: ReferenceKind::Site,
                name,
            });
        }
        id
    }

    fn resolve_person(
        &mut self,
        label: &str,
        name: Option<&str>,
        reference: ReferenceKind,
    ) -> Option<Uuid> {
        let name = non_empty(name)?;
        let role_hint = match reference {
            ReferenceKind::Physician => Some(PersonRole::Physician),
            ReferenceKind::Student => Some(PersonRole::Student),
            ReferenceKind::Site | ReferenceKind::EnteredBy => None,
        };

        match self.directory.resolve(&name, role_hint) {
            PersonResolution::Resolved(id) => Some(id),
            PersonResolution::Unresolved => {
                self.warn(IngestWarning::UnresolvedReference {
                    record: label.to_string(),
                    reference,
                    name,
                });
                None
            }
            PersonResolution::Ambiguous(candidates) => {
                self.warn(IngestWarning::AmbiguousReference {
                    record: label.to_string(),
                    reference,
                    name,
                    candidates: candidates.len(),
                });
                None
            }
        }
    }

    fn warn(&mut self, warning: IngestWarning) {
        tracing::warn!(warning = ?warning, "Ingest warning");
        self.warnings.push(warning);
    }
}

/// Delete every medication, then insert the normalized formulary rows.
///
/// Not transactional: a failed delete is counted and the loop moves on, and
/// the insert stage runs regardless.
pub fn refresh_formulary<B: Backend + ?Sized>(
    backend: &B,
    rows: &[FormularyRow],
    config: &IngestConfig,
) -> FormularyRefreshReport {
    let mut delete = StageReport::new(Stage::FormularyDelete);

    match backend.query(Table::Medications, &[]) {
        Ok(existing) => {
            for row in &existing {
                let display_key = stored_medication_key(row);
                let result = record_id(Table::Medications, row)
                    .and_then(|id| backend.delete(Table::Medications, &id));
                match result {
                    Ok(()) => delete.deleted += 1,
                    Err(e) => delete.record_failure(display_key, &PersistenceError::from(e)),
                }
            }
        }
        Err(e) => {
            delete.record_failure(Table::Medications.as_str(), &PersistenceError::from(e));
        }
    }
    delete.log_completion();

    let mut insert = StageReport::new(Stage::FormularyInsert);
    let mut items: Vec<(String, Record)> = Vec::with_capacity(rows.len());
    for row in rows {
        let normalized =
            normalize_medication(&row.name, Some(&row.strength), None, Some(&row.quantity));
        let medication = Medication {
            name: normalized.name,
            strength: normalized.strength,
            dosage_form: normalized.dosage_form,
            stock: normalized.stock,
            is_active: true,
            notes: normalized.notes,
        };
        let display_key = medication.display_key();
        match to_record(Table::Medications, &medication) {
            Ok(record) => items.push((display_key, record)),
            Err(e) => insert.record_failure(display_key, &PersistenceError::from(e)),
        }
    }
    insert_only(backend, Table::Medications, &items, config.batch_size, &mut insert);
    insert.log_completion();

    FormularyRefreshReport { delete, insert }
}

// ═══════════════════════════════════════════
// Entry points
// ═══════════════════════════════════════════

/// Load raw records from `source` and import them into the configured database.
pub fn run_import(
    config: &IngestConfig,
    source: &dyn RecordSource,
    derive_missing: bool,
) -> Result<ImportSummary, IngestError> {
    config.validate()?;
    let mut batch = source.load()?;
    if derive_missing {
        batch.derive_missing();
    }

    let backend = open_backend(config)?;
    Ok(ImportRun::new(&backend, config).run(&batch))
}

/// Replace the medication table with the rows of a formulary CSV.
pub fn run_formulary_refresh(
    config: &IngestConfig,
    csv_path: &Path,
) -> Result<FormularyRefreshReport, IngestError> {
    config.validate()?;
    let rows = read_formulary_csv(csv_path)?;
    let backend = open_backend(config)?;
    Ok(refresh_formulary(&backend, &rows, config))
}

pub fn run_verification(config: &IngestConfig) -> Result<VerificationReport, IngestError> {
    config.validate()?;
    let backend = open_backend(config)?;
    Ok(verify_formulary(&backend)?)
}

fn open_backend(config: &IngestConfig) -> Result<SqliteBackend, IngestError> {
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    tracing::info!(path = %config.database_path.display(), "Opening database");
    Ok(SqliteBackend::open(&config.database_path)?)
}

/// SHA-256 of the placeholder secret, base64-encoded.
pub fn placeholder_credential_hash(secret: &str) -> String {
    let hash = Sha256::digest(secret.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hash)
}

fn rejected(reason: &str) -> PersistenceError {
    PersistenceError::Rejected(reason.to_string())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Display key of a stored medication row.
fn stored_medication_key(row: &Record) -> String {
    let name = row.get("name").and_then(|v| v.as_str()).unwrap_or_default();
    match row.get("strength").and_then(|v| v.as_str()) {
        Some(strength) => format!("{name} {strength}"),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::db::{count_rows, DatabaseError, Predicate};
    use serde_json::{json, Value};

    fn config() -> IngestConfig {
        IngestConfig::new("/tmp/clinic-ingest-test.db".into())
    }

    fn dispensing(
        date: &str,
        patient: &str,
        medication: &str,
        physician: &str,
        student: &str,
        site: &str,
    ) -> RawDispensingLog {
        RawDispensingLog {
            date: date.into(),
            patient_id: patient.into(),
            medication: medication.into(),
            dose: Some("1 tab daily".into()),
            lot_exp: Some("QA01467, 7/25".into()),
            amount: Some("30 tabs".into()),
            physician: Some(physician.into()),
            student: Some(student.into()),
            site: Some(site.into()),
        }
    }

    fn scenario() -> RawBatch {
        RawBatch {
            sites: vec![
                RawSite {
                    name: "Pacific".into(),
                    date: Some("2023-06-11".into()),
                },
                RawSite {
                    name: "James Town".into(),
                    date: None,
                },
            ],
            medications: vec![
                RawMedication {
                    name: "Aspirin 81mg".into(),
                    ..RawMedication::default()
                },
                RawMedication {
                    name: "Lisinopril".into(),
                    strength: Some("10mg".into()),
                    dosage_form: Some("tablet".into()),
                    quantity: Some("90 tabs".into()),
                },
            ],
            persons: vec![
                RawPerson::new("Karen C", PersonRole::Physician),
                RawPerson::new("Alex", PersonRole::Physician),
                RawPerson::new("Simeon R", PersonRole::Student),
            ],
            dispensing_logs: [
                ("2023-06-11", "2035-39", "Aspirin 81mg", "Karen C", "Simeon R", "Pacific"),
                ("2023-06-11", "2035-40", "Lisinopril 10mg", "Alex", "Simeon R", "Pacific"),
                ("2023-06-18", "2035-41", "Aspirin 81mg", "Karen", "Simeon", "James Town"),
                ("2023-06-18", "2035-42", "Aspirin 81mg", "Alex", "Simeon R", "James Town"),
                ("2023-06-25", "2035-43", "Lisinopril 10mg", "Karen C", "Simeon R", "Pacific"),
            ]
            .into_iter()
            .map(|(date, patient, medication, physician, student, site)| {
                dispensing(date, patient, medication, physician, student, site)
            })
            .collect(),
            rejected: vec![],
        }
    }

    fn count(backend: &SqliteBackend, table: Table) -> i64 {
        count_rows(backend.connection(), table).unwrap()
    }

    #[test]
    fn end_to_end_scenario() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        let summary = ImportRun::new(&backend, &config).run(&scenario());

        assert_eq!(summary.total_errors(), 0, "{:?}", summary);
        assert!(summary.warnings.is_empty(), "{:?}", summary.warnings);
        assert_eq!(count(&backend, Table::Sites), 2);
        assert_eq!(count(&backend, Table::Medications), 2);
        assert_eq!(count(&backend, Table::Persons), 4);
        assert_eq!(count(&backend, Table::DispensingLogs), 5);
        assert_eq!(summary.persons.inserted, 4);
        assert_eq!(summary.dispensing_records.inserted, 5);
    }

    #[test]
    fn dispensing_rows_reference_resolved_ids() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        ImportRun::new(&backend, &config).run(&scenario());

        let staff = backend
            .query(Table::Persons, &[Predicate::eq("email", "pharmacy@clinic.org")])
            .unwrap();
        let staff_id = staff[0].get("id").cloned().unwrap();

        let rows = backend
            .query(Table::DispensingLogs, &[Predicate::eq("patient_id", "2035-41")])
            .unwrap();
        let row = &rows[0];
        assert_eq!(row.get("lot_number"), Some(&json!("QA01467")));
        assert_eq!(row.get("expiration_date"), Some(&json!("7/25")));
        assert_eq!(row.get("entered_by"), Some(&staff_id));
        // "Karen" and "Simeon" resolve through the unambiguous first-name fallback
        assert!(row.get("physician_id").and_then(Value::as_str).is_some());
        assert!(row.get("student_id").and_then(Value::as_str).is_some());
        assert!(row.get("site_id").and_then(Value::as_str).is_some());
    }

    #[test]
    fn second_run_only_appends_dispensing_records() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        ImportRun::new(&backend, &config).run(&scenario());
        let second = ImportRun::new(&backend, &config).run(&scenario());

        assert_eq!(second.total_errors(), 0);
        assert_eq!(second.sites.inserted, 0);
        assert_eq!(second.sites.reused, 2);
        assert_eq!(second.persons.reused, 4);
        assert_eq!(count(&backend, Table::Sites), 2);
        assert_eq!(count(&backend, Table::Medications), 2);
        assert_eq!(count(&backend, Table::Persons), 4);
        assert_eq!(count(&backend, Table::DispensingLogs), 10);
    }

    #[test]
    fn unmatched_physician_stored_as_null() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        let mut batch = scenario();
        batch.dispensing_logs = vec![dispensing(
            "2023-06-11",
            "2035-39",
            "Aspirin 81mg",
            "Ramirez",
            "Simeon R",
            "Pacific",
        )];

        let summary = ImportRun::new(&backend, &config).run(&batch);

        assert_eq!(summary.total_errors(), 0);
        assert_eq!(summary.dispensing_records.inserted, 1);
        assert!(summary.warnings.iter().any(|w| matches!(
            w,
            IngestWarning::UnresolvedReference {
                reference: ReferenceKind::Physician,
                name,
                ..
            } if name == "Ramirez"
        )));
        let rows = backend.query(Table::DispensingLogs, &[]).unwrap();
        assert_eq!(rows[0].get("physician_id"), Some(&Value::Null));
        assert_eq!(rows[0].get("physician_name"), Some(&json!("Ramirez")));
    }

    #[test]
    fn ambiguous_first_name_is_flagged_not_merged() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        let mut batch = scenario();
        batch.persons.push(RawPerson::new("Karen M", PersonRole::Physician));
        batch.dispensing_logs = vec![dispensing(
            "2023-06-11",
            "2035-39",
            "Aspirin 81mg",
            "Karen",
            "Simeon R",
            "Pacific",
        )];

        let summary = ImportRun::new(&backend, &config).run(&batch);

        assert_eq!(summary.total_errors(), 0);
        assert!(summary.warnings.iter().any(|w| matches!(
            w,
            IngestWarning::AmbiguousReference { candidates: 2, .. }
        )));
        let rows = backend.query(Table::DispensingLogs, &[]).unwrap();
        assert_eq!(rows[0].get("physician_id"), Some(&Value::Null));
    }

    #[test]
    fn bad_log_date_fails_only_that_record() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        let mut batch = scenario();
        batch.dispensing_logs[1].date = "6/11/23".into();

        let summary = ImportRun::new(&backend, &config).run(&batch);

        assert_eq!(summary.dispensing_records.failed, 1);
        assert_eq!(summary.dispensing_records.inserted, 4);
        assert_eq!(count(&backend, Table::DispensingLogs), 4);
    }

    #[test]
    fn malformed_fields_fall_back_with_warnings() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        let mut batch = scenario();
        batch.sites[1].date = Some("June 18".into());
        batch.medications[1].dosage_form = Some("lozenge".into());
        batch.dispensing_logs[0].lot_exp = Some("ABC123".into());

        let summary = ImportRun::new(&backend, &config).run(&batch);

        assert_eq!(summary.total_errors(), 0);
        let fields: Vec<&str> = summary
            .warnings
            .iter()
            .filter_map(|w| match w {
                IngestWarning::MalformedField { field, .. } => Some(field.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fields, vec!["date", "dosage_form", "lot_exp"]);

        let rows = backend
            .query(Table::DispensingLogs, &[Predicate::eq("patient_id", "2035-39")])
            .unwrap();
        assert_eq!(rows[0].get("lot_number"), Some(&json!("ABC123")));
        assert_eq!(rows[0].get("expiration_date"), Some(&json!("")));
    }

    #[test]
    fn persons_get_placeholder_credential() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        ImportRun::new(&backend, &config).run(&scenario());

        let rows = backend
            .query(Table::Persons, &[Predicate::eq("email", "simeon.r@emory.edu")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("role"), Some(&json!("student")));
        assert_eq!(rows[0].get("first_name"), Some(&json!("Simeon")));
        assert_eq!(rows[0].get("last_name"), Some(&json!("R")));
        assert_eq!(
            rows[0].get("credential_hash"),
            Some(&json!(placeholder_credential_hash("TempPass123!")))
        );
    }

    #[test]
    fn credential_hash_is_base64_sha256() {
        let hash = placeholder_credential_hash("TempPass123!");
        assert_eq!(hash.len(), 44);
        assert_eq!(hash, placeholder_credential_hash("TempPass123!"));
        assert_ne!(hash, placeholder_credential_hash("other"));
    }

    #[test]
    fn formulary_refresh_replaces_table() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        ImportRun::new(&backend, &config).run(&scenario());
        assert_eq!(count(&backend, Table::Medications), 2);

        let rows = vec![
            FormularyRow {
                name: "Omeprazole caps".into(),
                strength: "20mg".into(),
                quantity: "30 caps".into(),
            },
            FormularyRow {
                name: "Albuterol Inhaler".into(),
                strength: "x".into(),
                quantity: "Dispense on-site".into(),
            },
            FormularyRow {
                name: "Amoxicillin susp".into(),
                strength: "250mg/5ml".into(),
                quantity: "2 bottles".into(),
            },
        ];
        let report = refresh_formulary(&backend, &rows, &config);

        assert_eq!(report.total_errors(), 0);
        assert_eq!(report.delete.deleted, 2);
        assert_eq!(report.insert.inserted, 3);

        let stored = backend.query(Table::Medications, &[]).unwrap();
        let summary: Vec<(Value, Value, Value, Value)> = stored
            .iter()
            .map(|r| {
                (
                    r["name"].clone(),
                    r["strength"].clone(),
                    r["dosage_form"].clone(),
                    r["stock"].clone(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                (json!("Omeprazole"), json!("20mg"), json!("capsule"), json!(30)),
                (json!("Albuterol Inhaler"), Value::Null, json!("inhaler"), json!(0)),
                (json!("Amoxicillin"), json!("250mg/5ml"), json!("liquid"), json!(2)),
            ]
        );
    }

    /// Fails the first delete it receives.
    struct FlakyDeleteBackend {
        inner: SqliteBackend,
        failed_once: Cell<bool>,
    }

    impl Backend for FlakyDeleteBackend {
        fn query(
            &self,
            table: Table,
            predicates: &[Predicate],
        ) -> Result<Vec<Record>, DatabaseError> {
            self.inner.query(table, predicates)
        }

        fn insert(&self, table: Table, record: &Record) -> Result<Record, DatabaseError> {
            self.inner.insert(table, record)
        }

        fn delete(&self, table: Table, id: &Uuid) -> Result<(), DatabaseError> {
            if !self.failed_once.replace(true) {
                return Err(DatabaseError::NotFound {
                    entity_type: table.as_str().into(),
                    id: id.to_string(),
                });
            }
            self.inner.delete(table, id)
        }
    }

    #[test]
    fn failed_delete_is_counted_and_refresh_continues() {
        let backend = FlakyDeleteBackend {
            inner: SqliteBackend::in_memory().unwrap(),
            failed_once: Cell::new(false),
        };
        let config = config();
        let mut batch = scenario();
        batch.medications.push(RawMedication {
            name: "Metformin 500mg".into(),
            ..RawMedication::default()
        });
        ImportRun::new(&backend, &config).run(&batch);
        assert_eq!(count(&backend.inner, Table::Medications), 3);

        let rows = vec![FormularyRow {
            name: "Omeprazole caps".into(),
            strength: "20mg".into(),
            quantity: "30 caps".into(),
        }];
        let report = refresh_formulary(&backend, &rows, &config);

        assert_eq!(report.delete.deleted, 2);
        assert_eq!(report.delete.failed, 1);
        assert_eq!(report.insert.inserted, 1);
        assert_eq!(report.total_errors(), 1);
        // the medication whose delete failed stays next to the new row
        assert_eq!(count(&backend.inner, Table::Medications), 2);
        let omeprazole = backend
            .query(Table::Medications, &[Predicate::eq("name", "Omeprazole")])
            .unwrap();
        assert_eq!(omeprazole.len(), 1);
    }

    #[test]
    fn malformed_log_fails_only_that_row() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("records.json");
        let bundle = json!({
            "sites": [{"name": "Pacific"}],
            "persons": [
                {"name": "Karen C", "role": "physician"},
                {"name": "Nina P", "role": "nurse"}
            ],
            "dispensing_logs": [
                {"date": "2023-06-11", "patient_id": "2035-39", "medication": "Aspirin 81mg",
                 "dose": "1 tab daily", "amount": "30 tabs", "physician": "Karen C"},
                {"date": "2023-06-11", "medication": "Lisinopril 10mg", "amount": "90 tabs"},
                {"date": "2023-06-18", "patient_id": "2035-41", "medication": "Aspirin 81mg",
                 "dose": null, "amount": "30 tabs", "site": "Pacific"}
            ]
        });
        std::fs::write(&json_path, bundle.to_string()).unwrap();

        let config = IngestConfig::new(dir.path().join("clinic.db"));
        let source = crate::pipeline::JsonFileSource::new(&json_path);
        let summary = run_import(&config, &source, false).unwrap();

        assert_eq!(summary.sites.inserted, 1);
        assert_eq!(summary.persons.inserted, 2);
        assert_eq!(summary.persons.failed, 1);
        assert_eq!(summary.persons.failures[0].display_key, "Nina P");
        assert_eq!(summary.dispensing_records.inserted, 2);
        assert_eq!(summary.dispensing_records.failed, 1);
        assert_eq!(summary.dispensing_records.failures[0].display_key, "Lisinopril 10mg");
        assert!(summary.dispensing_records.failures[0].error.contains("malformed row 1"));

        let backend = SqliteBackend::open(&config.database_path).unwrap();
        assert_eq!(count(&backend, Table::DispensingLogs), 2);
        let rows = backend
            .query(Table::DispensingLogs, &[Predicate::eq("patient_id", "2035-41")])
            .unwrap();
        assert_eq!(rows[0].get("dose_instructions"), Some(&json!("")));
    }

    #[test]
    fn listed_pharmacy_staff_is_reused_for_entered_by() {
        let backend = SqliteBackend::in_memory().unwrap();
        let config = config();
        let mut batch = scenario();
        batch
            .persons
            .push(RawPerson::new(PHARMACY_STAFF_NAME, PersonRole::PharmacyStaff));

        let summary = ImportRun::new(&backend, &config).run(&batch);

        assert_eq!(summary.total_errors(), 0);
        assert_eq!(summary.persons.inserted, 4);
        assert_eq!(summary.persons.reused, 1);
        assert_eq!(count(&backend, Table::Persons), 4);
        let rows = backend.query(Table::DispensingLogs, &[]).unwrap();
        assert!(rows.iter().all(|r| r.get("entered_by").and_then(Value::as_str).is_some()));
    }

    #[test]
    fn run_import_reads_json_and_derives_missing() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("records.json");
        let mut batch = scenario();
        batch.medications.clear();
        batch.persons.clear();
        std::fs::write(&json_path, serde_json::to_string(&batch).unwrap()).unwrap();

        let config = IngestConfig::new(dir.path().join("db").join("clinic.db"));
        let source = crate::pipeline::JsonFileSource::new(&json_path);
        let summary = run_import(&config, &source, true).unwrap();

        assert_eq!(summary.total_errors(), 0);
        assert_eq!(summary.medications.inserted, 2);
        // Karen C, Alex, Karen (physicians), Simeon R, Simeon (students), staff
        assert_eq!(summary.persons.inserted, 6);
        assert!(config.database_path.exists());

        let report = run_verification(&config).unwrap();
        assert_eq!(report.total_active, 2);
    }

    #[test]
    fn run_import_rejects_invalid_config_before_loading() {
        let mut config = config();
        config.batch_size = 0;
        let err = run_import(&config, &RawBatch::default(), false).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(_)));
    }
}
