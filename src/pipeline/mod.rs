pub mod error;
pub mod loader;
pub mod normalize;
pub mod report;
pub mod resolve;
pub mod source;
pub mod upsert;
pub mod verify;

pub use error::{IngestError, PersistenceError, SourceError};
pub use loader::{
    placeholder_credential_hash, refresh_formulary, run_formulary_refresh, run_import,
    run_verification, ImportRun, PHARMACY_STAFF_NAME,
};
pub use report::{
    FormularyRefreshReport, ImportSummary, IngestWarning, ItemFailure, ReferenceKind, Stage,
    StageReport,
};
pub use resolve::{Entity, MedicationKey, PersonDirectory, PersonResolution};
pub use source::{
    parse_formulary_csv, read_formulary_csv, FormularyRow, JsonFileSource, RawBatch,
    RawDispensingLog, RawMedication, RawPerson, RawSite, RecordSource, RejectedRow,
};
pub use upsert::{insert_only, upsert, upsert_batch, IdentityMap, UpsertOutcome};
pub use verify::{verify_formulary, DuplicateGroup, VerificationReport};
