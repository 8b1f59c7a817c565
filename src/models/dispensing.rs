use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One dispensing event. Append-only: never deduplicated, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispensingRecord {
    pub log_date: NaiveDate,
    pub patient_id: String,
    pub medication_name: String,
    pub dose_instructions: String,
    pub lot_number: String,
    pub expiration_date: String,
    pub amount: String,
    pub physician_name: Option<String>,
    pub student_name: Option<String>,
    pub site_id: Option<Uuid>,
    pub physician_id: Option<Uuid>,
    pub student_id: Option<Uuid>,
    pub entered_by: Option<Uuid>,
}
