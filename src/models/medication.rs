use serde::{Deserialize, Serialize};

use super::enums::DosageForm;

/// A formulary medication as persisted in the `medications` table.
///
/// `(name, strength)` is the identity key. A `None` strength only ever
/// matches another `None` strength.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    pub strength: Option<String>,
    pub dosage_form: DosageForm,
    pub stock: Option<u32>,
    pub is_active: bool,
    pub notes: Option<String>,
}
