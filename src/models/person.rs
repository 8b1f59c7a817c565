use serde::{Deserialize, Serialize};

use super::enums::PersonRole;

/// Clinic staff member (physician, student, or pharmacy staff).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub email: String,
    pub role: PersonRole,
    pub first_name: String,
    pub last_name: String,
    /// Placeholder only; not an authentication mechanism.
    pub credential_hash: String,
    pub is_active: bool,
}
