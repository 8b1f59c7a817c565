use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A clinic site. Keyed by exact name; the backend assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub date: Option<NaiveDate>,
}
