//! Post-load formulary check: duplicate identities and stock totals.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{Backend, DatabaseError, Predicate, Table};

/// More than one active row for the same (name, strength).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub name: String,
    pub strength: Option<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub total_active: usize,
    pub duplicates: Vec<DuplicateGroup>,
    pub total_stock: u64,
    pub with_stock: usize,
    pub zero_stock: usize,
}

impl VerificationReport {
    pub fn has_duplicates(&self) -> bool {
        !self.duplicates.is_empty()
    }
}

/// Summarize active medications. Rows without a stock value count as zero.
pub fn verify_formulary<B>(backend: &B) -> Result<VerificationReport, DatabaseError>
where
    B: Backend + ?Sized,
{
    let rows = backend.query(Table::Medications, &[Predicate::eq("is_active", true)])?;

    let mut groups: BTreeMap<(String, Option<String>), usize> = BTreeMap::new();
    let mut total_stock: u64 = 0;
    let mut with_stock = 0;

    for row in &rows {
        let name = row.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
        let strength = row.get("strength").and_then(Value::as_str).map(String::from);
        *groups.entry((name, strength)).or_default() += 1;

        let stock = row.get("stock").and_then(Value::as_u64).unwrap_or(0);
        if stock > 0 {
            with_stock += 1;
            total_stock += stock;
        }
    }

    let duplicates: Vec<DuplicateGroup> = groups
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|((name, strength), count)| DuplicateGroup { name, strength, count })
        .collect();

    let report = VerificationReport {
        total_active: rows.len(),
        duplicates,
        total_stock,
        with_stock,
        zero_stock: rows.len() - with_stock,
    };

    if report.has_duplicates() {
        tracing::warn!(groups = report.duplicates.len(), "Duplicate medications found");
    }
    tracing::info!(
        total_active = report.total_active,
        total_stock = report.total_stock,
        with_stock = report.with_stock,
        zero_stock = report.zero_stock,
        "Formulary verified"
    );
    Ok(report)
}
