//! Field normalization for hand-written clinic records.
//!
//! Pure functions over compound text fields: medication label → name and
//! strength, "lot, expiration" pairs, free-text stock quantities. Every
//! function has a deterministic fallback and never fails on arbitrary input.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::enums::DosageForm;

static FIRST_DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Noise fragments stripped from medication names. Applied in order: later
/// entries can be substrings of earlier ones.
const NAME_NOISE: &[&str] = &[" caps", " susp", ", chewable", ", liquid", ",  liquid"];

/// Ordered keyword rules; the first rule with a matching keyword wins.
const DOSAGE_FORM_RULES: &[(&[&str], DosageForm)] = &[
    (&["inhaler"], DosageForm::Inhaler),
    (&["liquid", "susp", "syrup"], DosageForm::Liquid),
    (&["cream", "ointment", "gel"], DosageForm::Topical),
    (&["drop"], DosageForm::Drops),
    (&["spray"], DosageForm::Spray),
    (&["caps", "capsule"], DosageForm::Capsule),
];

/// Split a medication label into name and strength.
///
/// The last whitespace token is the strength only when it contains a digit
/// and at least one token precedes it. `"Ibuprofen 200 mg"` therefore keeps
/// its full label as the name: `"mg"` carries no digit.
pub fn split_name_and_strength(label: &str) -> (String, Option<String>) {
    let tokens: Vec<&str> = label.split_whitespace().collect();

    match tokens.split_last() {
        Some((last, rest)) if !rest.is_empty() && last.chars().any(|c| c.is_ascii_digit()) => {
            (rest.join(" "), Some((*last).to_string()))
        }
        _ => (tokens.join(" "), None),
    }
}

/// Split `"QA01467, 7/25"` into `("QA01467", "7/25")` on the first comma.
/// Without a comma the whole trimmed value is the lot number.
pub fn split_lot_and_expiration(raw: &str) -> (String, String) {
    match raw.split_once(',') {
        Some((lot, expiration)) => (lot.trim().to_string(), expiration.trim().to_string()),
        None => (raw.trim().to_string(), String::new()),
    }
}

/// Stock count from a free-text quantity cell.
///
/// On-site-only items and the bare `x` placeholder are not stocked
/// centrally and count as zero. Otherwise the first run of digits wins.
pub fn parse_stock_quantity(raw: &str) -> u32 {
    let text = raw.trim().to_lowercase();

    if text.contains("on-site") || text == "x" {
        return 0;
    }

    FIRST_DIGIT_RUN
        .find(&text)
        .map(|m| m.as_str().parse::<u32>().unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Infer the dosage form from keywords in a medication name.
pub fn infer_dosage_form(name: &str) -> DosageForm {
    let lower = name.to_lowercase();

    DOSAGE_FORM_RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, form)| *form)
        .unwrap_or(DosageForm::Tablet)
}

/// Strip dosage-form noise ("caps", "susp", ", chewable", ...) from a name.
pub fn clean_medication_name(raw: &str) -> String {
    NAME_NOISE
        .iter()
        .fold(raw.to_string(), |name, noise| name.replace(noise, ""))
        .trim()
        .to_string()
}

/// Empty and `x` strengths mean "no strength".
pub fn normalize_strength(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("x") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Medication fields after normalization, ready to become a persisted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMedication {
    pub name: String,
    pub strength: Option<String>,
    pub dosage_form: DosageForm,
    pub stock: Option<u32>,
    pub notes: Option<String>,
}

/// Normalize one raw medication row.
///
/// Without an explicit strength column the label itself is split. The dosage
/// form is inferred from the raw label, before noise like " caps" is removed.
pub fn normalize_medication(
    label: &str,
    strength: Option<&str>,
    dosage_form: Option<DosageForm>,
    quantity: Option<&str>,
) -> NormalizedMedication {
    let (base_name, strength) = match strength {
        Some(explicit) => (label.trim().to_string(), normalize_strength(explicit)),
        None => {
            let (name, split) = split_name_and_strength(label);
            (name, split.as_deref().and_then(normalize_strength))
        }
    };

    NormalizedMedication {
        name: clean_medication_name(&base_name),
        strength,
        dosage_form: dosage_form.unwrap_or_else(|| infer_dosage_form(label)),
        stock: quantity.map(parse_stock_quantity),
        notes: quantity.map(|q| format!("Formulary qty: {q}")),
    }
}
