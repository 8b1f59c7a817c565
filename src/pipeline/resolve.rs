//! Identity keys and person resolution.
//!
//! Each entity type has a backend identity key (what makes two rows the same
//! real-world thing across runs). Persons additionally need a run-local way
//! to map the free-text names written on dispensing logs back to ids, since
//! the source documents carry no stable staff identifier.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::db::{Predicate, Table};
use crate::models::enums::PersonRole;
use crate::models::{Medication, Person, Site};

/// A persisted entity with a backend identity key.
pub trait Entity: Serialize {
    type Key: Clone + Eq + Hash + Debug;

    const TABLE: Table;

    fn identity_key(&self) -> Self::Key;

    /// Equality predicates that find the stored row for this key.
    fn identity_predicates(&self) -> Vec<Predicate>;

    /// Human-readable key for reports and logs.
    fn display_key(&self) -> String;
}

/// Backend identity of a medication: exact (name, strength) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MedicationKey {
    pub name: String,
    pub strength: Option<String>,
}

impl Entity for Site {
    type Key = String;

    const TABLE: Table = Table::Sites;

    fn identity_key(&self) -> String {
        self.name.clone()
    }

    fn identity_predicates(&self) -> Vec<Predicate> {
        vec![Predicate::eq("name", self.name.as_str())]
    }

    fn display_key(&self) -> String {
        self.name.clone()
    }
}

impl Entity for Medication {
    type Key = MedicationKey;

    const TABLE: Table = Table::Medications;

    fn identity_key(&self) -> MedicationKey {
        MedicationKey {
            name: self.name.clone(),
            strength: self.strength.clone(),
        }
    }

    fn identity_predicates(&self) -> Vec<Predicate> {
        let strength = match &self.strength {
            Some(s) => Value::String(s.clone()),
            None => Value::Null,
        };
        vec![
            Predicate::eq("name", self.name.as_str()),
            Predicate::eq("strength", strength),
        ]
    }

    fn display_key(&self) -> String {
        match &self.strength {
            Some(strength) => format!("{} {strength}", self.name),
            None => self.name.clone(),
        }
    }
}

impl Entity for Person {
    type Key = String;

    const TABLE: Table = Table::Persons;

    fn identity_key(&self) -> String {
        self.email.clone()
    }

    fn identity_predicates(&self) -> Vec<Predicate> {
        vec![Predicate::eq("email", self.email.as_str())]
    }

    fn display_key(&self) -> String {
        self.email.clone()
    }
}

/// Lowercase, whitespace-collapsed display name.
pub fn normalize_display_name(display_name: &str) -> String {
    display_name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Run-local cross-reference key: lowercase first token of a display name.
///
/// Lossy by construction ("Karen C" and "Karen M" collide). Only used as a
/// fallback by [`PersonDirectory`] when it is unambiguous.
pub fn cross_reference_key(display_name: &str) -> Option<String> {
    display_name
        .split_whitespace()
        .next()
        .map(str::to_lowercase)
}

/// First token and the remainder of a display name.
pub fn split_display_name(display_name: &str) -> (String, String) {
    let mut tokens = display_name.split_whitespace();
    let first = tokens.next().unwrap_or_default().to_string();
    let last = tokens.collect::<Vec<_>>().join(" ");
    (first, last)
}

/// Derive the backend lookup key (email) for a person.
///
/// - physician: lowercase, spaces and dots dropped (`"Dr. B"` → `drb@…`)
/// - student: lowercase, spaces become dots (`"Simeon R"` → `simeon.r@…`)
/// - pharmacy staff: lowercase first token (`"Pharmacy Staff"` → `pharmacy@…`)
///
/// Returns `None` when the display name has nothing to build a local part from.
pub fn derive_email(display_name: &str, role: PersonRole, config: &IngestConfig) -> Option<String> {
    let collapsed = display_name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

    let (local, domain) = match role {
        PersonRole::Physician => (
            collapsed.replace([' ', '.'], ""),
            &config.physician_email_domain,
        ),
        PersonRole::Student => (collapsed.replace(' ', "."), &config.student_email_domain),
        PersonRole::PharmacyStaff => (
            cross_reference_key(display_name).unwrap_or_default(),
            &config.staff_email_domain,
        ),
    };

    if local.is_empty() {
        None
    } else {
        Some(format!("{local}@{domain}"))
    }
}

/// Outcome of resolving a free-text name to a person id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersonResolution {
    Resolved(Uuid),
    Unresolved,
    /// Several people share the name; left unlinked for manual review.
    Ambiguous(Vec<Uuid>),
}

impl PersonResolution {
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Self::Resolved(id) => Some(*id),
            Self::Unresolved | Self::Ambiguous(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    id: Uuid,
    role: PersonRole,
}

/// Display-name → person id table, built once per run from the roster.
///
/// Lookup tries the exact normalized full name first, then the first-name
/// token. Either way, several candidates are narrowed by the expected role;
/// anything still ambiguous is reported, never merged.
#[derive(Debug, Default, Clone)]
pub struct PersonDirectory {
    by_full_name: HashMap<String, Vec<DirectoryEntry>>,
    by_first_name: HashMap<String, Vec<DirectoryEntry>>,
}

impl PersonDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, display_name: &str, role: PersonRole, id: Uuid) {
        let full = normalize_display_name(display_name);
        if full.is_empty() {
            return;
        }
        let entry = DirectoryEntry { id, role };

        push_unique(self.by_full_name.entry(full).or_default(), entry.clone());
        if let Some(first) = cross_reference_key(display_name) {
            push_unique(self.by_first_name.entry(first).or_default(), entry);
        }
    }

    pub fn len(&self) -> usize {
        self.by_full_name.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_full_name.is_empty()
    }

    pub fn resolve(&self, display_name: &str, role_hint: Option<PersonRole>) -> PersonResolution {
        let full = normalize_display_name(display_name);
        if full.is_empty() {
            return PersonResolution::Unresolved;
        }

        if let Some(candidates) = self.by_full_name.get(&full) {
            return narrow(candidates, role_hint);
        }

        cross_reference_key(display_name)
            .and_then(|first| self.by_first_name.get(&first))
            .map(|candidates| narrow(candidates, role_hint))
            .unwrap_or(PersonResolution::Unresolved)
    }
}

fn push_unique(entries: &mut Vec<DirectoryEntry>, entry: DirectoryEntry) {
    if !entries.iter().any(|e| e.id == entry.id) {
        entries.push(entry);
    }
}

fn narrow(candidates: &[DirectoryEntry], role_hint: Option<PersonRole>) -> PersonResolution {
    if let [only] = candidates {
        return PersonResolution::Resolved(only.id);
    }

    if let Some(role) = role_hint {
        let same_role: Vec<&DirectoryEntry> =
            candidates.iter().filter(|e| e.role == role).collect();
        if let [only] = same_role.as_slice() {
            return PersonResolution::Resolved(only.id);
        }
    }

    match candidates {
        [] => PersonResolution::Unresolved,
        _ => PersonResolution::Ambiguous(candidates.iter().map(|e| e.id).collect()),
    }
}
