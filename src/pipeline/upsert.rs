//! Idempotent upsert engine.
//!
//! Entities are matched on their identity key, first against the run-local
//! [`IdentityMap`], then against the backend. A match reuses the stored id and
//! leaves the stored row untouched; no match inserts the full payload.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use uuid::Uuid;

use super::error::PersistenceError;
use super::report::StageReport;
use super::resolve::Entity;
use crate::db::{record_id, to_record, Backend, DatabaseError, Predicate, Record, Table};

/// Identity key → backend id, owned by one run. Only successes are recorded.
#[derive(Debug, Clone)]
pub struct IdentityMap<K> {
    ids: HashMap<K, Uuid>,
}

impl<K: Eq + Hash> Default for IdentityMap<K> {
    fn default() -> Self {
        Self {
            ids: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> IdentityMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<Uuid> {
        self.ids.get(key).copied()
    }

    pub fn record(&mut self, key: K, id: Uuid) {
        self.ids.insert(key, id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Uuid),
    Reused(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Inserted(id) | Self::Reused(id) => *id,
        }
    }
}

/// Find-or-create a single entity: run-local map first, then the backend.
///
/// Same steps as [`upsert_batch`] for one item. Only a success enters `map`.
pub fn upsert<B, E>(
    backend: &B,
    entity: &E,
    map: &mut IdentityMap<E::Key>,
) -> Result<UpsertOutcome, PersistenceError>
where
    B: Backend + ?Sized,
    E: Entity,
{
    let key = entity.identity_key();
    if let Some(id) = map.get(&key) {
        return Ok(UpsertOutcome::Reused(id));
    }

    let lookup = backend.query(E::TABLE, &entity.identity_predicates());
    let outcome = match existing_id(E::TABLE, lookup)? {
        Some(id) => UpsertOutcome::Reused(id),
        None => {
            let record = to_record(E::TABLE, entity)?;
            let stored = backend.insert(E::TABLE, &record);
            UpsertOutcome::Inserted(stored_id(E::TABLE, stored)?)
        }
    };

    map.record(key, outcome.id());
    Ok(outcome)
}

/// Id of the first row an identity lookup returned, if any.
fn existing_id(
    table: Table,
    lookup: Result<Vec<Record>, DatabaseError>,
) -> Result<Option<Uuid>, DatabaseError> {
    match lookup?.first() {
        Some(row) => record_id(table, row).map(Some),
        None => Ok(None),
    }
}

fn stored_id(table: Table, stored: Result<Record, DatabaseError>) -> Result<Uuid, DatabaseError> {
    stored.and_then(|row| record_id(table, &row))
}

/// Upsert entities in chunks of `batch_size`.
///
/// Returns one id per entity, in order; `None` where the entity failed.
/// Failures are counted in `report` and never enter `map`.
pub fn upsert_batch<B, E>(
    backend: &B,
    entities: &[E],
    map: &mut IdentityMap<E::Key>,
    batch_size: usize,
    report: &mut StageReport,
) -> Vec<Option<Uuid>>
where
    B: Backend + ?Sized,
    E: Entity,
{
    let mut ids = vec![None; entities.len()];
    let mut failed_keys: HashSet<E::Key> = HashSet::new();

    for (chunk_index, chunk) in entities.chunks(batch_size.max(1)).enumerate() {
        let offset = chunk_index * batch_size.max(1);
        upsert_chunk(backend, chunk, offset, map, &mut failed_keys, &mut ids, report);
    }

    ids
}

fn upsert_chunk<B, E>(
    backend: &B,
    chunk: &[E],
    offset: usize,
    map: &mut IdentityMap<E::Key>,
    failed_keys: &mut HashSet<E::Key>,
    ids: &mut [Option<Uuid>],
    report: &mut StageReport,
) where
    B: Backend + ?Sized,
    E: Entity,
{
    // First occurrence of each unknown key goes to the backend; repeats wait
    // for it and resolve from the map afterwards.
    let mut leaders: Vec<usize> = Vec::new();
    let mut followers: Vec<usize> = Vec::new();
    let mut pending: HashSet<E::Key> = HashSet::new();

    for (i, entity) in chunk.iter().enumerate() {
        let key = entity.identity_key();
        if let Some(id) = map.get(&key) {
            ids[offset + i] = Some(id);
            report.reused += 1;
        } else if failed_keys.contains(&key) || pending.contains(&key) {
            followers.push(i);
        } else {
            pending.insert(key);
            leaders.push(i);
        }
    }

    if leaders.is_empty() {
        resolve_followers(chunk, &followers, offset, map, ids, report);
        return;
    }

    // Existence check
    let predicate_sets: Vec<Vec<Predicate>> = leaders
        .iter()
        .map(|&i| chunk[i].identity_predicates())
        .collect();
    let lookups = backend.query_batch(E::TABLE, &predicate_sets);
    if lookups.len() != leaders.len() {
        let error = mismatch(E::TABLE, "query", leaders.len(), lookups.len());
        for &i in leaders.iter().chain(&followers) {
            failed_keys.insert(chunk[i].identity_key());
            report.record_failure(chunk[i].display_key(), &error);
        }
        return;
    }

    let mut to_insert: Vec<usize> = Vec::new();
    let mut records: Vec<Record> = Vec::new();
    for (&i, lookup) in leaders.iter().zip(lookups) {
        let entity = &chunk[i];
        match existing_id(E::TABLE, lookup) {
            Ok(Some(id)) => {
                map.record(entity.identity_key(), id);
                ids[offset + i] = Some(id);
                report.reused += 1;
            }
            Ok(None) => match to_record(E::TABLE, entity) {
                Ok(record) => {
                    to_insert.push(i);
                    records.push(record);
                }
                Err(e) => fail(entity, e.into(), failed_keys, report),
            },
            Err(e) => fail(entity, e.into(), failed_keys, report),
        }
    }

    if !records.is_empty() {
        let stored = backend.insert_batch(E::TABLE, &records);
        if stored.len() != records.len() {
            let error = mismatch(E::TABLE, "insert", records.len(), stored.len());
            for &i in &to_insert {
                failed_keys.insert(chunk[i].identity_key());
                report.record_failure(chunk[i].display_key(), &error);
            }
        } else {
            for (&i, result) in to_insert.iter().zip(stored) {
                let entity = &chunk[i];
                match stored_id(E::TABLE, result) {
                    Ok(id) => {
                        map.record(entity.identity_key(), id);
                        ids[offset + i] = Some(id);
                        report.inserted += 1;
                    }
                    Err(e) => fail(entity, e.into(), failed_keys, report),
                }
            }
        }
    }

    resolve_followers(chunk, &followers, offset, map, ids, report);
}

fn resolve_followers<E: Entity>(
    chunk: &[E],
    followers: &[usize],
    offset: usize,
    map: &IdentityMap<E::Key>,
    ids: &mut [Option<Uuid>],
    report: &mut StageReport,
) {
    for &i in followers {
        let entity = &chunk[i];
        match map.get(&entity.identity_key()) {
            Some(id) => {
                ids[offset + i] = Some(id);
                report.reused += 1;
            }
            None => report.record_failure(
                entity.display_key(),
                &PersistenceError::Rejected("identity key failed earlier in the same batch".into()),
            ),
        }
    }
}

fn fail<E: Entity>(
    entity: &E,
    error: PersistenceError,
    failed_keys: &mut HashSet<E::Key>,
    report: &mut StageReport,
) {
    failed_keys.insert(entity.identity_key());
    report.record_failure(entity.display_key(), &error);
}

fn mismatch(table: Table, call: &str, expected: usize, got: usize) -> PersistenceError {
    PersistenceError::Database(DatabaseError::MalformedRow {
        table: table.as_str().into(),
        reason: format!("batch {call} returned {got} results for {expected} items"),
    })
}

/// Append-only insert of pre-built records, in chunks of `batch_size`.
///
/// Each item is `(display_key, record)`. Returns one id per item, in order.
pub fn insert_only<B>(
    backend: &B,
    table: Table,
    items: &[(String, Record)],
    batch_size: usize,
    report: &mut StageReport,
) -> Vec<Option<Uuid>>
where
    B: Backend + ?Sized,
{
    let mut ids = Vec::with_capacity(items.len());

    for chunk in items.chunks(batch_size.max(1)) {
        let records: Vec<Record> = chunk.iter().map(|(_, record)| record.clone()).collect();
        let results = backend.insert_batch(table, &records);

        if results.len() != chunk.len() {
            let error = mismatch(table, "insert", chunk.len(), results.len());
            for (display_key, _) in chunk {
                report.record_failure(display_key.as_str(), &error);
                ids.push(None);
            }
            continue;
        }

        for ((display_key, _), result) in chunk.iter().zip(results) {
            match stored_id(table, result) {
                Ok(id) => {
                    report.inserted += 1;
                    ids.push(Some(id));
                }
                Err(e) => {
                    report.record_failure(display_key.as_str(), &PersistenceError::from(e));
                    ids.push(None);
                }
            }
        }
    }

    ids
}
