//! Datastore boundary
//!
//! The engine talks to durable storage through [`Datastore`], a batch API
//! shaped like a REST store: look up which keys exist, insert new rows (a
//! whole batch fails on any unique conflict), update existing rows with merge
//! semantics, and load the persisted state at the start of a run.
//!
//! Rows travel as [`PatchRow`] maps. Every row in a batch carries the same
//! key set; unset fields are explicit nulls, never omitted.

pub mod sqlite;

use crate::crossref::CrossrefEntry;
use crate::error::{StoreError, StoreResult};
use crate::types::{Entity, ProducerTier, RecordKey};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use uuid::Uuid;

pub use sqlite::SqliteDatastore;

/// One row of a patch batch: column → value
pub type PatchRow = Map<String, Value>;

/// Tables the engine writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Entities,
    Candidates,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Entities => "entities",
            Table::Candidates => "candidates",
        }
    }

    /// Column that identifies a row for upserts
    pub fn key_column(self) -> &'static str {
        match self {
            Table::Entities => "entity_id",
            Table::Candidates => "source_record_id",
        }
    }

    /// Writable columns
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Table::Entities => ENTITY_COLUMNS,
            Table::Candidates => CANDIDATE_COLUMNS,
        }
    }

    /// Key value of a row, if present and a string
    pub fn row_key(self, row: &PatchRow) -> Option<String> {
        row.get(self.key_column())
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const ENTITY_COLUMNS: &[&str] = &[
    "entity_id",
    "origin_record_id",
    "merged_into",
    "location_precision",
    "lat",
    "lon",
    "location_source",
    "location_tier",
    "capacity_mw",
    "capacity_source",
    "capacity_tier",
    "name",
    "name_source",
    "name_tier",
    "address",
    "address_source",
    "address_tier",
    "owner",
    "owner_source",
    "owner_tier",
    "operator",
    "operator_source",
    "operator_tier",
    "developer",
    "developer_source",
    "developer_tier",
    "installer",
    "installer_source",
    "installer_tier",
];

pub const CANDIDATE_COLUMNS: &[&str] = &[
    "source_record_id",
    "producer",
    "tier",
    "entity_id",
    "crossrefs",
];

/// Sorted key set of a row
pub fn key_set(row: &PatchRow) -> BTreeSet<&str> {
    row.keys().map(String::as_str).collect()
}

/// Fail with [`StoreError::BatchShape`] unless every row has the key set of
/// the first
pub fn ensure_uniform_keys(rows: &[PatchRow]) -> StoreResult<()> {
    let Some(first) = rows.first() else {
        return Ok(());
    };
    let expected = key_set(first);
    for (index, row) in rows.iter().enumerate().skip(1) {
        let actual = key_set(row);
        if actual != expected {
            let missing: Vec<_> = expected.difference(&actual).collect();
            let extra: Vec<_> = actual.difference(&expected).collect();
            return Err(StoreError::BatchShape(format!(
                "row {} differs from row 0: missing {:?}, extra {:?}",
                index, missing, extra
            )));
        }
    }
    Ok(())
}

/// Persisted candidate assignment
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRow {
    pub key: RecordKey,
    pub tier: ProducerTier,
    pub entity_id: Uuid,
    pub crossrefs: Vec<CrossrefEntry>,
}

/// Everything a run needs from previous runs
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Persisted entities, including tombstones; `members` is left empty
    pub entities: Vec<Entity>,
    pub candidates: Vec<CandidateRow>,
}

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Subset of `keys` already present in `table`
    async fn existing_keys(&self, table: Table, keys: &[String]) -> StoreResult<HashSet<String>>;

    /// Insert new rows; any unique conflict fails the whole batch
    async fn insert_batch(&self, table: Table, rows: &[PatchRow]) -> StoreResult<()>;

    /// Merge rows into existing ones
    async fn update_batch(&self, table: Table, rows: &[PatchRow]) -> StoreResult<()>;

    async fn load_snapshot(&self) -> StoreResult<StoreSnapshot>;
}
