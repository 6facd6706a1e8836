//! Patch applier
//!
//! Writes the graph's changed rows to the datastore in batches:
//!
//! 1. Chunk rows (`batch_size`), checking every chunk has one key set. A
//!    mixed chunk is an engine bug: logged, counted, and re-split by key set.
//! 2. Pre-check which keys exist and route rows to insert or update.
//! 3. Retry transient failures with backoff; a batch that never succeeds is
//!    reported as transient.
//! 4. Bisect batches the store rejects until the offending rows are
//!    isolated; everything else commits.
//!
//! Batches run concurrently; each row appears in exactly one batch, so no
//! two in-flight writes touch the same key.

pub mod patch;

use crate::error::{FailureCategory, StoreError};
use crate::store::{ensure_uniform_keys, key_set, Datastore, PatchRow, Table};
use crate::utils::retry::{retry_transient, RetryPolicy};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sitelink_common::config::ApplierConfig;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub use patch::PatchSet;

/// A row that could not be written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRecord {
    pub table: &'static str,
    pub key: String,
    pub category: FailureCategory,
    pub reason: String,
}

/// Result of writing one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub applied: usize,
    pub failed: Vec<FailedRecord>,
}

impl BatchOutcome {
    fn failed_all(table: Table, rows: &[PatchRow], category: FailureCategory, reason: &str) -> Self {
        Self {
            applied: 0,
            failed: rows
                .iter()
                .map(|row| FailedRecord {
                    table: table.name(),
                    key: table.row_key(row).unwrap_or_else(|| "<no key>".to_string()),
                    category,
                    reason: reason.to_string(),
                })
                .collect(),
        }
    }

    fn extend(&mut self, other: BatchOutcome) {
        self.applied += other.applied;
        self.failed.extend(other.failed);
    }
}

/// Totals for a whole apply pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    pub batches: usize,
    /// Chunks that arrived with mixed key sets and had to be re-split
    pub reshaped_batches: usize,
    pub failed: Vec<FailedRecord>,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn failures_by_category(&self) -> BTreeMap<FailureCategory, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failed {
            *counts.entry(failure.category).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Update,
}

pub struct PatchApplier {
    store: Arc<dyn Datastore>,
    config: ApplierConfig,
    policy: RetryPolicy,
}

impl PatchApplier {
    pub fn new(store: Arc<dyn Datastore>, config: ApplierConfig) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            store,
            config,
            policy,
        }
    }

    /// Write all patches: entities first, then the candidate rows that
    /// reference them
    pub async fn apply(&self, patches: &PatchSet) -> ApplyReport {
        let mut report = ApplyReport::default();
        for table in [Table::Entities, Table::Candidates] {
            self.apply_table(table, patches.rows(table), &mut report).await;
        }

        let by_category = report.failures_by_category();
        info!(
            inserted = report.inserted,
            updated = report.updated,
            batches = report.batches,
            failed = report.failed.len(),
            ?by_category,
            "Patch application complete"
        );
        report
    }

    async fn apply_table(&self, table: Table, rows: &[PatchRow], report: &mut ApplyReport) {
        let mut batches = Vec::new();
        for chunk in rows.chunks(self.config.batch_size.max(1)) {
            if let Err(err) = ensure_uniform_keys(chunk) {
                error!(
                    table = %table,
                    rows = chunk.len(),
                    error = %err,
                    "Batch key-set mismatch (engine bug); re-splitting by key set"
                );
                report.reshaped_batches += 1;
                batches.extend(split_by_key_set(chunk));
            } else {
                batches.push(chunk.to_vec());
            }
        }
        report.batches += batches.len();

        let results: Vec<(usize, usize, BatchOutcome)> = stream::iter(batches)
            .map(|batch| self.apply_batch(table, batch))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (inserted, updated, outcome) in results {
            report.inserted += inserted;
            report.updated += updated;
            report.failed.extend(outcome.failed);
        }
    }

    /// Route one uniform batch to insert or update. Returns
    /// (inserted, updated, outcome).
    async fn apply_batch(&self, table: Table, rows: Vec<PatchRow>) -> (usize, usize, BatchOutcome) {
        let mut outcome = BatchOutcome::default();

        let (keyed, unkeyed): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|row| table.row_key(row).is_some());
        if !unkeyed.is_empty() {
            error!(table = %table, rows = unkeyed.len(), "Rows without key column");
            outcome.extend(BatchOutcome::failed_all(
                table,
                &unkeyed,
                FailureCategory::BatchShape,
                "row lacks key column",
            ));
        }
        if keyed.is_empty() {
            return (0, 0, outcome);
        }

        let keys: Vec<String> = keyed.iter().filter_map(|row| table.row_key(row)).collect();
        let store = self.store.as_ref();
        let key_refs = &keys;
        let existing: HashSet<String> = match retry_transient("existing keys lookup", self.policy, move || {
            store.existing_keys(table, key_refs)
        })
        .await
        {
            Ok(existing) => existing,
            Err(err) => {
                let category = category_of(&err);
                outcome.extend(BatchOutcome::failed_all(table, &keyed, category, &err.to_string()));
                return (0, 0, outcome);
            }
        };

        let (updates, inserts): (Vec<_>, Vec<_>) = keyed
            .into_iter()
            .partition(|row| table.row_key(row).is_some_and(|k| existing.contains(&k)));

        debug!(
            table = %table,
            inserts = inserts.len(),
            updates = updates.len(),
            "Applying batch"
        );

        let inserted = self.write_isolating(table, WriteOp::Insert, inserts).await;
        let updated = self.write_isolating(table, WriteOp::Update, updates).await;
        let counts = (inserted.applied, updated.applied);
        outcome.extend(inserted);
        outcome.extend(updated);
        (counts.0, counts.1, outcome)
    }

    /// Write rows, bisecting rejected batches down to single offending rows
    async fn write_isolating(&self, table: Table, op: WriteOp, rows: Vec<PatchRow>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut pending = vec![rows];
        let store = self.store.as_ref();
        let operation = match op {
            WriteOp::Insert => format!("insert {} batch", table),
            WriteOp::Update => format!("update {} batch", table),
        };

        while let Some(batch) = pending.pop() {
            if batch.is_empty() {
                continue;
            }
            let rows = batch.as_slice();
            let result = retry_transient(&operation, self.policy, move || async move {
                match op {
                    WriteOp::Insert => store.insert_batch(table, rows).await,
                    WriteOp::Update => store.update_batch(table, rows).await,
                }
            })
            .await;

            match result {
                Ok(()) => outcome.applied += batch.len(),
                Err(err) if err.is_transient() || matches!(err, StoreError::BatchShape(_)) => {
                    let category = category_of(&err);
                    warn!(
                        table = %table,
                        rows = batch.len(),
                        ?category,
                        error = %err,
                        "Batch failed"
                    );
                    outcome.extend(BatchOutcome::failed_all(table, &batch, category, &err.to_string()));
                }
                Err(err) if batch.len() == 1 => {
                    let reason = match &err {
                        StoreError::Rejected { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    warn!(table = %table, error = %err, "Record rejected by store");
                    outcome.extend(BatchOutcome::failed_all(
                        table,
                        &batch,
                        FailureCategory::Rejected,
                        &reason,
                    ));
                }
                Err(err) => {
                    debug!(
                        table = %table,
                        rows = batch.len(),
                        error = %err,
                        "Batch rejected; splitting to isolate offending rows"
                    );
                    let mut left = batch;
                    let right = left.split_off(left.len() / 2);
                    pending.push(right);
                    pending.push(left);
                }
            }
        }

        outcome
    }
}

fn category_of(err: &StoreError) -> FailureCategory {
    match err {
        StoreError::BatchShape(_) => FailureCategory::BatchShape,
        err if err.is_transient() => FailureCategory::Transient,
        _ => FailureCategory::Rejected,
    }
}

/// Group rows by key set, preserving order within each group
fn split_by_key_set(rows: &[PatchRow]) -> Vec<Vec<PatchRow>> {
    let mut groups: BTreeMap<BTreeSet<&str>, Vec<PatchRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(key_set(row)).or_default().push(row.clone());
    }
    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> PatchRow {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_split_by_key_set() {
        let rows = vec![
            row(json!({"source_record_id": "a:1", "tier": 1})),
            row(json!({"source_record_id": "a:2"})),
            row(json!({"source_record_id": "a:3", "tier": 2})),
        ];
        let groups = split_by_key_set(&rows);
        assert_eq!(groups.len(), 2);
        for group in &groups {
            assert!(ensure_uniform_keys(group).is_ok());
        }
        assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 3);
    }

    #[test]
    fn test_category_of() {
        assert_eq!(category_of(&StoreError::Transient("x".into())), FailureCategory::Transient);
        assert_eq!(category_of(&StoreError::BatchShape("x".into())), FailureCategory::BatchShape);
        assert_eq!(
            category_of(&StoreError::Rejected { key: None, reason: "x".into() }),
            FailureCategory::Rejected
        );
    }
}
