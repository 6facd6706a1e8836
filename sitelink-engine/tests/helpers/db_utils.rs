//! Datastore Test Utilities

use sitelink_engine::store::{CandidateRow, Datastore};
use sitelink_engine::{Entity, RecordKey, SqliteDatastore};
use std::sync::Arc;
use tempfile::TempDir;

/// Create a temporary SQLite datastore
///
/// Returns (TempDir, store) - TempDir must be kept alive for duration of test
pub async fn create_test_store() -> (TempDir, Arc<SqliteDatastore>) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test_sitelink.db");
    let store = SqliteDatastore::open(&db_path).await.unwrap();
    (temp_dir, Arc::new(store))
}

/// Persisted candidate row for `key`
pub async fn load_candidate(store: &SqliteDatastore, key: &RecordKey) -> Option<CandidateRow> {
    let snapshot = store.load_snapshot().await.unwrap();
    snapshot.candidates.into_iter().find(|c| &c.key == key)
}

/// Persisted entity the candidate `key` is assigned to
pub async fn load_entity_of(store: &SqliteDatastore, key: &RecordKey) -> Option<Entity> {
    let candidate = load_candidate(store, key).await?;
    let snapshot = store.load_snapshot().await.unwrap();
    snapshot
        .entities
        .into_iter()
        .find(|e| e.entity_id == candidate.entity_id)
}
