//! In-memory datastore with injectable failures

use async_trait::async_trait;
use sitelink_engine::store::{ensure_uniform_keys, Datastore, PatchRow, StoreSnapshot, Table};
use sitelink_engine::{StoreError, StoreResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct FaultyStore {
    tables: Mutex<HashMap<Table, BTreeMap<String, PatchRow>>>,
    /// Writes left to fail transiently
    transient_failures: AtomicU32,
    always_transient: AtomicBool,
    reject_keys: Mutex<HashSet<String>>,
    pub write_calls: AtomicUsize,
    pub rows_inserted: AtomicUsize,
    pub rows_updated: AtomicUsize,
    /// Key sets of every batch that reached a write
    pub batch_shapes: Mutex<Vec<Vec<String>>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with a transient error
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every write with a transient error
    pub fn always_transient(self) -> Self {
        self.always_transient.store(true, Ordering::SeqCst);
        self
    }

    /// Refuse any batch containing one of these keys
    pub fn rejecting(self, keys: &[&str]) -> Self {
        self.reject_keys
            .lock()
            .unwrap()
            .extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn seed(&self, table: Table, rows: Vec<PatchRow>) {
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table).or_default();
        for row in rows {
            let key = table.row_key(&row).unwrap();
            stored.insert(key, row);
        }
    }

    pub fn rows(&self, table: Table) -> BTreeMap<String, PatchRow> {
        self.tables
            .lock()
            .unwrap()
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    fn before_write(&self, table: Table, rows: &[PatchRow]) -> StoreResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        ensure_uniform_keys(rows)?;
        if let Some(first) = rows.first() {
            self.batch_shapes
                .lock()
                .unwrap()
                .push(first.keys().cloned().collect());
        }

        if self.always_transient.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("connection reset".into()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Transient("database is locked".into()));
        }

        let reject = self.reject_keys.lock().unwrap();
        for row in rows {
            if let Some(key) = table.row_key(row) {
                if reject.contains(&key) {
                    return Err(StoreError::Rejected {
                        key: Some(key),
                        reason: "CHECK constraint failed".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for FaultyStore {
    async fn existing_keys(&self, table: Table, keys: &[String]) -> StoreResult<HashSet<String>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(&table)
            .map(|stored| {
                keys.iter()
                    .filter(|k| stored.contains_key(*k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_batch(&self, table: Table, rows: &[PatchRow]) -> StoreResult<()> {
        self.before_write(table, rows)?;
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table).or_default();
        for row in rows {
            let key = table.row_key(row).unwrap_or_default();
            if stored.contains_key(&key) {
                return Err(StoreError::Rejected {
                    key: Some(key),
                    reason: "UNIQUE constraint failed".into(),
                });
            }
        }
        for row in rows {
            stored.insert(table.row_key(row).unwrap_or_default(), row.clone());
        }
        self.rows_inserted.fetch_add(rows.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn update_batch(&self, table: Table, rows: &[PatchRow]) -> StoreResult<()> {
        self.before_write(table, rows)?;
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table).or_default();
        for row in rows {
            stored.insert(table.row_key(row).unwrap_or_default(), row.clone());
        }
        self.rows_updated.fetch_add(rows.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn load_snapshot(&self) -> StoreResult<StoreSnapshot> {
        Ok(StoreSnapshot::default())
    }
}
