//! SQLite datastore
//!
//! Entities and candidate assignments in two tables. Entity updates are
//! upserts whose SET clauses encode the field rules, so replaying a batch
//! (after a partial failure or a re-run) converges on the same row:
//!
//! - a field is written when it is unset or the incoming tier is strictly
//!   higher (lower rank)
//! - `location_precision` only rises
//! - `merged_into` is set once
//!
//! Candidate rows are full replacements.

use super::{
    ensure_uniform_keys, CandidateRow, Datastore, PatchRow, StoreSnapshot, Table,
};
use crate::crossref::CrossrefEntry;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    Attribute, Entity, GeoPoint, LocationPrecision, ProducerTier, RecordKey, Sourced,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{query::Query, Row, Sqlite, SqlitePool};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Keys per `IN (...)` lookup, below SQLite's bound-parameter limit
const KEY_LOOKUP_CHUNK: usize = 500;

#[derive(Debug, Clone)]
pub struct SqliteDatastore {
    pool: SqlitePool,
}

impl SqliteDatastore {
    /// Open (creating if needed) the database file and its tables
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        debug!("Connecting to database: {}", db_url);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        let store = Self { pool };
        store.init_tables().await?;
        info!("Opened datastore: {}", db_path.display());
        Ok(store)
    }

    /// Wrap an existing pool; tables are created if missing
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> StoreResult<()> {
        let mut attribute_columns = String::new();
        for attribute in Attribute::ALL {
            let column = attribute.as_str();
            attribute_columns.push_str(&format!(
                "{column} TEXT,\n{column}_source TEXT,\n{column}_tier INTEGER CHECK ({column}_tier IS NULL OR {column}_tier >= 1),\n"
            ));
        }

        let entities = format!(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                entity_id TEXT PRIMARY KEY,
                origin_record_id TEXT NOT NULL UNIQUE,
                merged_into TEXT,
                location_precision INTEGER CHECK (location_precision IS NULL OR location_precision BETWEEN 1 AND 6),
                lat REAL CHECK (lat IS NULL OR lat BETWEEN -90 AND 90),
                lon REAL CHECK (lon IS NULL OR lon BETWEEN -180 AND 180),
                location_source TEXT,
                location_tier INTEGER,
                capacity_mw REAL CHECK (capacity_mw IS NULL OR capacity_mw >= 0),
                capacity_source TEXT,
                capacity_tier INTEGER,
                {attribute_columns}
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#
        );
        sqlx::query(&entities).execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_record_id TEXT NOT NULL UNIQUE,
                producer TEXT NOT NULL,
                tier INTEGER NOT NULL CHECK (tier >= 1),
                entity_id TEXT NOT NULL,
                crossrefs TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_candidates_entity ON candidates(entity_id)")
            .execute(&self.pool)
            .await?;

        debug!("Datastore tables initialized (entities, candidates)");
        Ok(())
    }

    /// Columns of a uniform batch, validated against the table
    fn batch_columns(table: Table, rows: &[PatchRow]) -> StoreResult<Vec<String>> {
        ensure_uniform_keys(rows)?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Vec<String> = first.keys().cloned().collect();
        if let Some(unknown) = columns.iter().find(|c| !table.columns().contains(&c.as_str())) {
            return Err(StoreError::BatchShape(format!(
                "unknown column '{}' for {}",
                unknown, table
            )));
        }
        if !columns.iter().any(|c| c == table.key_column()) {
            return Err(StoreError::BatchShape(format!(
                "batch for {} lacks key column '{}'",
                table,
                table.key_column()
            )));
        }
        Ok(columns)
    }

    async fn write_batch(&self, table: Table, rows: &[PatchRow], sql: &str, columns: &[String]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::classify)?;
        for row in rows {
            let mut query = sqlx::query(sql);
            for column in columns {
                query = bind_value(query, row.get(column).unwrap_or(&Value::Null));
            }
            if let Err(err) = query.execute(&mut *tx).await {
                return Err(match StoreError::classify(err) {
                    StoreError::Rejected { reason, .. } => StoreError::Rejected {
                        key: table.row_key(row),
                        reason,
                    },
                    other => other,
                });
            }
        }
        tx.commit().await.map_err(StoreError::classify)?;
        Ok(())
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// SET clause for one upserted column
fn merge_assignment(table: Table, column: &str) -> Option<String> {
    if column == table.key_column() {
        return None;
    }
    let t = table.name();
    if table == Table::Candidates {
        return Some(format!("{column} = excluded.{column}"));
    }

    // Tier-governed groups: (value column used for the null check, tier column)
    let group = |value: &str, tier: &str| {
        format!(
            "{column} = CASE WHEN excluded.{value} IS NOT NULL AND ({t}.{value} IS NULL OR excluded.{tier} < {t}.{tier}) THEN excluded.{column} ELSE {t}.{column} END"
        )
    };

    let clause = match column {
        "origin_record_id" => return None,
        "merged_into" => format!("merged_into = COALESCE({t}.merged_into, excluded.merged_into)"),
        "location_precision" => format!(
            "location_precision = CASE WHEN {t}.location_precision IS NULL THEN excluded.location_precision \
             WHEN excluded.location_precision IS NULL THEN {t}.location_precision \
             ELSE MAX({t}.location_precision, excluded.location_precision) END"
        ),
        "lat" | "lon" | "location_source" | "location_tier" => group("lat", "location_tier"),
        "capacity_mw" | "capacity_source" | "capacity_tier" => group("capacity_mw", "capacity_tier"),
        other => {
            let base = other
                .strip_suffix("_source")
                .or_else(|| other.strip_suffix("_tier"))
                .unwrap_or(other);
            group(base, &format!("{base}_tier"))
        }
    };
    Some(clause)
}

#[async_trait]
impl Datastore for SqliteDatastore {
    async fn existing_keys(&self, table: Table, keys: &[String]) -> StoreResult<HashSet<String>> {
        let mut found = HashSet::new();
        for chunk in keys.chunks(KEY_LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {key} FROM {table} WHERE {key} IN ({placeholders})",
                key = table.key_column(),
                table = table.name(),
            );
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(key);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(StoreError::classify)?;
            for row in rows {
                found.insert(row.try_get::<String, _>(0).map_err(StoreError::classify)?);
            }
        }
        Ok(found)
    }

    async fn insert_batch(&self, table: Table, rows: &[PatchRow]) -> StoreResult<()> {
        let columns = Self::batch_columns(table, rows)?;
        if rows.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.name(),
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );
        self.write_batch(table, rows, &sql, &columns).await
    }

    async fn update_batch(&self, table: Table, rows: &[PatchRow]) -> StoreResult<()> {
        let columns = Self::batch_columns(table, rows)?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut assignments: Vec<String> = columns
            .iter()
            .filter_map(|c| merge_assignment(table, c))
            .collect();
        assignments.push("updated_at = CURRENT_TIMESTAMP".to_string());

        let sql = format!(
            "INSERT INTO {table} ({cols}) VALUES ({params}) ON CONFLICT({key}) DO UPDATE SET {set}",
            table = table.name(),
            cols = columns.join(", "),
            params = vec!["?"; columns.len()].join(", "),
            key = table.key_column(),
            set = assignments.join(",\n    "),
        );
        self.write_batch(table, rows, &sql, &columns).await
    }

    async fn load_snapshot(&self) -> StoreResult<StoreSnapshot> {
        let entity_rows = sqlx::query("SELECT * FROM entities")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::classify)?;
        let candidate_rows = sqlx::query(
            "SELECT source_record_id, tier, entity_id, crossrefs FROM candidates ORDER BY source_record_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::classify)?;

        let mut snapshot = StoreSnapshot::default();
        for row in &entity_rows {
            match decode_entity(row) {
                Ok(entity) => snapshot.entities.push(entity),
                Err(reason) => warn!(reason = %reason, "Skipping unreadable entity row"),
            }
        }
        for row in &candidate_rows {
            match decode_candidate(row) {
                Ok(candidate) => snapshot.candidates.push(candidate),
                Err(reason) => warn!(reason = %reason, "Skipping unreadable candidate row"),
            }
        }

        info!(
            entities = snapshot.entities.len(),
            candidates = snapshot.candidates.len(),
            "Loaded datastore snapshot"
        );
        Ok(snapshot)
    }
}

fn sourced<T>(
    row: &SqliteRow,
    value: Option<T>,
    prefix: &str,
) -> Result<Option<Sourced<T>>, String> {
    let Some(value) = value else {
        return Ok(None);
    };
    let source: Option<String> = row
        .try_get(format!("{prefix}_source").as_str())
        .map_err(|e| e.to_string())?;
    let tier: Option<i64> = row
        .try_get(format!("{prefix}_tier").as_str())
        .map_err(|e| e.to_string())?;
    let source = source
        .as_deref()
        .and_then(RecordKey::parse)
        .ok_or_else(|| format!("{prefix}: missing or invalid source"))?;
    let tier = tier
        .and_then(|t| u8::try_from(t).ok())
        .and_then(ProducerTier::new)
        .ok_or_else(|| format!("{prefix}: missing or invalid tier"))?;
    Ok(Some(Sourced::new(value, source, tier)))
}

fn decode_entity(row: &SqliteRow) -> Result<Entity, String> {
    let get_str = |column: &str| -> Result<Option<String>, String> {
        row.try_get(column).map_err(|e| e.to_string())
    };

    let entity_id = get_str("entity_id")?
        .and_then(|s| Uuid::parse_str(&s).ok())
        .ok_or("invalid entity_id")?;
    let origin = get_str("origin_record_id")?
        .as_deref()
        .and_then(RecordKey::parse)
        .ok_or("invalid origin_record_id")?;
    let merged_into = get_str("merged_into")?.and_then(|s| Uuid::parse_str(&s).ok());
    let precision: Option<i64> = row.try_get("location_precision").map_err(|e| e.to_string())?;

    let lat: Option<f64> = row.try_get("lat").map_err(|e| e.to_string())?;
    let lon: Option<f64> = row.try_get("lon").map_err(|e| e.to_string())?;
    let point = lat.zip(lon).map(|(lat, lon)| GeoPoint::new(lat, lon));
    let capacity: Option<f64> = row.try_get("capacity_mw").map_err(|e| e.to_string())?;

    let mut attributes = BTreeMap::new();
    for attribute in Attribute::ALL {
        let value = get_str(attribute.as_str())?;
        if let Some(s) = sourced(row, value, attribute.as_str())? {
            attributes.insert(attribute, s);
        }
    }

    Ok(Entity {
        entity_id,
        members: BTreeSet::new(),
        attributes,
        capacity: sourced(row, capacity, "capacity")?,
        location: sourced(row, point, "location")?,
        location_precision: precision.and_then(LocationPrecision::from_ordinal),
        merged_into,
        persisted: true,
        origin,
    })
}

fn decode_candidate(row: &SqliteRow) -> Result<CandidateRow, String> {
    let key: String = row.try_get("source_record_id").map_err(|e| e.to_string())?;
    let tier: i64 = row.try_get("tier").map_err(|e| e.to_string())?;
    let entity_id: String = row.try_get("entity_id").map_err(|e| e.to_string())?;
    let crossrefs: String = row.try_get("crossrefs").map_err(|e| e.to_string())?;

    Ok(CandidateRow {
        key: RecordKey::parse(&key).ok_or_else(|| format!("invalid record key {key}"))?,
        tier: u8::try_from(tier)
            .ok()
            .and_then(ProducerTier::new)
            .ok_or_else(|| format!("{key}: invalid tier {tier}"))?,
        entity_id: Uuid::parse_str(&entity_id).map_err(|e| format!("{key}: {e}"))?,
        crossrefs: serde_json::from_str::<Vec<CrossrefEntry>>(&crossrefs)
            .map_err(|e| format!("{key}: crossrefs: {e}"))?,
    })
}
