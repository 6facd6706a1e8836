//! Test Helper Utilities
//!
//! Shared utilities for sitelink-engine integration tests

#![allow(dead_code)]

pub mod db_utils;
pub mod faulty_store;

pub use db_utils::{create_test_store, load_entity_of, load_candidate};
pub use faulty_store::FaultyStore;

use sitelink_common::config::ApplierConfig;
use sitelink_common::EngineConfig;
use sitelink_engine::ingest::{IngestBatch, IngestStats};
use sitelink_engine::{CanonicalRecord, ProducerTier, RecordKey};

/// Record with a key and tier
pub fn record(producer: &str, id: &str, tier: u8) -> CanonicalRecord {
    CanonicalRecord::new(RecordKey::new(producer, id), ProducerTier::new(tier).unwrap())
}

/// Record with coordinates and capacity
pub fn site(producer: &str, id: &str, tier: u8, lat: f64, lon: f64, capacity_mw: f64) -> CanonicalRecord {
    record(producer, id, tier)
        .with_location(lat, lon)
        .with_capacity(capacity_mw)
}

/// Wrap records as an already-validated ingest batch
pub fn batch(mut records: Vec<CanonicalRecord>) -> IngestBatch {
    records.sort_by(|a, b| a.key.cmp(&b.key));
    let stats = IngestStats {
        accepted: records.len(),
        ..IngestStats::default()
    };
    IngestBatch { records, stats }
}

/// Defaults with millisecond backoff so failure paths stay fast
pub fn test_config() -> EngineConfig {
    EngineConfig {
        applier: ApplierConfig {
            batch_size: 4,
            concurrency: 2,
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
        },
        ..EngineConfig::default()
    }
}
