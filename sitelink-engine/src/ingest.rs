//! Candidate ingest boundary
//!
//! Producer adapters emit one JSON document per candidate (JSON lines). This
//! module validates those documents into [`CanonicalRecord`]s. Malformed
//! candidates are never fatal: each is dropped, logged and counted by reason.

use crate::error::IngestError;
use crate::types::{
    Attribute, CanonicalRecord, CapacityBasis, GeoPoint, LocationPrecision, ProducerTier,
    RecordKey,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sitelink_common::TierTable;
use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use tracing::{debug, info, warn};

/// Candidate document as emitted by a producer adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source_record_id: Option<String>,
    pub producer: Option<String>,
    pub producer_tier: Option<u8>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub location_precision: Option<LocationPrecision>,
    pub capacity_mw: Option<f64>,
    pub capacity_basis: Option<CapacityBasis>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub owner: Option<String>,
    pub operator: Option<String>,
    pub developer: Option<String>,
    pub installer: Option<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
    pub reported_at: Option<DateTime<Utc>>,
}

impl RawCandidate {
    fn attribute(&self, attribute: Attribute) -> Option<&String> {
        match attribute {
            Attribute::Name => self.name.as_ref(),
            Attribute::Address => self.address.as_ref(),
            Attribute::Owner => self.owner.as_ref(),
            Attribute::Operator => self.operator.as_ref(),
            Attribute::Developer => self.developer.as_ref(),
            Attribute::Installer => self.installer.as_ref(),
        }
    }
}

/// Ingest counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestStats {
    /// Distinct records accepted
    pub accepted: usize,
    /// Records that replaced an earlier document with the same key
    pub replaced: usize,
    /// Dropped documents by reason
    pub skipped: BTreeMap<IngestError, usize>,
}

impl IngestStats {
    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }

    fn skip(&mut self, reason: IngestError) {
        *self.skipped.entry(reason).or_default() += 1;
    }
}

/// Validated records of one ingest run, sorted by key
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub records: Vec<CanonicalRecord>,
    pub stats: IngestStats,
}

/// Validates raw candidates against the tier table
pub struct Ingestor<'a> {
    tiers: &'a TierTable,
    default_tier: Option<u8>,
}

impl<'a> Ingestor<'a> {
    pub fn new(tiers: &'a TierTable, default_tier: Option<u8>) -> Self {
        Self {
            tiers,
            default_tier,
        }
    }

    /// Validate one candidate
    pub fn validate(&self, raw: &RawCandidate) -> Result<CanonicalRecord, IngestError> {
        let record_id = non_blank(raw.source_record_id.as_ref()).ok_or(IngestError::MissingKey)?;
        let producer = non_blank(raw.producer.as_ref()).ok_or(IngestError::InvalidProducer)?;
        if producer.contains(':') {
            return Err(IngestError::InvalidProducer);
        }

        // Injected table wins over what the producer claims about itself
        let configured = self.tiers.rank_for(&producer);
        if let (Some(configured), Some(supplied)) = (configured, raw.producer_tier) {
            if configured != supplied {
                debug!(
                    producer = %producer,
                    configured,
                    supplied,
                    "Supplied producer tier overridden by tier table"
                );
            }
        }
        let tier = configured
            .or(raw.producer_tier)
            .or(self.default_tier)
            .and_then(ProducerTier::new)
            .ok_or(IngestError::MissingTier)?;

        let location = match (raw.lat, raw.lon) {
            (None, None) => None,
            (Some(lat), Some(lon)) => {
                let point = GeoPoint::new(lat, lon);
                if !point.is_valid() {
                    return Err(IngestError::CoordinatesOutOfRange);
                }
                Some(point)
            }
            _ => return Err(IngestError::CoordinatesOutOfRange),
        };

        if let Some(capacity) = raw.capacity_mw {
            if !capacity.is_finite() || capacity < 0.0 {
                return Err(IngestError::NonFiniteNumber);
            }
        }

        let mut record = CanonicalRecord::new(RecordKey::new(producer, record_id), tier);
        record.location = location;
        record.location_precision = location.and(raw.location_precision);
        record.capacity_mw = raw.capacity_mw;
        record.capacity_basis = raw.capacity_basis;
        record.reported_at = raw.reported_at;

        for attribute in Attribute::ALL {
            if let Some(value) = non_blank(raw.attribute(attribute)) {
                record.attributes.insert(attribute, value);
            }
        }
        for (namespace, value) in &raw.external_ids {
            if let (Some(ns), Some(v)) = (non_blank(Some(namespace)), non_blank(Some(value))) {
                record.external_ids.insert(ns, v);
            }
        }

        Ok(record)
    }

    /// Validate a set of candidates. A later document with the same key
    /// replaces an earlier one.
    pub fn ingest(&self, raws: impl IntoIterator<Item = RawCandidate>) -> IngestBatch {
        let mut stats = IngestStats::default();
        let mut by_key: HashMap<RecordKey, CanonicalRecord> = HashMap::new();

        for raw in raws {
            match self.validate(&raw) {
                Ok(record) => {
                    if by_key.insert(record.key.clone(), record).is_some() {
                        stats.replaced += 1;
                    }
                }
                Err(reason) => {
                    warn!(
                        source_record_id = ?raw.source_record_id,
                        producer = ?raw.producer,
                        reason = %reason,
                        "Skipping malformed candidate"
                    );
                    stats.skip(reason);
                }
            }
        }

        let mut records: Vec<CanonicalRecord> = by_key.into_values().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        stats.accepted = records.len();

        info!(
            accepted = stats.accepted,
            replaced = stats.replaced,
            skipped = stats.total_skipped(),
            "Ingest complete"
        );

        IngestBatch { records, stats }
    }

    /// Read JSON lines and ingest them. Blank lines are ignored; lines that
    /// are not UTF-8 or do not parse are counted as `Unparseable`. Only a
    /// failing reader is an error.
    pub fn ingest_jsonl(&self, reader: impl BufRead) -> std::io::Result<IngestBatch> {
        self.ingest_jsonl_sources([reader])
    }

    /// Ingest several JSON-lines sources as one run, so a key re-emitted in
    /// a later source replaces the earlier document
    pub fn ingest_jsonl_sources<R: BufRead>(
        &self,
        readers: impl IntoIterator<Item = R>,
    ) -> std::io::Result<IngestBatch> {
        let mut raws = Vec::new();
        let mut unparseable = 0usize;

        for (source, reader) in readers.into_iter().enumerate() {
            for (index, bytes) in reader.split(b'\n').enumerate() {
                let bytes = bytes?;
                let line = match std::str::from_utf8(&bytes) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(source, line = index + 1, error = %e, "Skipping candidate line with invalid UTF-8");
                        unparseable += 1;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawCandidate>(line) {
                    Ok(raw) => raws.push(raw),
                    Err(e) => {
                        warn!(source, line = index + 1, error = %e, "Skipping unparseable candidate line");
                        unparseable += 1;
                    }
                }
            }
        }

        let mut batch = self.ingest(raws);
        if unparseable > 0 {
            batch.stats.skipped.insert(IngestError::Unparseable, unparseable);
        }
        Ok(batch)
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
