//! Core data model
//!
//! A [`CanonicalRecord`] is one producer's view of one site. An [`Entity`] is
//! the merged view of a physical site, each attribute tagged with the record
//! (and tier) that supplied it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Namespace for deterministic entity ids (UUID v5 of the origin record key)
const ENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c4a_9b37_4e80_a5c1_3d8e_f0b2_7a19);

/// Globally unique candidate key: `<producer>:<record_id>`
///
/// `record_id` is only unique inside its producer's namespace, so the
/// producer is part of the key everywhere the engine stores or compares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey {
    producer: String,
    record_id: String,
}

impl RecordKey {
    pub fn new(producer: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            record_id: record_id.into(),
        }
    }

    /// Parse the `<producer>:<record_id>` form. The producer may not contain
    /// ':'; the record id may.
    pub fn parse(s: &str) -> Option<Self> {
        let (producer, record_id) = s.split_once(':')?;
        if producer.is_empty() || record_id.is_empty() {
            return None;
        }
        Some(Self::new(producer, record_id))
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer, self.record_id)
    }
}

impl TryFrom<String> for RecordKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid record key: {value}"))
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.to_string()
    }
}

/// Producer precedence rank. Rank 1 outranks rank 2, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerTier(u8);

impl ProducerTier {
    /// Rank 0 is reserved; returns None for it
    pub fn new(rank: u8) -> Option<Self> {
        (rank >= 1).then_some(Self(rank))
    }

    pub fn rank(self) -> u8 {
        self.0
    }

    /// Strictly higher precedence than `other`
    pub fn outranks(self, other: ProducerTier) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for ProducerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.0)
    }
}

/// Positional confidence, ordered coarse → fine (`Exact` is the maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationPrecision {
    State,
    County,
    Zip,
    City,
    Address,
    Exact,
}

impl LocationPrecision {
    /// Stored ordinal; 0 is reserved for "unknown"
    pub fn ordinal(self) -> i64 {
        match self {
            LocationPrecision::State => 1,
            LocationPrecision::County => 2,
            LocationPrecision::Zip => 3,
            LocationPrecision::City => 4,
            LocationPrecision::Address => 5,
            LocationPrecision::Exact => 6,
        }
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        match value {
            1 => Some(LocationPrecision::State),
            2 => Some(LocationPrecision::County),
            3 => Some(LocationPrecision::Zip),
            4 => Some(LocationPrecision::City),
            5 => Some(LocationPrecision::Address),
            6 => Some(LocationPrecision::Exact),
            _ => None,
        }
    }
}

/// WGS84 coordinate pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Whether a reported capacity is AC or DC nameplate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityBasis {
    Ac,
    Dc,
}

/// Independently sourced text attributes of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Attribute {
    Name,
    Address,
    Owner,
    Operator,
    Developer,
    Installer,
}

impl Attribute {
    pub const ALL: [Attribute; 6] = [
        Attribute::Name,
        Attribute::Address,
        Attribute::Owner,
        Attribute::Operator,
        Attribute::Developer,
        Attribute::Installer,
    ];

    /// Column / payload key
    pub fn as_str(self) -> &'static str {
        match self {
            Attribute::Name => "name",
            Attribute::Address => "address",
            Attribute::Owner => "owner",
            Attribute::Operator => "operator",
            Attribute::Developer => "developer",
            Attribute::Installer => "installer",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One producer's view of one site, after boundary validation
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub key: RecordKey,
    pub tier: ProducerTier,
    pub location: Option<GeoPoint>,
    pub location_precision: Option<LocationPrecision>,
    pub capacity_mw: Option<f64>,
    pub capacity_basis: Option<CapacityBasis>,
    pub attributes: BTreeMap<Attribute, String>,
    /// Foreign identifiers, namespace → value
    pub external_ids: BTreeMap<String, String>,
    pub reported_at: Option<DateTime<Utc>>,
}

impl CanonicalRecord {
    /// Bare record with only a key and tier
    pub fn new(key: RecordKey, tier: ProducerTier) -> Self {
        Self {
            key,
            tier,
            location: None,
            location_precision: None,
            capacity_mw: None,
            capacity_basis: None,
            attributes: BTreeMap::new(),
            external_ids: BTreeMap::new(),
            reported_at: None,
        }
    }

    pub fn with_location(mut self, lat: f64, lon: f64) -> Self {
        self.location = Some(GeoPoint::new(lat, lon));
        self
    }

    pub fn with_precision(mut self, precision: LocationPrecision) -> Self {
        self.location_precision = Some(precision);
        self
    }

    pub fn with_capacity(mut self, capacity_mw: f64) -> Self {
        self.capacity_mw = Some(capacity_mw);
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute, value: impl Into<String>) -> Self {
        self.attributes.insert(attribute, value.into());
        self
    }

    pub fn with_external_id(mut self, namespace: impl Into<String>, value: impl Into<String>) -> Self {
        self.external_ids.insert(namespace.into(), value.into());
        self
    }

    pub fn attribute(&self, attribute: Attribute) -> Option<&str> {
        self.attributes.get(&attribute).map(String::as_str)
    }
}

/// A value tagged with the record and tier that supplied it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: RecordKey,
    pub tier: ProducerTier,
}

impl<T> Sourced<T> {
    pub fn new(value: T, source: RecordKey, tier: ProducerTier) -> Self {
        Self {
            value,
            source,
            tier,
        }
    }
}

/// Resolved, merged view of one physical site
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub entity_id: Uuid,
    /// Record whose first sighting created this entity
    pub origin: RecordKey,
    pub members: BTreeSet<RecordKey>,
    pub attributes: BTreeMap<Attribute, Sourced<String>>,
    pub capacity: Option<Sourced<f64>>,
    pub location: Option<Sourced<GeoPoint>>,
    pub location_precision: Option<LocationPrecision>,
    /// Set when this entity was absorbed into another
    pub merged_into: Option<Uuid>,
    /// Known to the datastore before this run
    pub persisted: bool,
}

impl Entity {
    /// Deterministic id for an entity first seen through `origin`
    pub fn id_for(origin: &RecordKey) -> Uuid {
        Uuid::new_v5(&ENTITY_NAMESPACE, origin.to_string().as_bytes())
    }

    /// New entity seeded from a single record
    pub fn from_record(record: &CanonicalRecord) -> Self {
        let source = record.key.clone();
        let tier = record.tier;

        let attributes = record
            .attributes
            .iter()
            .map(|(attribute, value)| {
                (*attribute, Sourced::new(value.clone(), source.clone(), tier))
            })
            .collect();

        Self {
            entity_id: Self::id_for(&record.key),
            origin: record.key.clone(),
            members: BTreeSet::from([record.key.clone()]),
            attributes,
            capacity: record
                .capacity_mw
                .map(|c| Sourced::new(c, source.clone(), tier)),
            location: record
                .location
                .map(|p| Sourced::new(p, source.clone(), tier)),
            location_precision: record.location.and(record.location_precision),
            merged_into: None,
            persisted: false,
        }
    }

    pub fn attribute(&self, attribute: Attribute) -> Option<&str> {
        self.attributes.get(&attribute).map(|s| s.value.as_str())
    }

    pub fn capacity_mw(&self) -> Option<f64> {
        self.capacity.as_ref().map(|c| c.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_parse_and_display() {
        let key = RecordKey::parse("eia:plant:001").unwrap();
        assert_eq!(key.producer(), "eia");
        assert_eq!(key.record_id(), "plant:001");
        assert_eq!(key.to_string(), "eia:plant:001");

        assert!(RecordKey::parse("no-separator").is_none());
        assert!(RecordKey::parse(":missing-producer").is_none());
        assert!(RecordKey::parse("missing-id:").is_none());
    }

    #[test]
    fn test_record_key_serde_as_string() {
        let key = RecordKey::new("city", "777");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"city:777\"");
        let back: RecordKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_tier_outranks_is_strict() {
        let t1 = ProducerTier::new(1).unwrap();
        let t3 = ProducerTier::new(3).unwrap();
        assert!(t1.outranks(t3));
        assert!(!t3.outranks(t1));
        assert!(!t1.outranks(t1));
        assert!(ProducerTier::new(0).is_none());
    }

    #[test]
    fn test_precision_order_and_ordinals() {
        assert!(LocationPrecision::Exact > LocationPrecision::Address);
        assert!(LocationPrecision::Address > LocationPrecision::City);
        assert!(LocationPrecision::Zip > LocationPrecision::County);
        assert!(LocationPrecision::County > LocationPrecision::State);
        for p in [
            LocationPrecision::State,
            LocationPrecision::Zip,
            LocationPrecision::Exact,
        ] {
            assert_eq!(LocationPrecision::from_ordinal(p.ordinal()), Some(p));
        }
        assert_eq!(LocationPrecision::from_ordinal(0), None);
    }

    #[test]
    fn test_entity_id_is_deterministic() {
        let key = RecordKey::new("eia", "fed_001");
        assert_eq!(Entity::id_for(&key), Entity::id_for(&key.clone()));
        assert_ne!(Entity::id_for(&key), Entity::id_for(&RecordKey::new("eia", "fed_002")));
    }

    #[test]
    fn test_entity_from_record_tags_sources() {
        let record = CanonicalRecord::new(RecordKey::new("city", "777"), ProducerTier::new(3).unwrap())
            .with_location(40.0, -75.0)
            .with_capacity(5.0)
            .with_attribute(Attribute::Owner, "Acme Solar LLC");

        let entity = Entity::from_record(&record);
        assert_eq!(entity.origin, record.key);
        assert_eq!(entity.attribute(Attribute::Owner), Some("Acme Solar LLC"));
        assert_eq!(entity.attributes[&Attribute::Owner].source, record.key);
        assert_eq!(entity.capacity_mw(), Some(5.0));
        // Precision is unknown unless the producer says so
        assert_eq!(entity.location_precision, None);
        assert!(entity.members.contains(&record.key));
    }
}
