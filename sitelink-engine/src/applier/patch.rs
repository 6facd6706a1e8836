// Entity and candidate state rendered as patch rows
//
// Every row of a table is rendered with the full column list, unset fields
// as explicit nulls, so batches are uniform by construction.

use crate::store::{CandidateRow, PatchRow, Table};
use crate::types::{Attribute, Entity, Sourced};
use serde_json::{json, Value};

/// Rows for one table, in write order
#[derive(Debug, Clone, Default)]
pub struct PatchSet {
    pub entities: Vec<PatchRow>,
    pub candidates: Vec<PatchRow>,
}

impl PatchSet {
    pub fn rows(&self, table: Table) -> &[PatchRow] {
        match table {
            Table::Entities => &self.entities,
            Table::Candidates => &self.candidates,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sourced_parts<T>(sourced: Option<&Sourced<T>>, value: impl Fn(&T) -> Value) -> (Value, Value, Value) {
    match sourced {
        Some(s) => (
            value(&s.value),
            Value::String(s.source.to_string()),
            json!(s.tier.rank()),
        ),
        None => (Value::Null, Value::Null, Value::Null),
    }
}

/// Full entity row
pub fn entity_row(entity: &Entity) -> PatchRow {
    let mut row = PatchRow::new();
    row.insert("entity_id".into(), Value::String(entity.entity_id.to_string()));
    row.insert("origin_record_id".into(), Value::String(entity.origin.to_string()));
    row.insert(
        "merged_into".into(),
        entity
            .merged_into
            .map_or(Value::Null, |id| Value::String(id.to_string())),
    );
    row.insert(
        "location_precision".into(),
        entity
            .location_precision
            .map_or(Value::Null, |p| json!(p.ordinal())),
    );

    let (lat, source, tier) = sourced_parts(entity.location.as_ref(), |p| json!(p.lat));
    let lon = entity
        .location
        .as_ref()
        .map_or(Value::Null, |p| json!(p.value.lon));
    row.insert("lat".into(), lat);
    row.insert("lon".into(), lon);
    row.insert("location_source".into(), source);
    row.insert("location_tier".into(), tier);

    let (capacity, source, tier) = sourced_parts(entity.capacity.as_ref(), |c| json!(c));
    row.insert("capacity_mw".into(), capacity);
    row.insert("capacity_source".into(), source);
    row.insert("capacity_tier".into(), tier);

    for attribute in Attribute::ALL {
        let (value, source, tier) =
            sourced_parts(entity.attributes.get(&attribute), |v| Value::String(v.clone()));
        let column = attribute.as_str();
        row.insert(column.to_string(), value);
        row.insert(format!("{column}_source"), source);
        row.insert(format!("{column}_tier"), tier);
    }

    row
}

/// Full candidate row; crossrefs stored as a JSON array
pub fn candidate_row(candidate: &CandidateRow) -> PatchRow {
    let crossrefs = serde_json::to_string(&candidate.crossrefs).unwrap_or_else(|_| "[]".to_string());
    let mut row = PatchRow::new();
    row.insert(
        "source_record_id".into(),
        Value::String(candidate.key.to_string()),
    );
    row.insert(
        "producer".into(),
        Value::String(candidate.key.producer().to_string()),
    );
    row.insert("tier".into(), json!(candidate.tier.rank()));
    row.insert(
        "entity_id".into(),
        Value::String(candidate.entity_id.to_string()),
    );
    row.insert("crossrefs".into(), Value::String(crossrefs));
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossref::CrossrefEntry;
    use crate::store::{ensure_uniform_keys, ENTITY_COLUMNS, CANDIDATE_COLUMNS};
    use crate::types::{CanonicalRecord, ProducerTier, RecordKey};
    use std::collections::BTreeSet;

    #[test]
    fn test_entity_rows_uniform_and_complete() {
        let sparse = Entity::from_record(&CanonicalRecord::new(
            RecordKey::new("city", "1"),
            ProducerTier::new(3).unwrap(),
        ));
        let full = Entity::from_record(
            &CanonicalRecord::new(RecordKey::new("eia", "1"), ProducerTier::new(1).unwrap())
                .with_location(40.0, -75.0)
                .with_capacity(5.2)
                .with_attribute(Attribute::Owner, "Acme"),
        );

        let rows = vec![entity_row(&sparse), entity_row(&full)];
        ensure_uniform_keys(&rows).unwrap();

        let keys: BTreeSet<&str> = rows[0].keys().map(String::as_str).collect();
        let expected: BTreeSet<&str> = ENTITY_COLUMNS.iter().copied().collect();
        assert_eq!(keys, expected);

        assert_eq!(rows[0]["owner"], Value::Null);
        assert_eq!(rows[1]["owner"], json!("Acme"));
        assert_eq!(rows[1]["owner_source"], json!("eia:1"));
        assert_eq!(rows[1]["capacity_tier"], json!(1));
        assert_eq!(rows[1]["lon"], json!(-75.0));
    }

    #[test]
    fn test_candidate_row() {
        let row = candidate_row(&CandidateRow {
            key: RecordKey::new("city", "777"),
            tier: ProducerTier::new(3).unwrap(),
            entity_id: uuid::Uuid::nil(),
            crossrefs: vec![CrossrefEntry {
                id: RecordKey::new("eia", "fed_001"),
                score: 0.9,
            }],
        });
        let keys: BTreeSet<&str> = row.keys().map(String::as_str).collect();
        let expected: BTreeSet<&str> = CANDIDATE_COLUMNS.iter().copied().collect();
        assert_eq!(keys, expected);
        assert_eq!(row["producer"], json!("city"));
        assert_eq!(
            row["crossrefs"],
            json!(r#"[{"id":"eia:fed_001","score":0.9}]"#)
        );
    }
}
