// Phase 2: proximity + attribute agreement
//
// A neighbor within the phase radius is accepted when capacities agree within
// tolerance or normalized names overlap enough. Attribute closeness is the
// capacity closeness when capacities agree, otherwise the name overlap.

use super::pair_score;
use super::similarity::{capacity_relative_diff, name_overlap};
use crate::types::{Attribute, CanonicalRecord};
use sitelink_common::config::MatcherConfig;

pub fn evaluate(
    config: &MatcherConfig,
    a: &CanonicalRecord,
    b: &CanonicalRecord,
    distance_m: f64,
) -> Option<f64> {
    let thresholds = &config.proximity;
    if distance_m > thresholds.radius_m {
        return None;
    }

    let capacity_diff = capacity_relative_diff(a.capacity_mw, b.capacity_mw)
        .filter(|diff| *diff <= thresholds.capacity_tolerance);
    let overlap = name_overlap(a.attribute(Attribute::Name), b.attribute(Attribute::Name))
        .filter(|overlap| *overlap >= thresholds.name_overlap_min);

    let closeness = match (capacity_diff, overlap) {
        (Some(diff), _) => 1.0 - diff / thresholds.capacity_tolerance,
        (None, Some(overlap)) => overlap,
        (None, None) => return None,
    };

    Some(pair_score(config, distance_m, thresholds.radius_m, closeness))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::haversine_m;
    use crate::types::{ProducerTier, RecordKey};

    fn record(producer: &str, id: &str, tier: u8) -> CanonicalRecord {
        CanonicalRecord::new(RecordKey::new(producer, id), ProducerTier::new(tier).unwrap())
    }

    #[test]
    fn test_capacity_agreement_accepts() {
        let a = record("eia", "fed_001", 1).with_location(40.0, -75.0).with_capacity(5.2);
        let b = record("city", "city_777", 3)
            .with_location(40.0008, -75.0009)
            .with_capacity(5.0);
        let d = haversine_m(a.location.unwrap(), b.location.unwrap());

        let score = evaluate(&MatcherConfig::default(), &a, &b, d).unwrap();
        assert!(score > 0.8, "close and agreeing pair should score high, got {score}");
    }

    #[test]
    fn test_capacity_disagreement_without_names_rejects() {
        let a = record("a", "1", 1).with_capacity(5.0);
        let b = record("b", "1", 2).with_capacity(50.0);
        assert_eq!(evaluate(&MatcherConfig::default(), &a, &b, 100.0), None);
    }

    #[test]
    fn test_name_overlap_rescues_capacity_disagreement() {
        let a = record("a", "1", 1)
            .with_capacity(5.0)
            .with_attribute(Attribute::Name, "Sunny Acres Solar");
        let b = record("b", "1", 2)
            .with_capacity(50.0)
            .with_attribute(Attribute::Name, "Sunny Acres PV LLC");
        let score = evaluate(&MatcherConfig::default(), &a, &b, 100.0).unwrap();
        assert!(score > 0.0);
    }

    #[test]
    fn test_nothing_comparable_rejects() {
        let a = record("a", "1", 1);
        let b = record("b", "1", 2);
        assert_eq!(evaluate(&MatcherConfig::default(), &a, &b, 10.0), None);
    }

    #[test]
    fn test_outside_radius_rejects() {
        let a = record("a", "1", 1).with_capacity(5.0);
        let b = record("b", "1", 2).with_capacity(5.0);
        assert_eq!(evaluate(&MatcherConfig::default(), &a, &b, 50_000.0), None);
    }
}
