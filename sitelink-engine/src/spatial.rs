//! Grid-bucket spatial index
//!
//! Partitions the plane into fixed-size lat/lon cells. A radius query visits
//! only the cells that can hold a hit (the 3×3 neighborhood when the radius
//! does not exceed the cell edge), drops points outside the bounding box and
//! keeps those within exact great-circle distance.

use crate::types::{CanonicalRecord, GeoPoint};
use std::collections::HashMap;

/// Mean Earth radius (IUGG) in metres
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Cell coordinates: (lat index, lon index)
pub type CellId = (i32, i32);

/// Great-circle distance in metres
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// A query hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: usize,
    pub distance_m: f64,
}

/// Cell-bucketed point index. Ids are caller-defined (record positions).
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    cell_deg: f64,
    cells: HashMap<CellId, Vec<usize>>,
    points: HashMap<usize, GeoPoint>,
}

impl SpatialIndex {
    pub fn new(cell_km: f64) -> Self {
        Self {
            cell_deg: cell_km * 1_000.0 / METERS_PER_DEGREE_LAT,
            cells: HashMap::new(),
            points: HashMap::new(),
        }
    }

    /// Index every record that has coordinates, keyed by its slice position
    pub fn build(records: &[CanonicalRecord], cell_km: f64) -> Self {
        let mut index = Self::new(cell_km);
        for (id, record) in records.iter().enumerate() {
            if let Some(point) = record.location {
                index.insert(id, point);
            }
        }
        index
    }

    pub fn insert(&mut self, id: usize, point: GeoPoint) {
        if let Some(previous) = self.points.insert(id, point) {
            let old_cell = self.cell_of(previous);
            if let Some(bucket) = self.cells.get_mut(&old_cell) {
                bucket.retain(|&other| other != id);
            }
        }
        let cell = self.cell_of(point);
        self.cells.entry(cell).or_default().push(id);
    }

    pub fn cell_of(&self, point: GeoPoint) -> CellId {
        (
            (point.lat / self.cell_deg).floor() as i32,
            (point.lon / self.cell_deg).floor() as i32,
        )
    }

    pub fn point(&self, id: usize) -> Option<GeoPoint> {
        self.points.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Non-empty cells and their members
    pub fn cells(&self) -> impl Iterator<Item = (&CellId, &Vec<usize>)> {
        self.cells.iter().filter(|(_, ids)| !ids.is_empty())
    }

    /// All indexed ids within `radius_m` of `center`, nearest first (ties by id)
    pub fn query(&self, center: GeoPoint, radius_m: f64) -> Vec<Neighbor> {
        let lat_span = radius_m / METERS_PER_DEGREE_LAT;
        let lon_span = radius_m / (METERS_PER_DEGREE_LAT * center.lat.to_radians().cos().max(0.01));

        let lat_rings = (lat_span / self.cell_deg).ceil().max(1.0) as i32;
        let lon_rings = (lon_span / self.cell_deg).ceil().max(1.0) as i32;
        let (cy, cx) = self.cell_of(center);

        let mut hits = Vec::new();
        for y in (cy - lat_rings)..=(cy + lat_rings) {
            for x in (cx - lon_rings)..=(cx + lon_rings) {
                let Some(bucket) = self.cells.get(&(y, x)) else {
                    continue;
                };
                for &id in bucket {
                    let Some(point) = self.points.get(&id).copied() else {
                        continue;
                    };
                    // Bounding-box pre-filter before the trig
                    if (point.lat - center.lat).abs() > lat_span
                        || (point.lon - center.lon).abs() > lon_span
                    {
                        continue;
                    }
                    let distance_m = haversine_m(center, point);
                    if distance_m <= radius_m {
                        hits.push(Neighbor { id, distance_m });
                    }
                }
            }
        }

        hits.sort_by(|a, b| {
            a.distance_m
                .partial_cmp(&b.distance_m)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.2 km
        let d = haversine_m(GeoPoint::new(40.0, -75.0), GeoPoint::new(41.0, -75.0));
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
        assert_eq!(haversine_m(GeoPoint::new(1.0, 2.0), GeoPoint::new(1.0, 2.0)), 0.0);
    }

    #[test]
    fn test_query_finds_close_points_only() {
        let mut index = SpatialIndex::new(2.5);
        index.insert(0, GeoPoint::new(40.0, -75.0));
        index.insert(1, GeoPoint::new(40.0008, -75.0009));
        index.insert(2, GeoPoint::new(40.45, -75.0)); // ~50 km north

        let hits = index.query(GeoPoint::new(40.0, -75.0), 2_000.0);
        let ids: Vec<usize> = hits.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!(hits[1].distance_m > 100.0 && hits[1].distance_m < 140.0);
    }

    #[test]
    fn test_query_crosses_cell_boundaries() {
        let index_km = 2.5;
        let mut index = SpatialIndex::new(index_km);
        let cell_deg = index_km * 1_000.0 / 111_320.0;
        // Two points straddling a cell edge, ~200 m apart
        let a = GeoPoint::new(cell_deg * 10.0 - 0.0009, -75.0);
        let b = GeoPoint::new(cell_deg * 10.0 + 0.0009, -75.0);
        index.insert(0, a);
        index.insert(1, b);
        assert_ne!(index.cell_of(a), index.cell_of(b));

        let hits = index.query(a, 500.0);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_radius_larger_than_cell_visits_more_rings() {
        let mut index = SpatialIndex::new(1.0);
        index.insert(0, GeoPoint::new(10.0, 10.0));
        index.insert(1, GeoPoint::new(10.03, 10.0)); // ~3.3 km
        let hits = index.query(GeoPoint::new(10.0, 10.0), 5_000.0);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_reinsert_moves_point() {
        let mut index = SpatialIndex::new(2.5);
        index.insert(7, GeoPoint::new(0.0, 0.0));
        index.insert(7, GeoPoint::new(5.0, 5.0));
        assert_eq!(index.len(), 1);
        assert!(index.query(GeoPoint::new(0.0, 0.0), 1_000.0).is_empty());
        assert_eq!(index.query(GeoPoint::new(5.0, 5.0), 1_000.0).len(), 1);
    }

    #[test]
    fn test_build_skips_records_without_location() {
        use crate::types::{ProducerTier, RecordKey};
        let tier = ProducerTier::new(1).unwrap();
        let records = vec![
            CanonicalRecord::new(RecordKey::new("a", "1"), tier).with_location(1.0, 1.0),
            CanonicalRecord::new(RecordKey::new("a", "2"), tier),
        ];
        let index = SpatialIndex::build(&records, 2.5);
        assert_eq!(index.len(), 1);
        assert!(index.point(1).is_none());
    }
}
