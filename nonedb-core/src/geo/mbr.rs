//! Minimum bounding rectangles.
//!
//! An MBR is the axis-aligned `[minLon, minLat, maxLon, maxLat]` box fully
//! containing a geometry's coordinates. Spatial queries prefilter on MBR
//! overlap before running exact geometric tests; overlap is necessary but
//! not sufficient for true intersection.

use serde::{Deserialize, Serialize};

use super::Geometry;

/// An axis-aligned minimum bounding rectangle.
///
/// Serialized as `[minLon, minLat, maxLon, maxLat]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Mbr {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Mbr {
    /// Creates an MBR from its corner coordinates.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Computes the MBR of a geometry as a running min/max over all of its
    /// coordinates. A point's MBR is degenerate (min = max).
    pub fn of_geometry(geometry: &Geometry) -> Self {
        let mut mbr = Self::new(
            f64::INFINITY,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::NEG_INFINITY,
        );
        geometry.for_each_position(&mut |lon, lat| {
            mbr.min_lon = mbr.min_lon.min(lon);
            mbr.min_lat = mbr.min_lat.min(lat);
            mbr.max_lon = mbr.max_lon.max(lon);
            mbr.max_lat = mbr.max_lat.max(lat);
        });
        mbr
    }

    /// Returns the smallest MBR containing both `self` and `other`.
    pub fn union(&self, other: &Mbr) -> Mbr {
        Mbr::new(
            self.min_lon.min(other.min_lon),
            self.min_lat.min(other.min_lat),
            self.max_lon.max(other.max_lon),
            self.max_lat.max(other.max_lat),
        )
    }

    /// Two-axis interval-overlap test. Symmetric; touching edges overlap.
    pub fn overlaps(&self, other: &Mbr) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    /// Width times height, in squared degrees.
    pub fn area(&self) -> f64 {
        (self.max_lon - self.min_lon) * (self.max_lat - self.min_lat)
    }

    /// Returns true if the point lies inside the rectangle (borders included).
    pub fn contains_point(&self, lon: f64, lat: f64) -> bool {
        (self.min_lon..=self.max_lon).contains(&lon) && (self.min_lat..=self.max_lat).contains(&lat)
    }
}

impl From<[f64; 4]> for Mbr {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<Mbr> for [f64; 4] {
    fn from(m: Mbr) -> Self {
        [m.min_lon, m.min_lat, m.max_lon, m.max_lat]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn polygon() -> Geometry {
        Geometry::from_value(&json!({
            "type": "Polygon",
            "coordinates": [[[2.0, -1.0], [8.0, -1.0], [8.0, 5.0], [2.0, 5.0], [2.0, -1.0]]],
        }))
        .unwrap()
    }

    #[test]
    fn test_point_mbr_is_degenerate() {
        let g = Geometry::Point(vec![10.0, 20.0]);
        let mbr = Mbr::of_geometry(&g);
        assert_eq!(mbr, Mbr::new(10.0, 20.0, 10.0, 20.0));
        assert_eq!(mbr.area(), 0.0);
    }

    #[test]
    fn test_mbr_contains_all_coordinates() {
        let g = polygon();
        let mbr = g.mbr();
        g.for_each_position(&mut |lon, lat| {
            assert!(mbr.contains_point(lon, lat));
        });
        assert_eq!(mbr, Mbr::new(2.0, -1.0, 8.0, 5.0));
    }

    #[test]
    fn test_union_is_componentwise() {
        let a = Mbr::new(0.0, 0.0, 2.0, 2.0);
        let b = Mbr::new(1.0, -1.0, 5.0, 1.0);
        assert_eq!(a.union(&b), Mbr::new(0.0, -1.0, 5.0, 2.0));
        assert_eq!(a.union(&b), b.union(&a));
    }

    #[test]
    fn test_overlaps_symmetric() {
        let a = Mbr::new(0.0, 0.0, 2.0, 2.0);
        let b = Mbr::new(1.0, 1.0, 3.0, 3.0);
        let c = Mbr::new(5.0, 5.0, 6.0, 6.0);

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn test_touching_edges_overlap() {
        let a = Mbr::new(0.0, 0.0, 1.0, 1.0);
        let b = Mbr::new(1.0, 0.0, 2.0, 1.0);
        assert!(a.overlaps(&b));
    }

    #[test]
    fn test_area() {
        assert_eq!(Mbr::new(0.0, 0.0, 4.0, 2.5).area(), 10.0);
    }

    #[test]
    fn test_serialized_as_array() {
        let mbr = Mbr::new(1.0, 2.0, 3.0, 4.0);
        let text = serde_json::to_string(&mbr).unwrap();
        assert_eq!(text, "[1.0,2.0,3.0,4.0]");
        let back: Mbr = serde_json::from_str(&text).unwrap();
        assert_eq!(back, mbr);
    }
}
