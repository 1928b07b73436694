//! Pure geometric primitives.
//!
//! Great-circle distance, circle-to-bbox approximation, ray-casting point
//! containment and orientation-based segment/polygon intersection. All
//! functions here are pure; the spatial index and query layers build on them.

use super::mbr::Mbr;
use super::Position;

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometers per degree of latitude (and of longitude at the equator).
const KM_PER_DEGREE: f64 = 111.32;

/// Great-circle distance between two lon/lat points, in kilometers.
pub fn haversine_distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Approximates the bounding box of a circle of `radius_km` around a point,
/// using 1° lat ≈ 111.32 km and 1° lon ≈ 111.32·cos(lat) km.
pub fn circle_to_bbox(lon: f64, lat: f64, radius_km: f64) -> Mbr {
    let d_lat = radius_km / KM_PER_DEGREE;
    // Longitude degrees shrink toward the poles; keep the divisor positive.
    let lon_scale = (KM_PER_DEGREE * lat.to_radians().cos()).max(1e-9);
    let d_lon = radius_km / lon_scale;

    Mbr::new(lon - d_lon, lat - d_lat, lon + d_lon, lat + d_lat)
}

/// Orientation of the ordered triplet (p, q, r):
/// 0 collinear, 1 clockwise, -1 counterclockwise.
fn orientation(p: (f64, f64), q: (f64, f64), r: (f64, f64)) -> i8 {
    let val = (q.1 - p.1) * (r.0 - q.0) - (q.0 - p.0) * (r.1 - q.1);
    if val > 0.0 {
        1
    } else if val < 0.0 {
        -1
    } else {
        0
    }
}

/// True if `q` lies on the segment `p`-`r`, assuming the three are collinear.
fn on_segment(p: (f64, f64), q: (f64, f64), r: (f64, f64)) -> bool {
    q.0 <= p.0.max(r.0) && q.0 >= p.0.min(r.0) && q.1 <= p.1.max(r.1) && q.1 >= p.1.min(r.1)
}

/// Orientation-based segment intersection test, including collinear overlap
/// and shared endpoints.
pub fn line_segments_intersect(
    p1: (f64, f64),
    q1: (f64, f64),
    p2: (f64, f64),
    q2: (f64, f64),
) -> bool {
    let o1 = orientation(p1, q1, p2);
    let o2 = orientation(p1, q1, q2);
    let o3 = orientation(p2, q2, p1);
    let o4 = orientation(p2, q2, q1);

    if o1 != o2 && o3 != o4 {
        return true;
    }

    (o1 == 0 && on_segment(p1, p2, q1))
        || (o2 == 0 && on_segment(p1, q2, q1))
        || (o3 == 0 && on_segment(p2, p1, q2))
        || (o4 == 0 && on_segment(p2, q1, q2))
}

/// Even-odd ray-casting test against a single closed ring.
fn point_in_ring(lon: f64, lat: f64, ring: &[Position]) -> bool {
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = (ring[i][0], ring[i][1]);
        let (xj, yj) = (ring[j][0], ring[j][1]);
        if ((yi > lat) != (yj > lat)) && (lon < (xj - xi) * (lat - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// True if the point lies on any edge of the ring.
fn point_on_ring(lon: f64, lat: f64, ring: &[Position]) -> bool {
    for window in ring.windows(2) {
        let p = (window[0][0], window[0][1]);
        let r = (window[1][0], window[1][1]);
        if orientation(p, (lon, lat), r) == 0 && on_segment(p, (lon, lat), r) {
            return true;
        }
    }
    false
}

/// Ray-casting containment test against a polygon's rings.
///
/// The first ring is the outer boundary; subsequent rings are holes, which
/// subtract from the interior. Boundary points (on any ring) count as inside.
pub fn point_in_polygon(lon: f64, lat: f64, polygon: &[Vec<Position>]) -> bool {
    let Some(outer) = polygon.first() else {
        return false;
    };

    // Every ring edge belongs to the polygon, hole boundaries included.
    if polygon.iter().any(|ring| point_on_ring(lon, lat, ring)) {
        return true;
    }

    if !point_in_ring(lon, lat, outer) {
        return false;
    }

    // A point strictly inside a hole is excluded.
    !polygon[1..].iter().any(|hole| point_in_ring(lon, lat, hole))
}

/// True if two polygons intersect: any edge pair crosses, or one polygon's
/// representative point lies inside the other (which covers full
/// containment).
pub fn polygons_intersect(a: &[Vec<Position>], b: &[Vec<Position>]) -> bool {
    let (Some(outer_a), Some(outer_b)) = (a.first(), b.first()) else {
        return false;
    };

    for ring_a in a {
        for ea in ring_a.windows(2) {
            for ring_b in b {
                for eb in ring_b.windows(2) {
                    if line_segments_intersect(
                        (ea[0][0], ea[0][1]),
                        (ea[1][0], ea[1][1]),
                        (eb[0][0], eb[0][1]),
                        (eb[1][0], eb[1][1]),
                    ) {
                        return true;
                    }
                }
            }
        }
    }

    point_in_polygon(outer_a[0][0], outer_a[0][1], b)
        || point_in_polygon(outer_b[0][0], outer_b[0][1], a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min: f64, max: f64) -> Vec<Vec<Position>> {
        vec![vec![
            vec![min, min],
            vec![max, min],
            vec![max, max],
            vec![min, max],
            vec![min, min],
        ]]
    }

    #[test]
    fn test_haversine_identical_points() {
        assert_eq!(haversine_distance(28.98, 41.0, 28.98, 41.0), 0.0);
    }

    #[test]
    fn test_haversine_symmetric() {
        let d1 = haversine_distance(28.9803, 41.0086, 32.8597, 39.9334);
        let d2 = haversine_distance(32.8597, 39.9334, 28.9803, 41.0086);
        assert!((d1 - d2).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_istanbul_ankara() {
        // Istanbul to Ankara is roughly 350 km great-circle.
        let d = haversine_distance(28.9803, 41.0086, 32.8597, 39.9334);
        assert!((d - 350.0).abs() < 15.0, "distance was {d}");
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_distance(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111.2).abs() < 1.0, "distance was {d}");
    }

    #[test]
    fn test_circle_to_bbox_contains_circle_points() {
        let bbox = circle_to_bbox(29.0, 41.0, 50.0);
        // The bbox must contain points 50 km due north/south/east/west.
        assert!(bbox.max_lat - 41.0 >= 50.0 / 111.32 - 1e-9);
        assert!(41.0 - bbox.min_lat >= 50.0 / 111.32 - 1e-9);
        assert!(bbox.max_lon > 29.0 && bbox.min_lon < 29.0);
        // Longitude degrees are wider than latitude degrees off the equator.
        assert!(bbox.max_lon - 29.0 > bbox.max_lat - 41.0);
    }

    #[test]
    fn test_segments_crossing() {
        assert!(line_segments_intersect(
            (0.0, 0.0),
            (2.0, 2.0),
            (0.0, 2.0),
            (2.0, 0.0)
        ));
    }

    #[test]
    fn test_segments_disjoint() {
        assert!(!line_segments_intersect(
            (0.0, 0.0),
            (1.0, 1.0),
            (2.0, 2.0),
            (3.0, 3.5)
        ));
    }

    #[test]
    fn test_segments_touching_endpoint() {
        assert!(line_segments_intersect(
            (0.0, 0.0),
            (1.0, 1.0),
            (1.0, 1.0),
            (2.0, 0.0)
        ));
    }

    #[test]
    fn test_segments_collinear_overlap() {
        assert!(line_segments_intersect(
            (0.0, 0.0),
            (2.0, 0.0),
            (1.0, 0.0),
            (3.0, 0.0)
        ));
    }

    #[test]
    fn test_point_in_polygon_with_hole() {
        let polygon = vec![
            vec![
                vec![0.0, 0.0],
                vec![10.0, 0.0],
                vec![10.0, 10.0],
                vec![0.0, 10.0],
                vec![0.0, 0.0],
            ],
            vec![
                vec![3.0, 3.0],
                vec![7.0, 3.0],
                vec![7.0, 7.0],
                vec![3.0, 7.0],
                vec![3.0, 3.0],
            ],
        ];

        assert!(point_in_polygon(1.0, 1.0, &polygon));
        // (5,5) falls in the hole.
        assert!(!point_in_polygon(5.0, 5.0, &polygon));
        assert!(!point_in_polygon(11.0, 5.0, &polygon));
    }

    #[test]
    fn test_boundary_points_are_inside() {
        let polygon = square(0.0, 10.0);
        assert!(point_in_polygon(0.0, 5.0, &polygon));
        assert!(point_in_polygon(0.0, 0.0, &polygon));
        assert!(point_in_polygon(10.0, 10.0, &polygon));
    }

    #[test]
    fn test_hole_boundary_is_inside() {
        let polygon = vec![
            square(0.0, 10.0).remove(0),
            vec![
                vec![3.0, 3.0],
                vec![7.0, 3.0],
                vec![7.0, 7.0],
                vec![3.0, 7.0],
                vec![3.0, 3.0],
            ],
        ];
        assert!(point_in_polygon(3.0, 5.0, &polygon));
    }

    #[test]
    fn test_polygons_crossing_edges() {
        assert!(polygons_intersect(&square(0.0, 5.0), &square(3.0, 8.0)));
    }

    #[test]
    fn test_polygons_disjoint() {
        assert!(!polygons_intersect(&square(0.0, 2.0), &square(5.0, 8.0)));
    }

    #[test]
    fn test_polygon_fully_contained() {
        // No edges cross; containment is caught by the representative point.
        assert!(polygons_intersect(&square(0.0, 10.0), &square(4.0, 6.0)));
        assert!(polygons_intersect(&square(4.0, 6.0), &square(0.0, 10.0)));
    }
}
