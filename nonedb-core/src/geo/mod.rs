//! GeoJSON geometries and geospatial primitives.
//!
//! Geometries are parsed from untyped JSON into a tagged variant, with every
//! shape rule checked at construction. Invalid payloads fail with a
//! [`Error::Geometry`](crate::Error::Geometry) naming the offending
//! attribute, so callers can surface precise messages.

pub mod mbr;
pub mod ops;

pub use mbr::Mbr;

use serde_json::Value;

use crate::error::{Error, Result};

/// A longitude/latitude position, optionally carrying an altitude.
pub type Position = Vec<f64>;

/// A validated GeoJSON geometry.
///
/// # Example
///
/// ```
/// use nonedb_core::geo::Geometry;
/// use serde_json::json;
///
/// let point = Geometry::from_value(&json!({
///     "type": "Point",
///     "coordinates": [28.9803, 41.0086],
/// })).unwrap();
///
/// assert_eq!(point.centroid(), (28.9803, 41.0086));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Position),
    LineString(Vec<Position>),
    Polygon(Vec<Vec<Position>>),
    MultiPoint(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
    GeometryCollection(Vec<Geometry>),
}

impl Geometry {
    /// Parses and validates a GeoJSON value.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Geometry("geometry must be an object".into()))?;

        let kind = obj
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::Geometry("geometry type is required".into()))?;

        if kind == "GeometryCollection" {
            let members = obj
                .get("geometries")
                .ok_or_else(|| Error::Geometry("geometries is required".into()))?
                .as_array()
                .ok_or_else(|| Error::Geometry("geometries must be an array".into()))?;
            // Every accepted geometry yields at least one position, so an
            // empty container has no bounding rectangle and is rejected.
            if members.is_empty() {
                return Err(Error::Geometry(
                    "geometry collection must not be empty".into(),
                ));
            }
            // One invalid member fails the whole collection.
            let parsed = members
                .iter()
                .map(Geometry::from_value)
                .collect::<Result<Vec<_>>>()?;
            return Ok(Geometry::GeometryCollection(parsed));
        }

        let coordinates = obj
            .get("coordinates")
            .ok_or_else(|| Error::Geometry("coordinates is required".into()))?;
        let coordinates = coordinates
            .as_array()
            .ok_or_else(|| Error::Geometry("coordinates must be an array".into()))?;

        match kind {
            "Point" => Ok(Geometry::Point(parse_position_slice(coordinates)?)),
            "LineString" => Ok(Geometry::LineString(parse_line(coordinates)?)),
            "Polygon" => Ok(Geometry::Polygon(parse_polygon(coordinates)?)),
            "MultiPoint" => {
                if coordinates.is_empty() {
                    return Err(Error::Geometry("multi point requires at least 1 point".into()));
                }
                let points = coordinates
                    .iter()
                    .map(parse_position)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Geometry::MultiPoint(points))
            }
            "MultiLineString" => {
                if coordinates.is_empty() {
                    return Err(Error::Geometry(
                        "multi line string requires at least 1 line string".into(),
                    ));
                }
                let lines = coordinates
                    .iter()
                    .map(|l| parse_line(as_coord_array(l)?))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Geometry::MultiLineString(lines))
            }
            "MultiPolygon" => {
                if coordinates.is_empty() {
                    return Err(Error::Geometry(
                        "multi polygon requires at least 1 polygon".into(),
                    ));
                }
                let polygons = coordinates
                    .iter()
                    .map(|p| parse_polygon(as_coord_array(p)?))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Geometry::MultiPolygon(polygons))
            }
            other => Err(Error::Geometry(format!("unknown geometry type: {other}"))),
        }
    }

    /// Visits every longitude/latitude pair of the geometry.
    pub fn for_each_position<F: FnMut(f64, f64)>(&self, f: &mut F) {
        match self {
            Geometry::Point(p) => f(p[0], p[1]),
            Geometry::LineString(line) | Geometry::MultiPoint(line) => {
                for p in line {
                    f(p[0], p[1]);
                }
            }
            Geometry::Polygon(rings) | Geometry::MultiLineString(rings) => {
                for ring in rings {
                    for p in ring {
                        f(p[0], p[1]);
                    }
                }
            }
            Geometry::MultiPolygon(polygons) => {
                for rings in polygons {
                    for ring in rings {
                        for p in ring {
                            f(p[0], p[1]);
                        }
                    }
                }
            }
            Geometry::GeometryCollection(members) => {
                for member in members {
                    member.for_each_position(f);
                }
            }
        }
    }

    /// Returns the geometry's centroid as `(lon, lat)`.
    ///
    /// A point is its own centroid; a polygon averages its outer-ring
    /// vertices (without the closing duplicate); everything else averages
    /// all positions.
    pub fn centroid(&self) -> (f64, f64) {
        match self {
            Geometry::Point(p) => (p[0], p[1]),
            Geometry::Polygon(rings) => {
                let outer = &rings[0];
                mean_of(&outer[..outer.len() - 1])
            }
            other => {
                let mut sum = (0.0, 0.0);
                let mut count = 0usize;
                other.for_each_position(&mut |lon, lat| {
                    sum.0 += lon;
                    sum.1 += lat;
                    count += 1;
                });
                if count == 0 {
                    (0.0, 0.0)
                } else {
                    (sum.0 / count as f64, sum.1 / count as f64)
                }
            }
        }
    }

    /// Computes the geometry's minimum bounding rectangle.
    pub fn mbr(&self) -> Mbr {
        Mbr::of_geometry(self)
    }

    /// Returns the polygon rings if this is a polygon.
    pub fn as_polygon(&self) -> Option<&Vec<Vec<Position>>> {
        match self {
            Geometry::Polygon(rings) => Some(rings),
            _ => None,
        }
    }
}

fn mean_of(points: &[Position]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let sum = points
        .iter()
        .fold((0.0, 0.0), |acc, p| (acc.0 + p[0], acc.1 + p[1]));
    (sum.0 / points.len() as f64, sum.1 / points.len() as f64)
}

fn as_coord_array(value: &Value) -> Result<&Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| Error::Geometry("coordinates must be an array".into()))
}

fn parse_position(value: &Value) -> Result<Position> {
    parse_position_slice(as_coord_array(value)?)
}

fn parse_position_slice(values: &[Value]) -> Result<Position> {
    if !(2..=3).contains(&values.len()) {
        return Err(Error::Geometry(
            "point coordinates must contain 2 or 3 numbers".into(),
        ));
    }
    let mut position = Vec::with_capacity(values.len());
    for v in values {
        position.push(v.as_f64().ok_or_else(|| {
            Error::Geometry("point coordinates must contain 2 or 3 numbers".into())
        })?);
    }

    let (lon, lat) = (position[0], position[1]);
    if !(-180.0..=180.0).contains(&lon) {
        return Err(Error::Geometry(format!("longitude out of range: {lon}")));
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(Error::Geometry(format!("latitude out of range: {lat}")));
    }
    Ok(position)
}

fn parse_line(values: &[Value]) -> Result<Vec<Position>> {
    let points = values
        .iter()
        .map(parse_position)
        .collect::<Result<Vec<_>>>()?;
    if points.len() < 2 {
        return Err(Error::Geometry(
            "line string requires at least 2 points".into(),
        ));
    }
    Ok(points)
}

fn parse_polygon(values: &[Value]) -> Result<Vec<Vec<Position>>> {
    if values.is_empty() {
        return Err(Error::Geometry("polygon requires at least one ring".into()));
    }
    let mut rings = Vec::with_capacity(values.len());
    for ring_value in values {
        let ring = as_coord_array(ring_value)?
            .iter()
            .map(parse_position)
            .collect::<Result<Vec<_>>>()?;
        if ring.len() < 4 {
            return Err(Error::Geometry(
                "polygon ring requires at least 4 points".into(),
            ));
        }
        if ring.first() != ring.last() {
            return Err(Error::Geometry("polygon ring must be closed".into()));
        }
        rings.push(ring);
    }
    Ok(rings)
}
