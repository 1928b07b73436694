//! Spatial indexes and geospatial queries.
//!
//! A spatial index maps each record's global key to the MBR of one GeoJSON
//! field. Queries prefilter candidates by rectangle overlap, then run the
//! exact geometric test on the candidate's parsed geometry.
//!
//! Public query distances and radii are in meters; the underlying
//! great-circle math works in kilometers and the conversion happens at this
//! boundary.

use std::collections::BTreeMap;
use std::fs;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use log::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::geo::ops::{circle_to_bbox, haversine_distance, point_in_polygon, polygons_intersect};
use crate::geo::{Geometry, Mbr};
use crate::naming::{validate_field_name, DbPaths, SPATIAL_INDEX_KIND};
use crate::record::Record;
use crate::shard::ShardManager;
use crate::storage::document::{read_json_opt, write_json_atomic};
use crate::storage::lock::{FileLock, LockOptions};

/// Spatial index format version.
const INDEX_VERSION: u32 = 1;

/// Field name attached to results when a query reports distances.
pub const DISTANCE_FIELD: &str = "distance";

/// Per-field map of record key to geometry MBR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialIndex {
    pub v: u32,
    pub field: String,
    pub entries: BTreeMap<usize, Mbr>,
}

impl SpatialIndex {
    fn new(field: &str) -> Self {
        Self {
            v: INDEX_VERSION,
            field: field.to_string(),
            entries: BTreeMap::new(),
        }
    }
}

/// Options for [`SpatialIndexManager::nearest`].
#[derive(Debug, Clone, Default)]
pub struct NearestOptions {
    /// Discard candidates farther than this many meters.
    pub max_distance: Option<f64>,
    /// Attach each result's distance in meters as a `distance` field.
    pub include_distance: bool,
}

/// Creates, maintains and queries spatial indexes.
#[derive(Debug, Clone)]
pub struct SpatialIndexManager {
    shards: ShardManager,
    read_retries: u32,
    lock_opts: LockOptions,
}

impl SpatialIndexManager {
    /// Creates a manager over the given shard manager.
    pub fn new(shards: ShardManager, config: &DatabaseConfig) -> Self {
        Self {
            shards,
            read_retries: config.read_retries,
            lock_opts: LockOptions {
                timeout: config.lock_timeout,
                retry_delay: config.lock_retry_delay,
            },
        }
    }

    /// Lists spatially indexed field names, sorted.
    pub fn list(&self, paths: &DbPaths) -> Result<Vec<String>> {
        paths.indexed_fields(SPATIAL_INDEX_KIND)
    }

    /// Returns true if a spatial index exists on disk.
    pub fn exists(&self, paths: &DbPaths, field: &str) -> bool {
        paths.spatial_index(field).exists()
    }

    /// Builds a spatial index over a field, validating every existing
    /// geometry. One invalid geometry fails the whole call and nothing is
    /// written.
    pub fn create(&self, paths: &DbPaths, field: &str) -> Result<()> {
        validate_field_name(field)?;
        if self.exists(paths, field) {
            return Err(Error::IndexExists {
                db: paths.stem().to_string(),
                field: field.to_string(),
            });
        }
        if !self.shards.database_exists(paths) {
            return Err(Error::DatabaseNotFound(paths.stem().to_string()));
        }

        self.build(paths, field)?;
        info!("created spatial index {}.{}", paths.stem(), field);
        Ok(())
    }

    /// Fully recomputes an existing spatial index.
    pub fn rebuild(&self, paths: &DbPaths, field: &str) -> Result<()> {
        validate_field_name(field)?;
        if !self.exists(paths, field) {
            return Err(Error::IndexNotFound {
                db: paths.stem().to_string(),
                field: field.to_string(),
            });
        }
        self.build(paths, field)
    }

    /// Deletes a spatial index's file.
    pub fn drop_index(&self, paths: &DbPaths, field: &str) -> Result<()> {
        let path = paths.spatial_index(field);
        if !path.exists() {
            return Err(Error::IndexNotFound {
                db: paths.stem().to_string(),
                field: field.to_string(),
            });
        }
        let _guard = FileLock::acquire(&path, &self.lock_opts)?;
        fs::remove_file(&path)
            .map_err(|e| Error::Io(format!("remove {} failed: {e}", path.display())))?;
        info!("dropped spatial index {}.{}", paths.stem(), field);
        Ok(())
    }

    fn build(&self, paths: &DbPaths, field: &str) -> Result<()> {
        let _guard = FileLock::acquire(&paths.spatial_index(field), &self.lock_opts)?;

        let mut index = SpatialIndex::new(field);
        for (key, record) in self.shards.scan(paths)? {
            if let Some(value) = record.get(field) {
                let geometry = Geometry::from_value(value)?;
                index.entries.insert(key, geometry.mbr());
            }
        }
        write_json_atomic(&paths.spatial_index(field), &index)
    }

    /// Decodes the index, failing if it is absent.
    pub fn load(&self, paths: &DbPaths, field: &str) -> Result<SpatialIndex> {
        read_json_opt(&paths.spatial_index(field), self.read_retries)?.ok_or_else(|| {
            Error::IndexNotFound {
                db: paths.stem().to_string(),
                field: field.to_string(),
            }
        })
    }

    fn load_opt(&self, paths: &DbPaths, field: &str) -> Result<Option<SpatialIndex>> {
        read_json_opt(&paths.spatial_index(field), self.read_retries)
    }

    /// Recomputes the MBR entry for a record's geometry. Called inside the
    /// record mutation's lock scope; a concurrently dropped index is left
    /// alone.
    pub fn apply_upsert(
        &self,
        paths: &DbPaths,
        field: &str,
        key: usize,
        value: &Value,
    ) -> Result<()> {
        let _guard = FileLock::acquire(&paths.spatial_index(field), &self.lock_opts)?;
        let Some(mut index) = self.load_opt(paths, field)? else {
            return Ok(());
        };
        let geometry = Geometry::from_value(value)?;
        index.entries.insert(key, geometry.mbr());
        write_json_atomic(&paths.spatial_index(field), &index)
    }

    /// Removes a record's MBR entry.
    pub fn apply_remove(&self, paths: &DbPaths, field: &str, key: usize) -> Result<()> {
        let _guard = FileLock::acquire(&paths.spatial_index(field), &self.lock_opts)?;
        let Some(mut index) = self.load_opt(paths, field)? else {
            return Ok(());
        };
        index.entries.remove(&key);
        write_json_atomic(&paths.spatial_index(field), &index)
    }

    /// Live records whose geometry lies within `radius_m` meters of the
    /// center, ordered by key.
    ///
    /// Exact distance is the haversine to the point itself, or to the
    /// centroid for non-point geometries.
    pub fn within_distance(
        &self,
        paths: &DbPaths,
        field: &str,
        lon: f64,
        lat: f64,
        radius_m: f64,
    ) -> Result<Vec<(usize, Record)>> {
        let results = self.distance_candidates(paths, field, lon, lat, Some(radius_m / 1000.0))?;
        Ok(results.into_iter().map(|(key, record, _)| (key, record)).collect())
    }

    /// Live records whose MBR overlaps the query rectangle, ordered by key.
    ///
    /// Approximate by design: rectangle overlap only, no exact clipping.
    pub fn within_bbox(&self, paths: &DbPaths, field: &str, query: Mbr) -> Result<Vec<(usize, Record)>> {
        let index = self.load(paths, field)?;
        let mut out = Vec::new();
        for (key, mbr) in &index.entries {
            if mbr.overlaps(&query) {
                if let Some(record) = self.fetch(paths, *key)? {
                    out.push((*key, record));
                }
            }
        }
        Ok(out)
    }

    /// Live records whose geometry intersects the query polygon, ordered by
    /// key. Points test containment, polygons test intersection, other
    /// geometries test their centroid.
    pub fn within_polygon(
        &self,
        paths: &DbPaths,
        field: &str,
        polygon: &Value,
    ) -> Result<Vec<(usize, Record)>> {
        let query = Geometry::from_value(polygon)?;
        let Some(query_rings) = query.as_polygon() else {
            return Err(Error::Geometry(
                "within_polygon requires a Polygon geometry".into(),
            ));
        };
        let query_mbr = query.mbr();

        let index = self.load(paths, field)?;
        let mut out = Vec::new();
        for (key, mbr) in &index.entries {
            if !mbr.overlaps(&query_mbr) {
                continue;
            }
            let Some((record, geometry)) = self.fetch_with_geometry(paths, field, *key)? else {
                continue;
            };

            let hit = match &geometry {
                Geometry::Point(p) => point_in_polygon(p[0], p[1], query_rings),
                Geometry::Polygon(rings) => polygons_intersect(rings, query_rings),
                other => {
                    let (lon, lat) = other.centroid();
                    point_in_polygon(lon, lat, query_rings)
                }
            };
            if hit {
                out.push((*key, record));
            }
        }
        Ok(out)
    }

    /// The `limit` records closest to the center, sorted by ascending
    /// distance. `max_distance` (meters) bounds the candidate set;
    /// `include_distance` attaches each result's distance in meters.
    pub fn nearest(
        &self,
        paths: &DbPaths,
        field: &str,
        lon: f64,
        lat: f64,
        limit: usize,
        opts: &NearestOptions,
    ) -> Result<Vec<(usize, Record)>> {
        let radius_km = opts.max_distance.map(|m| m / 1000.0);
        let mut candidates = self.distance_candidates(paths, field, lon, lat, radius_km)?;
        candidates.sort_by(|a, b| a.2.total_cmp(&b.2));
        candidates.truncate(limit);

        Ok(candidates
            .into_iter()
            .map(|(key, mut record, km)| {
                if opts.include_distance {
                    record.set(DISTANCE_FIELD, km * 1000.0);
                }
                (key, record)
            })
            .collect())
    }

    /// MBR-prefiltered candidates with their exact distance in kilometers,
    /// ordered by key. `radius_km` of `None` keeps every indexed record.
    fn distance_candidates(
        &self,
        paths: &DbPaths,
        field: &str,
        lon: f64,
        lat: f64,
        radius_km: Option<f64>,
    ) -> Result<Vec<(usize, Record, f64)>> {
        let index = self.load(paths, field)?;
        let bbox = radius_km.map(|r| circle_to_bbox(lon, lat, r));

        let mut out = Vec::new();
        for (key, mbr) in &index.entries {
            if let Some(bbox) = &bbox {
                if !mbr.overlaps(bbox) {
                    continue;
                }
            }
            let Some((record, geometry)) = self.fetch_with_geometry(paths, field, *key)? else {
                continue;
            };

            let (glon, glat) = match &geometry {
                Geometry::Point(p) => (p[0], p[1]),
                other => other.centroid(),
            };
            let distance = haversine_distance(lon, lat, glon, glat);
            if radius_km.is_none_or(|r| distance <= r) {
                out.push((*key, record, distance));
            }
        }
        Ok(out)
    }

    /// Materializes the live record at a global key, or `None` for a
    /// tombstoned or out-of-range key.
    fn fetch(&self, paths: &DbPaths, key: usize) -> Result<Option<Record>> {
        if self.shards.is_sharded(paths) {
            let manifest = self.shards.read_manifest(paths)?;
            let Some((shard, local)) = manifest.key_to_shard(key) else {
                return Ok(None);
            };
            Ok(self.shards.read_shard(paths, shard)?.get(local).cloned())
        } else {
            Ok(self.shards.read_body(paths)?.get(key).cloned())
        }
    }

    /// Fetches a record and parses its indexed geometry field. A record
    /// whose geometry went missing since indexing is skipped with a warning
    /// rather than failing the query.
    fn fetch_with_geometry(
        &self,
        paths: &DbPaths,
        field: &str,
        key: usize,
    ) -> Result<Option<(Record, Geometry)>> {
        let Some(record) = self.fetch(paths, key)? else {
            return Ok(None);
        };
        let Some(value) = record.get(field) else {
            warn!("spatial index {}.{} entry {} has no geometry", paths.stem(), field, key);
            return Ok(None);
        };
        match Geometry::from_value(value) {
            Ok(geometry) => Ok(Some((record, geometry))),
            Err(e) => {
                warn!(
                    "spatial index {}.{} entry {} holds invalid geometry: {e}",
                    paths.stem(),
                    field,
                    key
                );
                Ok(None)
            }
        }
    }
}
