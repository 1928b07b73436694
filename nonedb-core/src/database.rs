//! The database engine facade.
//!
//! [`Database`] ties the storage, shard and index layers together behind the
//! operations the query layer consumes: `find`, `insert`, `update`,
//! `delete`, index management and the spatial queries.
//!
//! Every mutating call follows the same discipline: validate the payload
//! first, acquire the database's primary file lock, apply the record change,
//! update affected indexes inside the same lock scope, release. A failure
//! while the lock is held still releases it through the guard before the
//! error surfaces. Reads are best-effort: a missing database finds nothing
//! and an unreadable index degrades to a full scan instead of failing the
//! query.

use std::collections::BTreeMap;
use std::sync::Arc;

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use log::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::geo::{Geometry, Mbr};
use crate::index::{FieldIndexManager, NearestOptions, SpatialIndexManager};
use crate::naming::DbPaths;
use crate::record::{Filter, Record};
use crate::shard::{CompactReport, MigrateReport, MigrateStatus, ShardInfo, ShardManager};
use crate::storage::document::{unix_timestamp, write_json_atomic, StoredDocument};
use crate::storage::lock::{FileLock, LockOptions};
use crate::storage::{DocumentStore, ReadCache};

/// Result of a mutating call: the number of records affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub n: usize,
}

/// A record location resolved during a mutation: global key, shard id
/// (`None` for a legacy body) and local key.
#[derive(Debug, Clone, Copy)]
struct Location {
    key: usize,
    shard: Option<usize>,
    local: usize,
}

/// An index maintenance step deferred until the record files are written.
enum IndexOp {
    FieldInsert {
        field: String,
        shard: usize,
        local: usize,
        value: Value,
    },
    FieldDelete {
        field: String,
        shard: usize,
        local: usize,
        value: Value,
    },
    SpatialUpsert {
        field: String,
        key: usize,
        value: Value,
    },
    SpatialRemove {
        field: String,
        key: usize,
    },
}

/// An embedded noneDB engine over one storage root.
///
/// # Example
///
/// ```no_run
/// use nonedb_core::{Database, DatabaseConfig, Filter, Record};
///
/// # fn main() -> nonedb_core::Result<()> {
/// let db = Database::open(DatabaseConfig::new("./data", "secret"));
///
/// db.insert("cities", Record::new().with_field("city", "Istanbul"))?;
/// let records = db.find("cities", &Filter::new().with_field("city", "Istanbul"))?;
/// assert_eq!(records.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    config: DatabaseConfig,
    store: DocumentStore,
    shards: ShardManager,
    fields: FieldIndexManager,
    spatial: SpatialIndexManager,
    lock_opts: LockOptions,
}

impl Database {
    /// Opens an engine over the configured storage root.
    pub fn open(config: DatabaseConfig) -> Self {
        let cache = Arc::new(ReadCache::new());
        let store = DocumentStore::new(cache, &config);
        let shards = ShardManager::new(store.clone(), &config);
        Self {
            store,
            fields: FieldIndexManager::new(shards.clone(), &config),
            spatial: SpatialIndexManager::new(shards.clone(), &config),
            shards,
            lock_opts: LockOptions {
                timeout: config.lock_timeout,
                retry_delay: config.lock_retry_delay,
            },
            config,
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn paths(&self, name: &str) -> Result<DbPaths> {
        DbPaths::new(&self.config.root, &self.config.secret_key, name)
    }

    /// Returns true if the named database exists on disk.
    pub fn database_exists(&self, name: &str) -> Result<bool> {
        Ok(self.shards.database_exists(&self.paths(name)?))
    }

    /// Creates an empty database. Fails if it already exists or the storage
    /// root is missing.
    pub fn create_database(&self, name: &str) -> Result<()> {
        let paths = self.paths(name)?;
        // Creation is serialized on the body lock, so two racing creators
        // never both write an empty body.
        let _guard = FileLock::acquire(&paths.body(), &self.lock_opts)?;
        if self.shards.database_exists(&paths) {
            return Err(Error::DatabaseExists(name.to_string()));
        }
        self.store.create(&paths.body(), name)?;
        write_json_atomic(&paths.info(), &serde_json::json!({"createdDate": unix_timestamp()}))?;
        info!("created database {name}");
        Ok(())
    }

    /// Drops every entry from the process-local read cache.
    pub fn clear_cache(&self) {
        self.store.cache().clear();
    }

    // ------------------------------------------------------------------
    // Queries

    /// Finds live records matching the filter, in key order, each tagged
    /// with its `key` field.
    ///
    /// A missing database finds nothing. Indexed filter fields select
    /// candidates through the field indexes (with shard-skip); an index that
    /// cannot be read degrades to a full scan.
    pub fn find(&self, name: &str, filter: &Filter) -> Result<Vec<Record>> {
        let paths = self.paths(name)?;
        if !self.shards.database_exists(&paths) {
            return Ok(Vec::new());
        }

        if filter.has_key() {
            // A non-integer key condition matches nothing; it must not
            // degrade into an unfiltered query.
            let Some(key) = filter.key() else {
                return Ok(Vec::new());
            };
            return Ok(match self.fetch(&paths, key)? {
                Some(record) if filter.matches(&record) => vec![record.tagged(key)],
                _ => Vec::new(),
            });
        }

        let indexed: Vec<(&String, &Value)> = filter
            .data_fields()
            .filter(|(field, _)| self.fields.exists(&paths, field))
            .collect();

        if !indexed.is_empty() {
            match self.find_via_indexes(&paths, filter, &indexed) {
                Ok(records) => return Ok(records),
                Err(e) => {
                    warn!("index lookup failed for {name}, falling back to scan: {e}");
                }
            }
        }

        let mut out = Vec::new();
        for (key, record) in self.shards.scan(&paths)? {
            if filter.matches(&record) {
                out.push(record.tagged(key));
            }
        }
        Ok(out)
    }

    /// Candidate keys from each indexed field are intersected, then every
    /// candidate record is re-checked against the full filter.
    fn find_via_indexes(
        &self,
        paths: &DbPaths,
        filter: &Filter,
        indexed: &[(&String, &Value)],
    ) -> Result<Vec<Record>> {
        let mut keys: Option<RoaringTreemap> = None;
        for (field, value) in indexed {
            let matches = self.fields.matching_keys(paths, field, value)?;
            keys = Some(match keys {
                Some(acc) => acc & matches,
                None => matches,
            });
            if keys.as_ref().is_some_and(RoaringTreemap::is_empty) {
                return Ok(Vec::new());
            }
        }

        let mut out = Vec::new();
        for key in keys.unwrap_or_default() {
            let key = key as usize;
            if let Some(record) = self.fetch(paths, key)? {
                if filter.matches(&record) {
                    out.push(record.tagged(key));
                }
            }
        }
        Ok(out)
    }

    /// Materializes the live record at a global key.
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

    // ------------------------------------------------------------------
    // Mutations

    /// Inserts one record. The database is created on first write.
    pub fn insert(&self, name: &str, record: Record) -> Result<WriteOutcome> {
        self.insert_many(name, vec![record])
    }

    /// Inserts a batch of records in order, under one lock acquisition.
    ///
    /// The whole payload is validated (reserved field, geometry of every
    /// spatially indexed field) before anything is persisted.
    pub fn insert_many(&self, name: &str, records: Vec<Record>) -> Result<WriteOutcome> {
        let paths = self.paths(name)?;
        for record in &records {
            record.validate_fields()?;
        }
        if records.is_empty() {
            return Ok(WriteOutcome { n: 0 });
        }

        if !self.shards.database_exists(&paths) {
            match self.create_database(name) {
                // Lost the creation race to another writer; the insert
                // proceeds against the existing database.
                Err(Error::DatabaseExists(_)) => {}
                other => other?,
            }
        }

        let field_indexes = self.fields.list(&paths)?;
        let spatial_indexes = self.spatial.list(&paths)?;
        for record in &records {
            validate_geometries(record, &spatial_indexes)?;
        }

        let n = records.len();
        if self.shards.is_sharded(&paths) {
            self.insert_sharded(name, &paths, records, &field_indexes, &spatial_indexes)?;
        } else {
            self.insert_legacy(&paths, records, &field_indexes, &spatial_indexes)?;
            self.auto_migrate(name, &paths)?;
        }
        Ok(WriteOutcome { n })
    }

    fn insert_legacy(
        &self,
        paths: &DbPaths,
        records: Vec<Record>,
        field_indexes: &[String],
        spatial_indexes: &[String],
    ) -> Result<()> {
        let _guard = self.shards.lock_primary(paths)?;
        let mut body = self.shards.read_body(paths)?;

        let mut ops = Vec::new();
        for record in records {
            collect_insert_ops(&record, 0, body.len(), body.len(), field_indexes, spatial_indexes, &mut ops);
            body.insert(record)?;
        }
        self.shards.write_body(paths, &body)?;
        self.apply_ops(paths, &ops)
    }

    fn insert_sharded(
        &self,
        name: &str,
        paths: &DbPaths,
        records: Vec<Record>,
        field_indexes: &[String],
        spatial_indexes: &[String],
    ) -> Result<()> {
        let _guard = self.shards.lock_primary(paths)?;
        let mut manifest = self.shards.read_manifest(paths)?;
        let mut docs: BTreeMap<usize, StoredDocument> = BTreeMap::new();

        let mut ops = Vec::new();
        for record in records {
            let (shard, is_new) = self.shards.route_for_insert(&manifest);
            if is_new {
                manifest.shards.push(crate::shard::ShardSpan {
                    start: manifest.next_key(),
                    len: 0,
                });
            }
            let doc = match docs.entry(shard) {
                std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::btree_map::Entry::Vacant(e) => {
                    if is_new {
                        e.insert(StoredDocument::new(name))
                    } else {
                        e.insert(self.shards.read_shard(paths, shard)?)
                    }
                }
            };

            let span = &mut manifest.shards[shard];
            let key = span.start + span.len;
            collect_insert_ops(&record, shard, doc.len(), key, field_indexes, spatial_indexes, &mut ops);
            doc.insert(record)?;
            span.len += 1;
        }

        for (shard, doc) in &docs {
            self.shards.write_shard(paths, *shard, doc)?;
        }
        self.shards.write_manifest(paths, &manifest)?;
        self.apply_ops(paths, &ops)
    }

    /// Migrates a legacy body that reached the shard-size threshold.
    fn auto_migrate(&self, name: &str, paths: &DbPaths) -> Result<()> {
        let body = self.shards.read_body(paths)?;
        if body.len() < self.shards.shard_size() {
            return Ok(());
        }
        info!("database {name} reached shard size, migrating");
        self.migrate(name)?;
        Ok(())
    }

    /// Merges a field set into every record matching the filter.
    ///
    /// Fails on an empty field set, a reserved field or invalid geometry on
    /// a spatially indexed field, all before any persisted mutation.
    pub fn update(&self, name: &str, filter: &Filter, set: &Record) -> Result<WriteOutcome> {
        if set.is_empty() {
            return Err(Error::Validation("empty field list".into()));
        }
        set.validate_fields()?;

        let paths = self.paths(name)?;
        if !self.shards.database_exists(&paths) {
            return Err(Error::DatabaseNotFound(name.to_string()));
        }
        let field_indexes = self.fields.list(&paths)?;
        let spatial_indexes = self.spatial.list(&paths)?;
        validate_geometries(set, &spatial_indexes)?;

        let _guard = self.shards.lock_primary(&paths)?;
        let matches = self.locate_matches(&paths, filter)?;

        let mut docs: BTreeMap<Option<usize>, StoredDocument> = BTreeMap::new();
        let mut ops = Vec::new();
        let mut n = 0usize;
        for loc in &matches {
            let doc = self.doc_for(&paths, &mut docs, loc.shard)?;
            let Some(old) = doc.get(loc.local).cloned() else {
                continue;
            };

            for field in field_indexes.iter().filter(|f| set.contains_field(f)) {
                if let Some(value) = old.get(field) {
                    ops.push(IndexOp::FieldDelete {
                        field: field.clone(),
                        shard: loc.shard.unwrap_or(0),
                        local: loc.local,
                        value: value.clone(),
                    });
                }
                if let Some(value) = set.get(field) {
                    ops.push(IndexOp::FieldInsert {
                        field: field.clone(),
                        shard: loc.shard.unwrap_or(0),
                        local: loc.local,
                        value: value.clone(),
                    });
                }
            }
            for field in spatial_indexes.iter().filter(|f| set.contains_field(f)) {
                if let Some(value) = set.get(field) {
                    ops.push(IndexOp::SpatialUpsert {
                        field: field.clone(),
                        key: loc.key,
                        value: value.clone(),
                    });
                }
            }

            if doc.update(loc.local, set)? {
                n += 1;
            }
        }

        self.write_docs(&paths, &docs)?;
        self.apply_ops(&paths, &ops)?;
        Ok(WriteOutcome { n })
    }

    /// Tombstones every record matching the filter. Keys are not reused.
    pub fn delete(&self, name: &str, filter: &Filter) -> Result<WriteOutcome> {
        let paths = self.paths(name)?;
        if !self.shards.database_exists(&paths) {
            return Err(Error::DatabaseNotFound(name.to_string()));
        }
        let field_indexes = self.fields.list(&paths)?;
        let spatial_indexes = self.spatial.list(&paths)?;

        let _guard = self.shards.lock_primary(&paths)?;
        let matches = self.locate_matches(&paths, filter)?;

        let mut docs: BTreeMap<Option<usize>, StoredDocument> = BTreeMap::new();
        let mut ops = Vec::new();
        let mut n = 0usize;
        for loc in &matches {
            let doc = self.doc_for(&paths, &mut docs, loc.shard)?;
            let Some(old) = doc.delete(loc.local) else {
                continue;
            };
            n += 1;

            for field in &field_indexes {
                if let Some(value) = old.get(field) {
                    ops.push(IndexOp::FieldDelete {
                        field: field.clone(),
                        shard: loc.shard.unwrap_or(0),
                        local: loc.local,
                        value: value.clone(),
                    });
                }
            }
            for field in spatial_indexes.iter().filter(|f| old.contains_field(f)) {
                ops.push(IndexOp::SpatialRemove {
                    field: field.clone(),
                    key: loc.key,
                });
            }
        }

        self.write_docs(&paths, &docs)?;
        self.apply_ops(&paths, &ops)?;
        Ok(WriteOutcome { n })
    }

    /// Resolves the locations of every live record matching the filter.
    /// Called with the primary lock held.
    fn locate_matches(&self, paths: &DbPaths, filter: &Filter) -> Result<Vec<Location>> {
        let mut out = Vec::new();

        if filter.has_key() {
            let Some(key) = filter.key() else {
                return Ok(out);
            };
            let Some((shard, local)) = self.shards.key_to_shard(paths, key)? else {
                return Ok(out);
            };
            let shard = self.shards.is_sharded(paths).then_some(shard);
            if let Some(record) = self.fetch(paths, key)? {
                if filter.matches(&record) {
                    out.push(Location { key, shard, local });
                }
            }
            return Ok(out);
        }

        if self.shards.is_sharded(paths) {
            let manifest = self.shards.read_manifest(paths)?;
            for (shard, span) in manifest.shards.iter().enumerate() {
                let doc = self.shards.read_shard(paths, shard)?;
                for (local, record) in doc.iter_live() {
                    if filter.matches(record) {
                        out.push(Location {
                            key: span.start + local,
                            shard: Some(shard),
                            local,
                        });
                    }
                }
            }
        } else {
            let body = self.shards.read_body(paths)?;
            for (local, record) in body.iter_live() {
                if filter.matches(record) {
                    out.push(Location {
                        key: local,
                        shard: None,
                        local,
                    });
                }
            }
        }
        Ok(out)
    }

    fn doc_for<'a>(
        &self,
        paths: &DbPaths,
        docs: &'a mut BTreeMap<Option<usize>, StoredDocument>,
        shard: Option<usize>,
    ) -> Result<&'a mut StoredDocument> {
        match docs.entry(shard) {
            std::collections::btree_map::Entry::Occupied(e) => Ok(e.into_mut()),
            std::collections::btree_map::Entry::Vacant(e) => {
                let doc = match shard {
                    Some(id) => self.shards.read_shard(paths, id)?,
                    None => self.shards.read_body(paths)?,
                };
                Ok(e.insert(doc))
            }
        }
    }

    fn write_docs(&self, paths: &DbPaths, docs: &BTreeMap<Option<usize>, StoredDocument>) -> Result<()> {
        for (shard, doc) in docs {
            match shard {
                Some(id) => self.shards.write_shard(paths, *id, doc)?,
                None => self.shards.write_body(paths, doc)?,
            }
        }
        Ok(())
    }

    fn apply_ops(&self, paths: &DbPaths, ops: &[IndexOp]) -> Result<()> {
        for op in ops {
            match op {
                IndexOp::FieldInsert {
                    field,
                    shard,
                    local,
                    value,
                } => self.fields.apply_insert(paths, field, *shard, *local, value)?,
                IndexOp::FieldDelete {
                    field,
                    shard,
                    local,
                    value,
                } => self.fields.apply_delete(paths, field, *shard, *local, value)?,
                IndexOp::SpatialUpsert { field, key, value } => {
                    self.spatial.apply_upsert(paths, field, *key, value)?
                }
                IndexOp::SpatialRemove { field, key } => {
                    self.spatial.apply_remove(paths, field, *key)?
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Layout management

    /// Converts a legacy database to the sharded layout, rebuilding its
    /// field indexes (their shard assignment changes).
    pub fn migrate(&self, name: &str) -> Result<MigrateReport> {
        let paths = self.paths(name)?;
        let report = self.shards.migrate(&paths)?;
        if report.status == MigrateStatus::Migrated {
            for field in self.fields.list(&paths)? {
                self.fields.rebuild(&paths, &field)?;
            }
        }
        Ok(report)
    }

    /// Compacts the database and rebuilds every index, since keys shift.
    pub fn compact(&self, name: &str) -> Result<CompactReport> {
        let paths = self.paths(name)?;
        let report = self.shards.compact(&paths)?;
        for field in self.fields.list(&paths)? {
            self.fields.rebuild(&paths, &field)?;
        }
        for field in self.spatial.list(&paths)? {
            self.spatial.rebuild(&paths, &field)?;
        }
        Ok(report)
    }

    /// Physical layout summary of a database.
    pub fn shard_info(&self, name: &str) -> Result<ShardInfo> {
        self.shards.shard_info(&self.paths(name)?)
    }

    // ------------------------------------------------------------------
    // Index management

    /// Builds a field index by a one-time full scan.
    pub fn create_field_index(&self, name: &str, field: &str) -> Result<()> {
        self.fields.create(&self.paths(name)?, field)
    }

    /// Deletes a field index.
    pub fn drop_field_index(&self, name: &str, field: &str) -> Result<()> {
        self.fields.drop_index(&self.paths(name)?, field)
    }

    /// Fully recomputes a field index.
    pub fn rebuild_field_index(&self, name: &str, field: &str) -> Result<()> {
        self.fields.rebuild(&self.paths(name)?, field)
    }

    /// Lists the field-indexed field names.
    pub fn field_indexes(&self, name: &str) -> Result<Vec<String>> {
        self.fields.list(&self.paths(name)?)
    }

    /// Builds a spatial index, validating every existing geometry.
    pub fn create_spatial_index(&self, name: &str, field: &str) -> Result<()> {
        self.spatial.create(&self.paths(name)?, field)
    }

    /// Deletes a spatial index.
    pub fn drop_spatial_index(&self, name: &str, field: &str) -> Result<()> {
        self.spatial.drop_index(&self.paths(name)?, field)
    }

    /// Fully recomputes a spatial index.
    pub fn rebuild_spatial_index(&self, name: &str, field: &str) -> Result<()> {
        self.spatial.rebuild(&self.paths(name)?, field)
    }

    /// Lists the spatially indexed field names.
    pub fn spatial_indexes(&self, name: &str) -> Result<Vec<String>> {
        self.spatial.list(&self.paths(name)?)
    }

    // ------------------------------------------------------------------
    // Spatial queries

    /// Records within `radius_m` meters of the center, tagged with keys.
    pub fn within_distance(
        &self,
        name: &str,
        field: &str,
        lon: f64,
        lat: f64,
        radius_m: f64,
    ) -> Result<Vec<Record>> {
        let paths = self.paths(name)?;
        Ok(tag(self.spatial.within_distance(&paths, field, lon, lat, radius_m)?))
    }

    /// Records whose MBR overlaps the rectangle, tagged with keys.
    pub fn within_bbox(
        &self,
        name: &str,
        field: &str,
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    ) -> Result<Vec<Record>> {
        let paths = self.paths(name)?;
        let query = Mbr::new(min_lon, min_lat, max_lon, max_lat);
        Ok(tag(self.spatial.within_bbox(&paths, field, query)?))
    }

    /// Records intersecting the polygon, tagged with keys.
    pub fn within_polygon(&self, name: &str, field: &str, polygon: &Value) -> Result<Vec<Record>> {
        let paths = self.paths(name)?;
        Ok(tag(self.spatial.within_polygon(&paths, field, polygon)?))
    }

    /// The `limit` records closest to the center, tagged with keys and
    /// optionally with their distance in meters.
    pub fn nearest(
        &self,
        name: &str,
        field: &str,
        lon: f64,
        lat: f64,
        limit: usize,
        opts: &NearestOptions,
    ) -> Result<Vec<Record>> {
        let paths = self.paths(name)?;
        Ok(tag(self.spatial.nearest(&paths, field, lon, lat, limit, opts)?))
    }
}

fn tag(results: Vec<(usize, Record)>) -> Vec<Record> {
    results
        .into_iter()
        .map(|(key, record)| record.tagged(key))
        .collect()
}

/// Parses every spatially indexed geometry field of a payload, so an
/// invalid geometry fails before any persisted mutation.
fn validate_geometries(record: &Record, spatial_indexes: &[String]) -> Result<()> {
    for field in spatial_indexes {
        if let Some(value) = record.get(field) {
            Geometry::from_value(value)?;
        }
    }
    Ok(())
}

fn collect_insert_ops(
    record: &Record,
    shard: usize,
    local: usize,
    key: usize,
    field_indexes: &[String],
    spatial_indexes: &[String],
    ops: &mut Vec<IndexOp>,
) {
    for field in field_indexes {
        if let Some(value) = record.get(field) {
            ops.push(IndexOp::FieldInsert {
                field: field.clone(),
                shard,
                local,
                value: value.clone(),
            });
        }
    }
    for field in spatial_indexes {
        if let Some(value) = record.get(field) {
            ops.push(IndexOp::SpatialUpsert {
                field: field.clone(),
                key,
                value: value.clone(),
            });
        }
    }
}
