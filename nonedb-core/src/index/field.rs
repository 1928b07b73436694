//! Field indexes and shard-skip lookups.
//!
//! A field index accelerates equality filters on one field. The local index
//! maps, per shard, encoded value to the local keys holding it. For sharded
//! databases a global index additionally maps each value to the exact set of
//! shard ids containing at least one live match, so a lookup for an absent
//! value answers empty without opening a single shard file.
//!
//! The global map's membership is exact, never a superset: every incremental
//! mutation prunes entries the moment their last live match disappears.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use log::info;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::naming::{validate_field_name, DbPaths, FIELD_INDEX_KIND};
use crate::record::encode_value;
use crate::shard::ShardManager;
use crate::storage::document::{read_json_opt, write_json_atomic};
use crate::storage::lock::{FileLock, LockOptions};

/// Field index format version.
const INDEX_VERSION: u32 = 1;

/// Per-shard value-to-local-keys map for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFieldIndex {
    pub v: u32,
    pub field: String,
    /// shard id -> encoded value -> local keys, all sorted.
    pub shards: BTreeMap<usize, BTreeMap<String, Vec<usize>>>,
}

impl LocalFieldIndex {
    fn new(field: &str) -> Self {
        Self {
            v: INDEX_VERSION,
            field: field.to_string(),
            shards: BTreeMap::new(),
        }
    }

    fn add(&mut self, shard: usize, value: &str, local: usize) {
        let keys = self
            .shards
            .entry(shard)
            .or_default()
            .entry(value.to_string())
            .or_default();
        if let Err(pos) = keys.binary_search(&local) {
            keys.insert(pos, local);
        }
    }

    /// Removes one entry; returns true if the shard no longer holds any
    /// live match for the value.
    fn remove(&mut self, shard: usize, value: &str, local: usize) -> bool {
        let Some(values) = self.shards.get_mut(&shard) else {
            return true;
        };
        let Some(keys) = values.get_mut(value) else {
            return true;
        };
        keys.retain(|k| *k != local);

        if keys.is_empty() {
            values.remove(value);
            if values.is_empty() {
                self.shards.remove(&shard);
            }
            return true;
        }
        false
    }

    fn local_keys(&self, shard: usize, value: &str) -> &[usize] {
        self.shards
            .get(&shard)
            .and_then(|values| values.get(value))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Value-to-shard-ids map for one field of a sharded database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalFieldIndex {
    pub v: u32,
    pub field: String,
    #[serde(rename = "shardMap")]
    pub shard_map: BTreeMap<String, Vec<usize>>,
}

impl GlobalFieldIndex {
    fn new(field: &str) -> Self {
        Self {
            v: INDEX_VERSION,
            field: field.to_string(),
            shard_map: BTreeMap::new(),
        }
    }

    fn add(&mut self, value: &str, shard: usize) {
        let shards = self.shard_map.entry(value.to_string()).or_default();
        if let Err(pos) = shards.binary_search(&shard) {
            shards.insert(pos, shard);
        }
    }

    fn remove(&mut self, value: &str, shard: usize) {
        if let Some(shards) = self.shard_map.get_mut(value) {
            shards.retain(|s| *s != shard);
            if shards.is_empty() {
                self.shard_map.remove(value);
            }
        }
    }

    /// Shard ids holding at least one live match for the value.
    pub fn shards_for(&self, value: &str) -> &[usize] {
        self.shard_map
            .get(value)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Creates, maintains and queries field indexes.
#[derive(Debug, Clone)]
pub struct FieldIndexManager {
    shards: ShardManager,
    read_retries: u32,
    lock_opts: LockOptions,
}

impl FieldIndexManager {
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

    /// Lists indexed field names, sorted.
    pub fn list(&self, paths: &DbPaths) -> Result<Vec<String>> {
        paths.indexed_fields(FIELD_INDEX_KIND)
    }

    /// Returns true if a field index exists on disk.
    pub fn exists(&self, paths: &DbPaths, field: &str) -> bool {
        paths.field_index(field).exists()
    }

    /// Builds an index over a field by scanning all live records once.
    ///
    /// Fails if the index already exists or the database is missing.
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
        info!("created field index {}.{}", paths.stem(), field);
        Ok(())
    }

    /// Fully recomputes an existing index from the record files.
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

    /// Deletes an index's files.
    pub fn drop_index(&self, paths: &DbPaths, field: &str) -> Result<()> {
        if !self.exists(paths, field) {
            return Err(Error::IndexNotFound {
                db: paths.stem().to_string(),
                field: field.to_string(),
            });
        }
        let _guard = FileLock::acquire(&paths.field_index(field), &self.lock_opts)?;
        remove_if_present(&paths.field_index(field))?;
        remove_if_present(&paths.global_field_index(field))?;
        info!("dropped field index {}.{}", paths.stem(), field);
        Ok(())
    }

    fn build(&self, paths: &DbPaths, field: &str) -> Result<()> {
        let _guard = FileLock::acquire(&paths.field_index(field), &self.lock_opts)?;

        let mut local = LocalFieldIndex::new(field);
        let mut shard_sets: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();

        for (shard, local_key, record) in self.shard_entries(paths)? {
            if let Some(value) = record.get(field) {
                let encoded = encode_value(value);
                local.add(shard, &encoded, local_key);
                shard_sets.entry(encoded).or_default().insert(shard);
            }
        }

        write_json_atomic(&paths.field_index(field), &local)?;

        if self.shards.is_sharded(paths) {
            let mut global = GlobalFieldIndex::new(field);
            global.shard_map = shard_sets
                .into_iter()
                .map(|(value, shards)| (value, shards.into_iter().collect()))
                .collect();
            write_json_atomic(&paths.global_field_index(field), &global)?;
        } else {
            // A rebuild of a since-de-sharded database leaves no stale map.
            remove_if_present(&paths.global_field_index(field))?;
        }
        Ok(())
    }

    /// Every live record with its shard id and local key. Legacy databases
    /// present as one shard 0.
    fn shard_entries(
        &self,
        paths: &DbPaths,
    ) -> Result<Vec<(usize, usize, crate::record::Record)>> {
        let mut out = Vec::new();
        if self.shards.is_sharded(paths) {
            let manifest = self.shards.read_manifest(paths)?;
            for shard in 0..manifest.shards.len() {
                let doc = self.shards.read_shard(paths, shard)?;
                for (local, record) in doc.iter_live() {
                    out.push((shard, local, record.clone()));
                }
            }
        } else {
            let doc = self.shards.read_body(paths)?;
            for (local, record) in doc.iter_live() {
                out.push((0, local, record.clone()));
            }
        }
        Ok(out)
    }

    /// Records an insert of `value` at `(shard, local)` into the index.
    ///
    /// Called inside the record mutation's lock scope. A concurrently
    /// dropped index is left alone.
    pub fn apply_insert(
        &self,
        paths: &DbPaths,
        field: &str,
        shard: usize,
        local: usize,
        value: &Value,
    ) -> Result<()> {
        let _guard = FileLock::acquire(&paths.field_index(field), &self.lock_opts)?;
        let Some(mut index) = self.load_local_opt(paths, field)? else {
            return Ok(());
        };

        let encoded = encode_value(value);
        index.add(shard, &encoded, local);
        write_json_atomic(&paths.field_index(field), &index)?;

        if let Some(mut global) = self.load_global(paths, field)? {
            global.add(&encoded, shard);
            write_json_atomic(&paths.global_field_index(field), &global)?;
        }
        Ok(())
    }

    /// Records the removal of `value` at `(shard, local)` from the index,
    /// pruning global entries whose last live match disappeared.
    pub fn apply_delete(
        &self,
        paths: &DbPaths,
        field: &str,
        shard: usize,
        local: usize,
        value: &Value,
    ) -> Result<()> {
        let _guard = FileLock::acquire(&paths.field_index(field), &self.lock_opts)?;
        let Some(mut index) = self.load_local_opt(paths, field)? else {
            return Ok(());
        };

        let encoded = encode_value(value);
        let shard_emptied = index.remove(shard, &encoded, local);
        write_json_atomic(&paths.field_index(field), &index)?;

        if shard_emptied {
            if let Some(mut global) = self.load_global(paths, field)? {
                global.remove(&encoded, shard);
                write_json_atomic(&paths.global_field_index(field), &global)?;
            }
        }
        Ok(())
    }

    /// Decodes the local index, failing if it is absent.
    pub fn load_local(&self, paths: &DbPaths, field: &str) -> Result<LocalFieldIndex> {
        self.load_local_opt(paths, field)?
            .ok_or_else(|| Error::IndexNotFound {
                db: paths.stem().to_string(),
                field: field.to_string(),
            })
    }

    fn load_local_opt(&self, paths: &DbPaths, field: &str) -> Result<Option<LocalFieldIndex>> {
        read_json_opt(&paths.field_index(field), self.read_retries)
    }

    /// Decodes the global index if one exists.
    pub fn load_global(&self, paths: &DbPaths, field: &str) -> Result<Option<GlobalFieldIndex>> {
        read_json_opt(&paths.global_field_index(field), self.read_retries)
    }

    /// Global keys of live records whose `field` equals `value`.
    ///
    /// For sharded databases the global map selects the shards to consult;
    /// an absent value answers empty without touching any shard's entries.
    pub fn matching_keys(
        &self,
        paths: &DbPaths,
        field: &str,
        value: &Value,
    ) -> Result<RoaringTreemap> {
        let encoded = encode_value(value);
        let mut keys = RoaringTreemap::new();

        if self.shards.is_sharded(paths) {
            let manifest = self.shards.read_manifest(paths)?;
            let candidate_shards: Vec<usize> = match self.load_global(paths, field)? {
                Some(global) => {
                    let shards = global.shards_for(&encoded);
                    if shards.is_empty() {
                        return Ok(keys);
                    }
                    shards.to_vec()
                }
                None => (0..manifest.shards.len()).collect(),
            };

            let index = self.load_local(paths, field)?;
            for shard in candidate_shards {
                let Some(span) = manifest.shards.get(shard) else {
                    continue;
                };
                for local in index.local_keys(shard, &encoded) {
                    keys.insert((span.start + local) as u64);
                }
            }
        } else {
            let index = self.load_local(paths, field)?;
            for local in index.local_keys(0, &encoded) {
                keys.insert(*local as u64);
            }
        }
        Ok(keys)
    }
}

fn remove_if_present(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(format!("remove {} failed: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::storage::document::StoredDocument;
    use crate::storage::{DocumentStore, ReadCache};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_root() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir()
            .join("nonedb_test_fidx")
            .join(format!("root_{}_{}", std::process::id(), id));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn setup(shard_size: usize) -> (FieldIndexManager, ShardManager, DbPaths, PathBuf) {
        let root = temp_root();
        let config = DatabaseConfig::new(&root, "secret").with_shard_size(shard_size);
        let store = DocumentStore::new(Arc::new(ReadCache::new()), &config);
        let shards = ShardManager::new(store, &config);
        let paths = DbPaths::new(&root, "secret", "cities").unwrap();
        (
            FieldIndexManager::new(shards.clone(), &config),
            shards,
            paths,
            root,
        )
    }

    /// 300 records: city Istanbul for keys 0-99, Ankara 100-199, Izmir
    /// 200-299, then migrated with the given shard size.
    fn seed_cities(shards: &ShardManager, paths: &DbPaths) {
        let mut doc = StoredDocument::new("cities");
        for i in 0..300 {
            let city = match i / 100 {
                0 => "Istanbul",
                1 => "Ankara",
                _ => "Izmir",
            };
            doc.insert(Record::new().with_field("city", city).with_field("n", i))
                .unwrap();
        }
        write_json_atomic(&paths.body(), &doc).unwrap();
        shards.migrate(paths).unwrap();
    }

    #[test]
    fn test_create_builds_exact_shard_map() {
        let (fields, shards, paths, root) = setup(100);
        seed_cities(&shards, &paths);

        fields.create(&paths, "city").unwrap();

        let global = fields.load_global(&paths, "city").unwrap().unwrap();
        assert_eq!(global.shards_for(&encode_value(&json!("Istanbul"))), &[0]);
        assert_eq!(global.shards_for(&encode_value(&json!("Ankara"))), &[1]);
        assert_eq!(global.shards_for(&encode_value(&json!("Izmir"))), &[2]);
        assert!(global.shards_for(&encode_value(&json!("Bursa"))).is_empty());

        let local = fields.load_local(&paths, "city").unwrap();
        assert_eq!(
            local.local_keys(1, &encode_value(&json!("Ankara"))).len(),
            100
        );

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_create_twice_fails() {
        let (fields, shards, paths, root) = setup(100);
        seed_cities(&shards, &paths);

        fields.create(&paths, "city").unwrap();
        assert!(matches!(
            fields.create(&paths, "city"),
            Err(Error::IndexExists { .. })
        ));

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_create_on_missing_database_fails() {
        let (fields, _shards, paths, root) = setup(100);
        assert!(matches!(
            fields.create(&paths, "city"),
            Err(Error::DatabaseNotFound(_))
        ));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_delete_prunes_emptied_shard_entry() {
        let (fields, shards, paths, root) = setup(100);

        // Mixed shard 0: Istanbul and Ankara; shard 1: Izmir.
        let mut doc = StoredDocument::new("cities");
        for city in ["Istanbul", "Ankara", "Istanbul"] {
            doc.insert(Record::new().with_field("city", city)).unwrap();
        }
        write_json_atomic(&paths.body(), &doc).unwrap();
        shards.migrate(&paths).unwrap();

        // A fourth record lands in its own shard.
        let mut manifest = shards.read_manifest(&paths).unwrap();
        let mut shard1 = StoredDocument::new("cities");
        shard1
            .insert(Record::new().with_field("city", "Izmir"))
            .unwrap();
        shards.write_shard(&paths, 1, &shard1).unwrap();
        manifest.shards.push(crate::shard::ShardSpan { start: 100, len: 1 });
        shards.write_manifest(&paths, &manifest).unwrap();

        fields.create(&paths, "city").unwrap();
        let istanbul = encode_value(&json!("Istanbul"));

        // Delete both Istanbul records from shard 0.
        fields
            .apply_delete(&paths, "city", 0, 0, &json!("Istanbul"))
            .unwrap();
        let global = fields.load_global(&paths, "city").unwrap().unwrap();
        assert_eq!(global.shards_for(&istanbul), &[0]);

        fields
            .apply_delete(&paths, "city", 0, 2, &json!("Istanbul"))
            .unwrap();
        let global = fields.load_global(&paths, "city").unwrap().unwrap();
        assert!(global.shards_for(&istanbul).is_empty());
        assert!(!global.shard_map.contains_key(&istanbul));
        assert_eq!(global.shards_for(&encode_value(&json!("Ankara"))), &[0]);
        assert_eq!(global.shards_for(&encode_value(&json!("Izmir"))), &[1]);

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_insert_extends_both_maps() {
        let (fields, shards, paths, root) = setup(100);
        seed_cities(&shards, &paths);
        fields.create(&paths, "city").unwrap();

        fields
            .apply_insert(&paths, "city", 2, 77, &json!("Istanbul"))
            .unwrap();

        let global = fields.load_global(&paths, "city").unwrap().unwrap();
        assert_eq!(
            global.shards_for(&encode_value(&json!("Istanbul"))),
            &[0, 2]
        );

        let keys = fields
            .matching_keys(&paths, "city", &json!("Istanbul"))
            .unwrap();
        assert!(keys.contains(277));
        assert_eq!(keys.len(), 101);

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_matching_keys_shard_skip_on_absent_value() {
        let (fields, shards, paths, root) = setup(100);
        seed_cities(&shards, &paths);
        fields.create(&paths, "city").unwrap();

        let keys = fields
            .matching_keys(&paths, "city", &json!("Bursa"))
            .unwrap();
        assert!(keys.is_empty());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_matching_keys_are_global() {
        let (fields, shards, paths, root) = setup(100);
        seed_cities(&shards, &paths);
        fields.create(&paths, "city").unwrap();

        let keys = fields
            .matching_keys(&paths, "city", &json!("Izmir"))
            .unwrap();
        assert_eq!(keys.len(), 100);
        assert!(keys.contains(200));
        assert!(keys.contains(299));
        assert!(!keys.contains(199));

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_index_equality_is_strict() {
        let (fields, shards, paths, root) = setup(100);

        let mut doc = StoredDocument::new("cities");
        doc.insert(Record::new().with_field("v", 1)).unwrap();
        doc.insert(Record::new().with_field("v", "1")).unwrap();
        doc.insert(Record::new().with_field("v", true)).unwrap();
        doc.insert(Record::new().with_field("v", json!(null))).unwrap();
        write_json_atomic(&paths.body(), &doc).unwrap();
        shards.migrate(&paths).unwrap();

        fields.create(&paths, "v").unwrap();

        let one = fields.matching_keys(&paths, "v", &json!(1)).unwrap();
        assert_eq!(one.iter().collect::<Vec<_>>(), vec![0]);

        let one_str = fields.matching_keys(&paths, "v", &json!("1")).unwrap();
        assert_eq!(one_str.iter().collect::<Vec<_>>(), vec![1]);

        // null is an indexable value of its own.
        let null = fields.matching_keys(&paths, "v", &json!(null)).unwrap();
        assert_eq!(null.iter().collect::<Vec<_>>(), vec![3]);

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_drop_and_list() {
        let (fields, shards, paths, root) = setup(100);
        seed_cities(&shards, &paths);

        fields.create(&paths, "city").unwrap();
        fields.create(&paths, "n").unwrap();
        assert_eq!(fields.list(&paths).unwrap(), vec!["city", "n"]);

        fields.drop_index(&paths, "city").unwrap();
        assert_eq!(fields.list(&paths).unwrap(), vec!["n"]);
        assert!(!paths.global_field_index("city").exists());

        assert!(matches!(
            fields.drop_index(&paths, "city"),
            Err(Error::IndexNotFound { .. })
        ));

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_legacy_database_has_no_global_index() {
        let (fields, _shards, paths, root) = setup(100);

        let mut doc = StoredDocument::new("cities");
        doc.insert(Record::new().with_field("city", "Istanbul"))
            .unwrap();
        write_json_atomic(&paths.body(), &doc).unwrap();

        fields.create(&paths, "city").unwrap();
        assert!(paths.field_index("city").exists());
        assert!(!paths.global_field_index("city").exists());

        let keys = fields
            .matching_keys(&paths, "city", &json!("Istanbul"))
            .unwrap();
        assert_eq!(keys.iter().collect::<Vec<_>>(), vec![0]);

        fs::remove_dir_all(root).unwrap();
    }
}
