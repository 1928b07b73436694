//! Shard management.
//!
//! A logical database starts "legacy": one body file holding the whole
//! record sequence. Once it reaches the shard-size threshold (or on explicit
//! migration) it becomes sharded: a manifest plus N shard files, each
//! holding a contiguous run of record slots. The manifest's span table maps
//! global keys to shards; before compaction spans are the trivial
//! `floor(key / shardSize)` layout, afterwards they are whatever the repack
//! produced, so the table is always consulted rather than assumed.

use serde::{Deserialize, Serialize};

use log::info;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::naming::DbPaths;
use crate::record::Record;
use crate::storage::document::{read_json_opt, write_json_atomic, StoredDocument};
use crate::storage::lock::{FileLock, LockOptions};
use crate::storage::DocumentStore;

/// Manifest format version.
const MANIFEST_VERSION: u32 = 1;

/// The contiguous key run held by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpan {
    /// First global key in the shard.
    pub start: usize,
    /// Number of slots, tombstones included.
    pub len: usize,
}

impl ShardSpan {
    fn contains(&self, key: usize) -> bool {
        key >= self.start && key < self.start + self.len
    }
}

/// The shard manifest; its presence on disk marks a database as sharded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub v: u32,
    #[serde(rename = "shardSize")]
    pub shard_size: usize,
    pub shards: Vec<ShardSpan>,
}

impl Manifest {
    /// Creates a manifest with no shards yet.
    pub fn new(shard_size: usize) -> Self {
        Self {
            v: MANIFEST_VERSION,
            shard_size,
            shards: Vec::new(),
        }
    }

    /// Maps a global key to `(shard id, local key)` via the span table.
    pub fn key_to_shard(&self, key: usize) -> Option<(usize, usize)> {
        self.shards
            .iter()
            .enumerate()
            .find(|(_, span)| span.contains(key))
            .map(|(id, span)| (id, key - span.start))
    }

    /// The next global key to be assigned.
    pub fn next_key(&self) -> usize {
        self.shards
            .iter()
            .map(|span| span.start + span.len)
            .max()
            .unwrap_or(0)
    }

    /// Total slot count across all shards.
    pub fn total_slots(&self) -> usize {
        self.shards.iter().map(|span| span.len).sum()
    }
}

/// Summary of a database's physical layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub sharded: bool,
    pub shards: usize,
    #[serde(rename = "totalRecords")]
    pub total_records: usize,
    #[serde(rename = "deletedCount")]
    pub deleted_count: usize,
    #[serde(rename = "shardSize")]
    pub shard_size: usize,
}

/// Outcome status of a migration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrateStatus {
    Migrated,
    AlreadySharded,
    DatabaseNotFound,
}

/// Result of a migration call; idempotent by status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateReport {
    pub success: bool,
    pub status: MigrateStatus,
}

/// Result of a compaction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactReport {
    pub success: bool,
    #[serde(rename = "freedSlots")]
    pub freed_slots: usize,
    #[serde(rename = "totalRecords")]
    pub total_records: usize,
    pub sharded: bool,
}

/// Routes keys and inserts to shards, migrates legacy databases and
/// compacts tombstoned slots.
#[derive(Debug, Clone)]
pub struct ShardManager {
    store: DocumentStore,
    shard_size: usize,
    read_retries: u32,
    lock_opts: LockOptions,
}

impl ShardManager {
    /// Creates a manager over the given store.
    pub fn new(store: DocumentStore, config: &DatabaseConfig) -> Self {
        Self {
            store,
            shard_size: config.shard_size,
            read_retries: config.read_retries,
            lock_opts: LockOptions {
                timeout: config.lock_timeout,
                retry_delay: config.lock_retry_delay,
            },
        }
    }

    /// The configured shard-size threshold.
    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    /// Manifest-file presence test.
    pub fn is_sharded(&self, paths: &DbPaths) -> bool {
        paths.manifest().exists()
    }

    /// Returns true if the database exists in either layout.
    pub fn database_exists(&self, paths: &DbPaths) -> bool {
        paths.body().exists() || paths.manifest().exists()
    }

    /// The file whose lock serializes structural mutations: the manifest
    /// for sharded databases, the body for legacy ones.
    pub fn primary_path(&self, paths: &DbPaths) -> std::path::PathBuf {
        if self.is_sharded(paths) {
            paths.manifest()
        } else {
            paths.body()
        }
    }

    /// Acquires the database's structural write lock.
    ///
    /// The database's cached documents are dropped once the lock is held:
    /// entries cached earlier may predate another process's write.
    pub fn lock_primary(&self, paths: &DbPaths) -> Result<FileLock> {
        let guard = FileLock::acquire(&self.primary_path(paths), &self.lock_opts)?;
        self.store.cache().invalidate_db(paths.root(), paths.stem());
        Ok(guard)
    }

    /// Decodes the manifest.
    pub fn read_manifest(&self, paths: &DbPaths) -> Result<Manifest> {
        read_json_opt(&paths.manifest(), self.read_retries)?
            .ok_or_else(|| Error::DatabaseNotFound(paths.stem().to_string()))
    }

    /// Atomically rewrites the manifest.
    pub fn write_manifest(&self, paths: &DbPaths, manifest: &Manifest) -> Result<()> {
        write_json_atomic(&paths.manifest(), manifest)
    }

    /// Decodes one shard file.
    pub fn read_shard(&self, paths: &DbPaths, id: usize) -> Result<StoredDocument> {
        Ok((*self.store.read(&paths.shard(id))?).clone())
    }

    /// Decodes the legacy body file.
    pub fn read_body(&self, paths: &DbPaths) -> Result<StoredDocument> {
        Ok((*self.store.read(&paths.body())?).clone())
    }

    /// Rewrites the legacy body file. The caller holds the body lock.
    pub fn write_body(&self, paths: &DbPaths, document: &StoredDocument) -> Result<()> {
        self.store.write(&paths.body(), document)
    }

    /// Rewrites one shard file under its own lock.
    pub fn write_shard(&self, paths: &DbPaths, id: usize, document: &StoredDocument) -> Result<()> {
        let path = paths.shard(id);
        let _guard = FileLock::acquire(&path, &self.lock_opts)?;
        self.store.write(&path, document)
    }

    /// The target shard for the next insert: the current last shard while it
    /// has room, otherwise a new shard with id `last + 1`.
    ///
    /// Returns `(shard id, is_new)`.
    pub fn route_for_insert(&self, manifest: &Manifest) -> (usize, bool) {
        match manifest.shards.last() {
            Some(span) if span.len < manifest.shard_size => (manifest.shards.len() - 1, false),
            Some(_) => (manifest.shards.len(), true),
            None => (0, true),
        }
    }

    /// Maps a global key to its shard and local key.
    ///
    /// Legacy databases report shard 0 with the key unchanged.
    pub fn key_to_shard(&self, paths: &DbPaths, key: usize) -> Result<Option<(usize, usize)>> {
        if self.is_sharded(paths) {
            Ok(self.read_manifest(paths)?.key_to_shard(key))
        } else {
            Ok(Some((0, key)))
        }
    }

    /// Converts a legacy single-file database into a sharded one.
    ///
    /// Idempotent: calling it on an already-sharded database reports
    /// `already_sharded`, on a missing one `database_not_found`.
    pub fn migrate(&self, paths: &DbPaths) -> Result<MigrateReport> {
        if self.is_sharded(paths) {
            return Ok(MigrateReport {
                success: true,
                status: MigrateStatus::AlreadySharded,
            });
        }
        if !paths.body().exists() {
            return Ok(MigrateReport {
                success: false,
                status: MigrateStatus::DatabaseNotFound,
            });
        }

        let _guard = self.lock_primary(paths)?;
        let body = self.store.read(&paths.body())?;

        let mut manifest = Manifest::new(self.shard_size);
        let mut start = 0usize;
        let chunks: Vec<&[Option<Record>]> = if body.data.is_empty() {
            vec![&[]]
        } else {
            body.data.chunks(self.shard_size).collect()
        };

        for (id, chunk) in chunks.iter().enumerate() {
            let shard = StoredDocument {
                config: body.config.clone(),
                data: chunk.to_vec(),
            };
            self.store.write(&paths.shard(id), &shard)?;
            manifest.shards.push(ShardSpan {
                start,
                len: chunk.len(),
            });
            start += chunk.len();
        }

        self.write_manifest(paths, &manifest)?;
        self.store.remove(&paths.body())?;

        info!(
            "migrated {} into {} shard(s)",
            paths.stem(),
            manifest.shards.len()
        );
        Ok(MigrateReport {
            success: true,
            status: MigrateStatus::Migrated,
        })
    }

    /// Physical layout summary.
    pub fn shard_info(&self, paths: &DbPaths) -> Result<ShardInfo> {
        if self.is_sharded(paths) {
            let manifest = self.read_manifest(paths)?;
            let mut deleted = 0usize;
            for id in 0..manifest.shards.len() {
                deleted += self.read_shard(paths, id)?.deleted_count();
            }
            Ok(ShardInfo {
                sharded: true,
                shards: manifest.shards.len(),
                total_records: manifest.total_slots(),
                deleted_count: deleted,
                shard_size: manifest.shard_size,
            })
        } else if paths.body().exists() {
            let body = self.store.read(&paths.body())?;
            Ok(ShardInfo {
                sharded: false,
                shards: 1,
                total_records: body.len(),
                deleted_count: body.deleted_count(),
                shard_size: self.shard_size,
            })
        } else {
            Err(Error::DatabaseNotFound(paths.stem().to_string()))
        }
    }

    /// Ordered full scan: shards 0..N in order, live records only, each with
    /// its global key. Legacy databases scan the body the same way.
    pub fn scan(&self, paths: &DbPaths) -> Result<Vec<(usize, Record)>> {
        let mut out = Vec::new();
        if self.is_sharded(paths) {
            let manifest = self.read_manifest(paths)?;
            for (id, span) in manifest.shards.iter().enumerate() {
                let shard = self.read_shard(paths, id)?;
                for (local, record) in shard.iter_live() {
                    out.push((span.start + local, record.clone()));
                }
            }
        } else {
            let body = self.store.read(&paths.body())?;
            for (key, record) in body.iter_live() {
                out.push((key, record.clone()));
            }
        }
        Ok(out)
    }

    /// Drops tombstones and repacks records densely, merging shards when the
    /// live records fit into fewer. Keys shift: the caller is responsible
    /// for rebuilding any index afterwards.
    pub fn compact(&self, paths: &DbPaths) -> Result<CompactReport> {
        if !self.is_sharded(paths) {
            if !paths.body().exists() {
                return Err(Error::DatabaseNotFound(paths.stem().to_string()));
            }
            let _guard = self.lock_primary(paths)?;
            let body = self.store.read(&paths.body())?;

            let mut packed = (*body).clone();
            packed.data.retain(|slot| slot.is_some());
            let freed = body.len() - packed.len();
            self.store.write(&paths.body(), &packed)?;

            info!("compacted {}: freed {} slot(s)", paths.stem(), freed);
            return Ok(CompactReport {
                success: true,
                freed_slots: freed,
                total_records: packed.len(),
                sharded: false,
            });
        }

        let _guard = self.lock_primary(paths)?;
        let manifest = self.read_manifest(paths)?;
        let old_shards = manifest.shards.len();

        // Gather live records in global key order and a config to carry over.
        let mut live = Vec::new();
        let mut config = None;
        for id in 0..old_shards {
            let shard = self.read_shard(paths, id)?;
            if config.is_none() {
                config = Some(shard.config.clone());
            }
            for (_, record) in shard.iter_live() {
                live.push(record.clone());
            }
        }
        let config = config.ok_or_else(|| Error::Corrupt(format!("{} has no shards", paths.stem())))?;
        let freed = manifest.total_slots() - live.len();

        // Repack densely; an empty database keeps one empty shard.
        let chunks: Vec<&[Record]> = if live.is_empty() {
            vec![&[]]
        } else {
            live.chunks(manifest.shard_size).collect()
        };

        let mut packed = Manifest::new(manifest.shard_size);
        let mut start = 0usize;
        for (id, chunk) in chunks.iter().enumerate() {
            let shard = StoredDocument {
                config: config.clone(),
                data: chunk.iter().cloned().map(Some).collect(),
            };
            self.write_shard(paths, id, &shard)?;
            packed.shards.push(ShardSpan {
                start,
                len: chunk.len(),
            });
            start += chunk.len();
        }

        for id in packed.shards.len()..old_shards {
            self.store.remove(&paths.shard(id))?;
        }
        self.write_manifest(paths, &packed)?;

        info!(
            "compacted {}: freed {} slot(s), {} -> {} shard(s)",
            paths.stem(),
            freed,
            old_shards,
            packed.shards.len()
        );
        Ok(CompactReport {
            success: true,
            freed_slots: freed,
            total_records: packed.total_slots(),
            sharded: true,
        })
    }
}
