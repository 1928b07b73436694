//! Shard-file document storage.
//!
//! One physical shard file is a JSON document `{config, data}` where `data`
//! is the record sequence: a record's index in the sequence is its key, and
//! a deleted record leaves a `null` tombstone so later keys stay stable.
//!
//! All writes go through write-to-temp-file plus atomic rename, so a
//! concurrent reader sees either the old or the new file, never a torn one.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::storage::cache::ReadCache;

/// Format version written into every document config.
pub const DB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Delay before re-reading a file observed empty mid-rename.
const READ_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Per-file metadata stored in the document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocConfig {
    #[serde(rename = "dbName")]
    pub db_name: String,
    pub version: String,
    #[serde(rename = "createdDate")]
    pub created_date: u64,
}

/// A decoded shard file: config plus the record sequence with tombstones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub config: DocConfig,
    pub data: Vec<Option<Record>>,
}

impl StoredDocument {
    /// Creates an empty document for a database.
    pub fn new(db_name: &str) -> Self {
        Self {
            config: DocConfig {
                db_name: db_name.to_string(),
                version: DB_VERSION.to_string(),
                created_date: unix_timestamp(),
            },
            data: Vec::new(),
        }
    }

    /// Total number of slots, tombstones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the document holds no slots at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of live records.
    pub fn live_count(&self) -> usize {
        self.data.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of tombstoned slots.
    pub fn deleted_count(&self) -> usize {
        self.data.iter().filter(|slot| slot.is_none()).count()
    }

    /// Returns the live record at a local key.
    pub fn get(&self, key: usize) -> Option<&Record> {
        self.data.get(key).and_then(|slot| slot.as_ref())
    }

    /// Appends a record; the next key is the current length.
    ///
    /// Fails if the record carries the reserved `key` field.
    pub fn insert(&mut self, record: Record) -> Result<usize> {
        record.validate_fields()?;
        let key = self.data.len();
        self.data.push(Some(record));
        Ok(key)
    }

    /// Tombstones the slot at a local key without renumbering.
    ///
    /// Returns the removed record, or `None` if the slot was already dead.
    pub fn delete(&mut self, key: usize) -> Option<Record> {
        self.data.get_mut(key).and_then(|slot| slot.take())
    }

    /// Merges a field set into the record at a local key.
    ///
    /// Fails if the field set carries the reserved `key` field; returns
    /// `false` when the slot is dead.
    pub fn update(&mut self, key: usize, fields: &Record) -> Result<bool> {
        fields.validate_fields()?;
        match self.data.get_mut(key).and_then(|slot| slot.as_mut()) {
            Some(record) => {
                record.merge(fields);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Iterates live records with their local keys, in key order.
    pub fn iter_live(&self) -> impl Iterator<Item = (usize, &Record)> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(key, slot)| slot.as_ref().map(|record| (key, record)))
    }
}

/// Current unix timestamp in seconds.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Reads and decodes a JSON file, or `None` if it does not exist.
///
/// An empty read can be observed while a concurrent writer is between
/// truncate-free rename steps; it is retried a bounded number of times and
/// then fails hard instead of recursing forever.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path, retries: u32) -> Result<Option<T>> {
    for attempt in 0..=retries {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(format!("read {} failed: {e}", path.display()))),
        };

        if text.trim().is_empty() {
            warn!(
                "empty read of {} (attempt {}/{})",
                path.display(),
                attempt + 1,
                retries + 1
            );
            std::thread::sleep(READ_RETRY_DELAY);
            continue;
        }

        return serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::Corrupt(format!("{}: {e}", path.display())));
    }

    Err(Error::Corrupt(format!(
        "{} still empty after {} attempts",
        path.display(),
        retries + 1
    )))
}

/// Serializes a value and atomically replaces `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Error::Io(format!("serialize {} failed: {e}", path.display())))?;

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp)
        .map_err(|e| Error::Io(format!("create {} failed: {e}", tmp.display())))?;
    file.write_all(&bytes)
        .map_err(|e| Error::Io(format!("write {} failed: {e}", tmp.display())))?;
    file.sync_all()
        .map_err(|e| Error::Io(format!("sync {} failed: {e}", tmp.display())))?;

    fs::rename(&tmp, path)
        .map_err(|e| Error::Io(format!("rename onto {} failed: {e}", path.display())))?;
    Ok(())
}

/// Reads and writes shard files, enforcing the configured maximum file size
/// and keeping the process-local cache coherent.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    cache: Arc<ReadCache>,
    max_file_size: u64,
    read_retries: u32,
}

impl DocumentStore {
    /// Creates a store sharing the given cache handle.
    pub fn new(cache: Arc<ReadCache>, config: &DatabaseConfig) -> Self {
        Self {
            cache,
            max_file_size: config.max_file_size,
            read_retries: config.read_retries,
        }
    }

    /// The shared cache handle.
    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.cache
    }

    /// Returns true if the file exists.
    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Creates an empty document file.
    ///
    /// Fails if the file already exists or the storage directory is missing.
    pub fn create(&self, path: &Path, db_name: &str) -> Result<()> {
        match path.parent() {
            Some(dir) if dir.as_os_str().is_empty() || dir.is_dir() => {}
            _ => {
                return Err(Error::Validation(format!(
                    "storage directory for {} does not exist",
                    path.display()
                )))
            }
        }
        if path.exists() {
            return Err(Error::DatabaseExists(db_name.to_string()));
        }
        self.write(path, &StoredDocument::new(db_name))
    }

    /// Decodes the document at `path`, consulting the cache first.
    ///
    /// Fails closed with [`Error::Capacity`] when the file exceeds the
    /// configured maximum size; never silently truncates.
    pub fn read(&self, path: &Path) -> Result<Arc<StoredDocument>> {
        if let Some(document) = self.cache.get(path) {
            return Ok(document);
        }

        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > self.max_file_size {
                return Err(Error::Capacity {
                    path: path.display().to_string(),
                    size: meta.len(),
                    max: self.max_file_size,
                });
            }
        }

        let document: StoredDocument = read_json_opt(path, self.read_retries)?
            .ok_or_else(|| Error::DatabaseNotFound(path.display().to_string()))?;

        let document = Arc::new(document);
        self.cache.put(path, Arc::clone(&document));
        Ok(document)
    }

    /// Atomically rewrites the whole document and invalidates its cache
    /// entry.
    pub fn write(&self, path: &Path, document: &StoredDocument) -> Result<()> {
        let bytes = serde_json::to_vec(document)
            .map_err(|e| Error::Io(format!("serialize {} failed: {e}", path.display())))?;
        if bytes.len() as u64 > self.max_file_size {
            return Err(Error::Capacity {
                path: path.display().to_string(),
                size: bytes.len() as u64,
                max: self.max_file_size,
            });
        }

        write_json_atomic(path, document)?;
        self.cache.invalidate(path);
        debug!("wrote {} ({} slots)", path.display(), document.len());
        Ok(())
    }

    /// Removes a document file and its cache entry. Missing files are fine.
    pub fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(format!("remove {} failed: {e}", path.display()))),
        }
        self.cache.invalidate(path);
        Ok(())
    }
}
