//! Process-local read cache.
//!
//! Decoded shard bodies are cached per file path so repeated reads of an
//! unchanged file skip JSON decoding. The cache is purely an accelerator:
//! every write invalidates its path immediately, and nothing authoritative
//! lives here. The service is constructed once and passed around by handle,
//! never held as hidden global state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::storage::document::StoredDocument;

/// A process-local cache of decoded documents, keyed by file path.
#[derive(Debug, Default)]
pub struct ReadCache {
    entries: Mutex<HashMap<PathBuf, Arc<StoredDocument>>>,
}

impl ReadCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached document for a path, if present.
    pub fn get(&self, path: &Path) -> Option<Arc<StoredDocument>> {
        self.entries.lock().get(path).cloned()
    }

    /// Stores a decoded document for a path.
    pub fn put(&self, path: &Path, document: Arc<StoredDocument>) {
        self.entries.lock().insert(path.to_path_buf(), document);
    }

    /// Drops the cached entry for a path. Called immediately after any write
    /// to that file.
    pub fn invalidate(&self, path: &Path) {
        if self.entries.lock().remove(path).is_some() {
            debug!("cache invalidated: {}", path.display());
        }
    }

    /// Drops every cached entry belonging to one database: files in `dir`
    /// whose name starts with `stem.`.
    ///
    /// Entries cached before a mutation takes the database's primary lock
    /// may predate another process's committed write, so the lock holder
    /// drops them before reading.
    pub fn invalidate_db(&self, dir: &Path, stem: &str) {
        let prefix = format!("{stem}.");
        self.entries.lock().retain(|path, _| {
            !(path.parent() == Some(dir)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix)))
        });
    }

    /// Drops every cached entry. Operational reset.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Arc<StoredDocument> {
        Arc::new(StoredDocument::new("cache-test"))
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = ReadCache::new();
        let path = Path::new("/tmp/a.nonedb");

        assert!(cache.get(path).is_none());
        cache.put(path, doc());
        assert!(cache.get(path).is_some());

        cache.invalidate(path);
        assert!(cache.get(path).is_none());
    }

    #[test]
    fn test_invalidate_is_per_path() {
        let cache = ReadCache::new();
        cache.put(Path::new("/tmp/a"), doc());
        cache.put(Path::new("/tmp/b"), doc());

        cache.invalidate(Path::new("/tmp/a"));
        assert!(cache.get(Path::new("/tmp/a")).is_none());
        assert!(cache.get(Path::new("/tmp/b")).is_some());
    }

    #[test]
    fn test_invalidate_db_drops_all_database_files() {
        let cache = ReadCache::new();
        cache.put(Path::new("/tmp/abc-t.nonedb"), doc());
        cache.put(Path::new("/tmp/abc-t.nonedb.shard0"), doc());
        cache.put(Path::new("/tmp/abc-t2.nonedb"), doc());

        cache.invalidate_db(Path::new("/tmp"), "abc-t");
        assert!(cache.get(Path::new("/tmp/abc-t.nonedb")).is_none());
        assert!(cache.get(Path::new("/tmp/abc-t.nonedb.shard0")).is_none());
        // A database whose stem merely shares the prefix is untouched.
        assert!(cache.get(Path::new("/tmp/abc-t2.nonedb")).is_some());
    }

    #[test]
    fn test_clear() {
        let cache = ReadCache::new();
        cache.put(Path::new("/tmp/a"), doc());
        cache.put(Path::new("/tmp/b"), doc());

        cache.clear();
        assert!(cache.is_empty());
    }
}
