//! Database naming and on-disk path layout.
//!
//! A logical database name is sanitized down to a safe character set, then
//! prefixed with a deterministic keyed hash of the engine's secret key:
//! `<crc32hex(secret)>-<sanitized>.<suffix>`. Every file belonging to one
//! database shares that stem.
//!
//! # Layout
//!
//! ```text
//! <stem>.nonedb               legacy single-file body
//! <stem>.nonedb.shard{N}      shard N body
//! <stem>.nonedb.manifest      shard manifest (presence = sharded)
//! <stem>.info                 creation timestamp
//! <stem>.nonedb.fidx.<f>      local field index
//! <stem>.nonedb.gfidx.<f>     global field index (shardMap)
//! <stem>.nonedb.spidx.<f>     spatial index
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// File suffix of a local field index, after the body extension.
pub const FIELD_INDEX_KIND: &str = "fidx";
/// File suffix of a global field index.
pub const GLOBAL_INDEX_KIND: &str = "gfidx";
/// File suffix of a spatial index.
pub const SPATIAL_INDEX_KIND: &str = "spidx";

/// Strips a logical database name down to ASCII alphanumerics, space,
/// hyphen and apostrophe.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '\''))
        .collect()
}

/// Deterministic keyed hash used as the file-name prefix.
pub fn file_prefix(secret_key: &str) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(secret_key.as_bytes());
    format!("{:08x}", hasher.finalize())
}

/// Resolved file paths for one logical database.
#[derive(Debug, Clone)]
pub struct DbPaths {
    root: PathBuf,
    stem: String,
}

impl DbPaths {
    /// Resolves the paths for a logical name under the given root.
    ///
    /// Fails if the name sanitizes down to nothing.
    pub fn new(root: &Path, secret_key: &str, name: &str) -> Result<Self> {
        let sanitized = sanitize_name(name);
        if sanitized.is_empty() {
            return Err(Error::Validation(format!(
                "database name '{name}' contains no allowed characters"
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            stem: format!("{}-{}", file_prefix(secret_key), sanitized),
        })
    }

    /// The storage root this database lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The shared file-name stem: `<hash>-<sanitized>`.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Path of the legacy single-file body.
    pub fn body(&self) -> PathBuf {
        self.root.join(format!("{}.nonedb", self.stem))
    }

    /// Path of the creation-timestamp file.
    pub fn info(&self) -> PathBuf {
        self.root.join(format!("{}.info", self.stem))
    }

    /// Path of the shard manifest.
    pub fn manifest(&self) -> PathBuf {
        self.root.join(format!("{}.nonedb.manifest", self.stem))
    }

    /// Path of shard `id`.
    pub fn shard(&self, id: usize) -> PathBuf {
        self.root.join(format!("{}.nonedb.shard{}", self.stem, id))
    }

    /// Path of the local field index for `field`.
    pub fn field_index(&self, field: &str) -> PathBuf {
        self.index_path(FIELD_INDEX_KIND, field)
    }

    /// Path of the global field index for `field`.
    pub fn global_field_index(&self, field: &str) -> PathBuf {
        self.index_path(GLOBAL_INDEX_KIND, field)
    }

    /// Path of the spatial index for `field`.
    pub fn spatial_index(&self, field: &str) -> PathBuf {
        self.index_path(SPATIAL_INDEX_KIND, field)
    }

    fn index_path(&self, kind: &str, field: &str) -> PathBuf {
        self.root
            .join(format!("{}.nonedb.{}.{}", self.stem, kind, field))
    }

    /// Lists the fields that have an index of the given kind on disk.
    pub fn indexed_fields(&self, kind: &str) -> Result<Vec<String>> {
        let prefix = format!("{}.nonedb.{}.", self.stem, kind);
        let mut fields = Vec::new();

        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::Io(format!("read storage root failed: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::Io(format!("read dir entry failed: {e}")))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(field) = name.strip_prefix(&prefix) {
                    if !field.is_empty() && !field.ends_with(".lock") && !field.ends_with(".tmp") {
                        fields.push(field.to_string());
                    }
                }
            }
        }

        fields.sort();
        Ok(fields)
    }
}

/// Rejects field names that cannot form a safe index file suffix.
pub fn validate_field_name(field: &str) -> Result<()> {
    let safe = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if !safe {
        return Err(Error::Validation(format!(
            "field name '{field}' cannot be indexed"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("users"), "users");
        assert_eq!(sanitize_name("O'Brien's list"), "O'Brien's list");
        assert_eq!(sanitize_name("a/b\\c..d"), "abcd");
        assert_eq!(sanitize_name("../../etc"), "etc");
        assert_eq!(sanitize_name("šø¶"), "");
    }

    #[test]
    fn test_file_prefix_is_deterministic() {
        assert_eq!(file_prefix("secret"), file_prefix("secret"));
        assert_ne!(file_prefix("secret"), file_prefix("other"));
        assert_eq!(file_prefix("secret").len(), 8);
    }

    #[test]
    fn test_paths_share_stem() {
        let p = DbPaths::new(Path::new("/data"), "k", "users").unwrap();
        let stem = p.stem().to_string();

        assert!(p.body().to_str().unwrap().ends_with(&format!("{stem}.nonedb")));
        assert!(p
            .shard(3)
            .to_str()
            .unwrap()
            .ends_with(&format!("{stem}.nonedb.shard3")));
        assert!(p
            .global_field_index("city")
            .to_str()
            .unwrap()
            .ends_with(&format!("{stem}.nonedb.gfidx.city")));
    }

    #[test]
    fn test_unusable_name_fails() {
        assert!(DbPaths::new(Path::new("/data"), "k", "!!!").is_err());
    }

    #[test]
    fn test_validate_field_name() {
        assert!(validate_field_name("city").is_ok());
        assert!(validate_field_name("geo_point-2").is_ok());
        assert!(validate_field_name("").is_err());
        assert!(validate_field_name("a/b").is_err());
        assert!(validate_field_name("a b").is_err());
    }
}
