//! Error types for noneDB operations.

use thiserror::Error;

/// Result type alias using noneDB's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during noneDB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed payload, reserved-field misuse or empty field list.
    #[error("validation error: {0}")]
    Validation(String),

    /// The named database does not exist on disk.
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// Attempted to create a database that already exists.
    #[error("database already exists: {0}")]
    DatabaseExists(String),

    /// No index of the requested kind exists for the field.
    #[error("index not found on field '{field}' of database '{db}'")]
    IndexNotFound { db: String, field: String },

    /// Attempted to create an index that already exists.
    #[error("index already exists on field '{field}' of database '{db}'")]
    IndexExists { db: String, field: String },

    /// Exclusive lock acquisition timed out.
    #[error("lock timeout on {0}")]
    LockTimeout(String),

    /// A file exceeds the configured maximum size.
    #[error("file {path} exceeds maximum size: {size} > {max}")]
    Capacity { path: String, size: u64, max: u64 },

    /// Invalid GeoJSON geometry. The message names the offending attribute.
    #[error("geometry error: {0}")]
    Geometry(String),

    /// On-disk state that cannot be decoded.
    #[error("corrupt database file: {0}")]
    Corrupt(String),

    /// IO error during storage operations.
    #[error("io error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Capacity {
            path: "a.nonedb".into(),
            size: 2048,
            max: 1024,
        };
        assert_eq!(
            err.to_string(),
            "file a.nonedb exceeds maximum size: 2048 > 1024"
        );
    }

    #[test]
    fn test_reserved_field_message_names_key() {
        let err = Error::Validation("reserved field 'key' is not allowed in records".into());
        assert!(err.to_string().contains("key"));
    }
}
