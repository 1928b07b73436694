//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`Database`](crate::Database) engine instance.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use nonedb_core::DatabaseConfig;
///
/// let config = DatabaseConfig::new("./data", "secret")
///     .with_shard_size(100)
///     .with_lock_timeout(Some(Duration::from_secs(2)));
/// ```
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Root storage directory holding every database file.
    pub root: PathBuf,
    /// Secret key hashed into the file-name prefix.
    pub secret_key: String,
    /// Number of record slots per shard; a legacy database is migrated to
    /// shards once its body reaches this size.
    pub shard_size: usize,
    /// Maximum size of any single database file. Reads and writes beyond
    /// this fail closed rather than truncating.
    pub max_file_size: u64,
    /// How long to wait for an exclusive file lock before failing with a
    /// lock-timeout error. `None` blocks indefinitely.
    pub lock_timeout: Option<Duration>,
    /// Delay between lock acquisition attempts when a timeout is set.
    pub lock_retry_delay: Duration,
    /// Attempts for re-reading a file observed mid-rename as empty.
    pub read_retries: u32,
}

impl DatabaseConfig {
    /// Creates a config with the given storage root and secret key.
    pub fn new<P: Into<PathBuf>, S: Into<String>>(root: P, secret_key: S) -> Self {
        Self {
            root: root.into(),
            secret_key: secret_key.into(),
            shard_size: 500,
            max_file_size: 16 * 1024 * 1024,
            lock_timeout: Some(Duration::from_secs(5)),
            lock_retry_delay: Duration::from_millis(10),
            read_retries: 3,
        }
    }

    /// Sets the shard-size threshold. Chainable.
    pub fn with_shard_size(mut self, shard_size: usize) -> Self {
        self.shard_size = shard_size;
        self
    }

    /// Sets the maximum file size. Chainable.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Sets the lock timeout. Chainable.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the lock retry delay. Chainable.
    pub fn with_lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay = delay;
        self
    }
}
