//! # noneDB Core
//!
//! Core library for noneDB — an embedded, file-backed JSON document database.
//!
//! This crate provides the storage and indexing engine: the sharded document
//! store, field indexes with shard-skip lookups, spatial indexes over GeoJSON
//! fields, and the locking/compaction machinery that keeps them consistent
//! across processes sharing the same files.
//!
//! ## Core Types
//!
//! ### Engine
//!
//! - [`Database`] - The engine facade: `find`/`insert`/`update`/`delete`,
//!   index management, migration and compaction
//! - [`DatabaseConfig`] - Storage root, secret key, shard size, lock policy
//!
//! ### Data
//!
//! - [`Record`] - An ordered JSON-like document at a stable integer key
//! - [`Filter`] - Strict-equality filter over record fields
//!
//! ### Indexes
//!
//! - [`FieldIndexManager`](index::FieldIndexManager) - Per-shard value
//!   indexes plus the global shard map enabling shard-skip
//! - [`SpatialIndexManager`](index::SpatialIndexManager) - Record-key→MBR
//!   indexes over validated GeoJSON geometries
//!
//! ### Geometry
//!
//! - [`Geometry`](geo::Geometry) - Tagged, shape-checked GeoJSON variant
//! - [`Mbr`](geo::Mbr) - Minimum bounding rectangle

pub mod config;
pub mod database;
pub mod error;
pub mod geo;
pub mod index;
pub mod naming;
pub mod record;
pub mod shard;
pub mod storage;

// Re-exports for convenient access
pub use config::DatabaseConfig;
pub use database::{Database, WriteOutcome};
pub use error::{Error, Result};
pub use geo::{Geometry, Mbr};
pub use index::{FieldIndexManager, NearestOptions, SpatialIndexManager};
pub use record::{Filter, Record};
pub use shard::{CompactReport, MigrateReport, MigrateStatus, ShardInfo, ShardManager};
pub use storage::{DocumentStore, ReadCache};

/// Re-export commonly used types for convenience.
///
/// # Example
///
/// ```no_run
/// use nonedb_core::prelude::*;
///
/// # fn main() -> Result<()> {
/// let db = Database::open(DatabaseConfig::new("./data", "secret"));
/// db.insert("users", Record::new().with_field("name", "Ada"))?;
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    pub use crate::{
        Database, DatabaseConfig, Error, Filter, Geometry, Mbr, NearestOptions, Record, Result,
        WriteOutcome,
    };
}
