//! # noneDB
//!
//! **An embedded, file-backed JSON document database.**
//!
//! noneDB stores named collections of JSON-like records as plain files,
//! queryable by field filters, automatically sharded past a size threshold,
//! and optionally accelerated by field and geospatial indexes.
//!
//! ## Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **Sharded storage** | Databases split into shard files past a threshold |
//! | **Field indexes** | Value indexes with shard-skip lookups |
//! | **Spatial indexes** | GeoJSON validation, MBR pruning, distance/polygon queries |
//! | **Cross-process safety** | Advisory file locks plus atomic temp-file renames |
//! | **Stable keys** | Deletes leave tombstones; keys shift only on compaction |
//!
//! ## Quick Start
//!
//! ```no_run
//! use nonedb::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let db = Database::open(DatabaseConfig::new("./data", "secret"));
//!
//!     // Databases are created on first write.
//!     db.insert("cities", Record::new()
//!         .with_field("city", "Istanbul")
//!         .with_field("population", 15_462_000))?;
//!
//!     let istanbul = db.find("cities", &Filter::new().with_field("city", "Istanbul"))?;
//!     assert_eq!(istanbul.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Indexed Queries
//!
//! ```no_run
//! use nonedb::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let db = Database::open(DatabaseConfig::new("./data", "secret"));
//!
//!     // A field index is built once, then maintained on every mutation.
//!     db.create_field_index("cities", "city")?;
//!
//!     // Lookups for absent values answer without opening a single shard.
//!     let none = db.find("cities", &Filter::new().with_field("city", "Atlantis"))?;
//!     assert!(none.is_empty());
//!     Ok(())
//! }
//! ```
//!
//! ## Geospatial Queries
//!
//! ```no_run
//! use nonedb::prelude::*;
//! use serde_json::json;
//!
//! fn main() -> Result<()> {
//!     let db = Database::open(DatabaseConfig::new("./data", "secret"));
//!
//!     db.insert("places", Record::new()
//!         .with_field("name", "Galata Tower")
//!         .with_field("loc", json!({
//!             "type": "Point",
//!             "coordinates": [28.9741, 41.0256],
//!         })))?;
//!     db.create_spatial_index("places", "loc")?;
//!
//!     // Radius in meters.
//!     let nearby = db.within_distance("places", "loc", 28.9803, 41.0086, 2500.0)?;
//!     assert_eq!(nearby.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! noneDB is organized into two crates:
//!
//! - **`nonedb-core`** — The storage and indexing engine
//! - **`nonedb`** — Main crate that re-exports everything
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`](crate::Result), which uses
//! the [`Error`] enum for error types. Reads degrade gracefully (a missing
//! database finds nothing, an unreadable index falls back to a full scan);
//! writes validate the whole payload before persisting anything.

// Re-export everything from core
pub use nonedb_core::*;
