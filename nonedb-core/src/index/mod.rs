//! Index subsystems.
//!
//! Indexes are derived caches over the record files: they are created by a
//! full scan, maintained incrementally inside the same lock scope as the
//! record mutation they reflect, and fully rebuildable at any time. Their
//! absence or loss is never fatal; queries fall back to a full scan.

pub mod field;
pub mod spatial;

pub use field::{FieldIndexManager, GlobalFieldIndex, LocalFieldIndex};
pub use spatial::{NearestOptions, SpatialIndex, SpatialIndexManager};
