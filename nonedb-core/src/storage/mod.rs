//! Storage layer: shard-file documents, cross-process locking and the
//! process-local read cache.

pub mod cache;
pub mod document;
pub mod lock;

pub use cache::ReadCache;
pub use document::{DocConfig, DocumentStore, StoredDocument};
pub use lock::{FileLock, LockOptions};
