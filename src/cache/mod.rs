//! Versioned response partitions.
//!
//! This module provides the storage side of the agent:
//! - Partition naming and version bookkeeping (`CacheNamespace`)
//! - Stored responses keyed by request identity (`CacheEntry`)
//! - SQLite and in-memory backends behind the `CacheStorage` trait
//! - Priority-aware trimming of partitions (`eviction`)

pub mod eviction;
mod entry;
mod namespace;
mod storage;

pub use entry::CacheEntry;
pub use namespace::CacheNamespace;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
