//! Versioned cache partitions.
//!
//! This module provides:
//! - A storage trait with persistent (SQLite) and in-memory backends
//! - Partition handles that can read and write entries but not delete
//! - The manager that precaches, names and garbage-collects partitions per version

mod manager;
mod memory;
mod storage;
mod traits;

pub use manager::{CacheManager, GcReport, InstallReport, PartitionNames};
pub use memory::MemoryStorage;
pub use storage::{CacheStorage, Partition, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedEntry, RequestKey};
