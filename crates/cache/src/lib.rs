//! Bounded local cache of materialized files.
//!
//! Staged tape containers and assembled datasets are written here once and
//! then served from local disk. A SQLite index (`cache.db` in the cache root)
//! tracks each entry's size, creation time, last access and pin state; the
//! files themselves stay authoritative, so an entry whose file is missing or
//! has the wrong size is simply dropped and produced again.
//!
//! # Eviction
//!
//! After every insertion, if the total size exceeds
//! `cleanup_threshold × max_size_bytes`, unpinned entries are evicted in
//! [`EvictionPolicy`] order until the total is at most
//! `cleanup_target × max_size_bytes`. The entry just inserted is never
//! evicted by its own insertion. When pins prevent reaching the budget the
//! insertion still succeeds and the failure shows up in [`CacheStats`].

mod config;
mod db;
pub mod error;
mod key;
mod manager;
mod models;
mod repo;

pub use crate::config::{CacheConfig, EvictionPolicy};
pub use crate::db::Database;
pub use crate::key::CacheKey;
pub use crate::manager::{CacheManager, INDEX_FILE};
pub use crate::models::{CacheEntry, CacheStats, CleanupReport};
