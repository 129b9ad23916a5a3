//! Versioned response cache with offline support.
//!
//! This module provides:
//! - Named response stores keyed by normalized request identity
//! - The cache-first, network-first and stale-while-revalidate strategies
//! - A queue of requests waiting for background sync

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
#[cfg(test)]
pub use storage::testing;
pub use traits::{CacheEntry, CacheResult, CacheSource, CachedResponse, PendingRequest};
