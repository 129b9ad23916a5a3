//! Core types for the response cache.

use chrono::{DateTime, Utc};

use crate::http::{Request, Response};

/// A response read back from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response
  pub response: Response,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

/// A stored entry as listed by [`CacheStorage::entries`](super::storage::CacheStorage::entries).
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub request: Request,
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// A request waiting in the background-sync queue.
#[derive(Debug, Clone)]
pub struct PendingRequest {
  /// Queue id, unique even for identical requests
  pub id: i64,
  pub request: Request,
  pub queued_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from a completed network round trip.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for a synthesized offline answer.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }

  /// Create a new cache result for a request that bypassed the cache.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }
}

impl CacheResult<Response> {
  pub fn cached(cached: CachedResponse) -> Self {
    Self::from_cache(cached.response, cached.cached_at)
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from the cache store
  Cache,
  /// Neither cache nor network could answer; synthesized response
  Offline,
  /// Handed straight to the network without consulting the cache
  Passthrough,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheSource::Network => write!(f, "network"),
      CacheSource::Cache => write!(f, "cache"),
      CacheSource::Offline => write!(f, "offline"),
      CacheSource::Passthrough => write!(f, "passthrough"),
    }
  }
}
