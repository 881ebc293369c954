//! Core types shared by the storage backends and the strategies.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response read back out of a bucket.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// Bucket the entry was found in
  pub bucket: String,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Result from a strategy, including data and metadata about the source.
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
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data replayed from a bucket.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Nothing live and nothing cached; `data` was synthesized.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::OfflineFallback,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the network
  Network,
  /// Stored response from a bucket
  Cache,
  /// Synthesized offline page or offline JSON
  OfflineFallback,
}

impl CacheSource {
  pub fn as_str(self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::OfflineFallback => "offline",
    }
  }
}

/// What happened to the caching side effect of a request.
///
/// Caching is best-effort: a `Failed` write never turns a good network
/// response into a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWrite {
  /// Response stored in the named bucket
  Stored { bucket: String },
  /// Nothing to store (cache hit, non-ok status, or offline fallback)
  Skipped,
  /// The bucket could not be opened or written
  Failed { bucket: String, reason: String },
}

impl CacheWrite {
  pub fn is_failed(&self) -> bool {
    matches!(self, CacheWrite::Failed { .. })
  }
}
