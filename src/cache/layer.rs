//! Cache layer that orchestrates caching logic with network fetching.

use std::sync::Arc;
use tracing::{debug, warn};

use super::buckets::{BucketKind, BucketNames};
use super::storage::CacheStorage;
use super::traits::{CacheResult, CacheWrite, CachedResponse};
use crate::http::{Request, Response};
use crate::network::{Network, NetworkError};

/// A response plus what happened to its caching side effect.
#[derive(Debug, Clone)]
pub struct Served {
  pub result: CacheResult<Response>,
  pub cache_write: CacheWrite,
}

/// Cache layer that implements the two caching strategies.
///
/// This layer sits between the event router and the network, providing
/// transparent caching with offline support.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  buckets: BucketNames,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, buckets: BucketNames) -> Self {
    Self {
      storage,
      network,
      buckets,
    }
  }

  pub fn buckets(&self) -> &BucketNames {
    &self.buckets
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  /// Network first, cache as the safety net.
  ///
  /// 1. Fetch from network; an ok response is stored in the dynamic bucket
  /// 2. On network failure, serve any cached copy
  /// 3. With nothing cached, hand the network error back so the caller can
  ///    synthesize an offline response
  pub async fn network_first(&self, request: &Request) -> Result<Served, NetworkError> {
    match self.network.fetch(request).await {
      Ok(response) => {
        let cache_write = self.store(BucketKind::Dynamic, request, &response);
        Ok(Served {
          result: CacheResult::from_network(response),
          cache_write,
        })
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "network failed, trying cache");
        match self.lookup(request) {
          Some(cached) => Ok(Served {
            result: CacheResult::from_cache(cached.response, cached.cached_at),
            cache_write: CacheWrite::Skipped,
          }),
          None => Err(err),
        }
      }
    }
  }

  /// Cache first, network on a miss.
  ///
  /// A hit never touches the network. A miss is fetched and an ok response
  /// stored in the bucket for `kind`. Network failures propagate.
  pub async fn cache_first(&self, request: &Request, kind: BucketKind) -> Result<Served, NetworkError> {
    if let Some(cached) = self.lookup(request) {
      debug!(url = %request.url, bucket = %cached.bucket, "cache hit");
      return Ok(Served {
        result: CacheResult::from_cache(cached.response, cached.cached_at),
        cache_write: CacheWrite::Skipped,
      });
    }

    let response = self.network.fetch(request).await?;
    let cache_write = self.store(kind, request, &response);
    Ok(Served {
      result: CacheResult::from_network(response),
      cache_write,
    })
  }

  /// Look a request up in every bucket. Storage errors count as a miss.
  pub fn lookup(&self, request: &Request) -> Option<CachedResponse> {
    match self.storage.match_any(request) {
      Ok(found) => found,
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache lookup failed");
        None
      }
    }
  }

  /// Store an ok response. Failures are reported, never raised.
  fn store(&self, kind: BucketKind, request: &Request, response: &Response) -> CacheWrite {
    if !response.is_ok() {
      return CacheWrite::Skipped;
    }

    let bucket = self.buckets.name(kind).to_string();
    // Bytes clone shares the buffer; the caller's copy stays readable.
    let copy = response.clone();

    match self
      .storage
      .open(&bucket)
      .and_then(|_| self.storage.put(&bucket, request, &copy))
    {
      Ok(()) => {
        debug!(url = %request.url, bucket = %bucket, "cached response");
        CacheWrite::Stored { bucket }
      }
      Err(e) => {
        warn!(url = %request.url, bucket = %bucket, error = %e, "cache write failed");
        CacheWrite::Failed {
          bucket,
          reason: e.to_string(),
        }
      }
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      buckets: self.buckets.clone(),
    }
  }
}
