//! Cache key derivation.

use sha2::{Digest, Sha256};

use crate::http::Request;

/// Canonical identity of a cached request: method plus URL without the
/// fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  description: String,
}

impl CacheKey {
  pub fn for_request(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);

    Self {
      description: format!("{} {}", request.method, url),
    }
  }

  /// Human-readable form, e.g. `GET https://app.test/api/todos`
  pub fn description(&self) -> &str {
    &self.description
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description.as_bytes());
    hex::encode(hasher.finalize())
  }
}
