//! Versioned bucket names.

use std::fmt;

/// Which bucket a strategy writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
  Static,
  Dynamic,
}

/// The two bucket names belonging to the running version.
///
/// Names follow `{prefix}-{purpose}-{version}`. Bumping the version is what
/// makes activation evict the previous buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketNames {
  static_name: String,
  dynamic_name: String,
  version: String,
}

impl BucketNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      static_name: format!("{}-static-{}", prefix, version),
      dynamic_name: format!("{}-dynamic-{}", prefix, version),
      version: version.to_string(),
    }
  }

  /// Use explicit names instead of the prefix/version convention.
  pub fn explicit(static_name: &str, dynamic_name: &str, version: &str) -> Self {
    Self {
      static_name: static_name.to_string(),
      dynamic_name: dynamic_name.to_string(),
      version: version.to_string(),
    }
  }

  pub fn static_name(&self) -> &str {
    &self.static_name
  }

  pub fn dynamic_name(&self) -> &str {
    &self.dynamic_name
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn name(&self, kind: BucketKind) -> &str {
    match kind {
      BucketKind::Static => &self.static_name,
      BucketKind::Dynamic => &self.dynamic_name,
    }
  }

  /// Whether `name` is one of the current version's buckets.
  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_name || name == self.dynamic_name
  }
}

impl fmt::Display for BucketNames {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} / {}", self.static_name, self.dynamic_name)
  }
}
