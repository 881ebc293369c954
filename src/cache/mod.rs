//! Response cache and offline write queue.
//!
//! This module provides the persistent side of the worker:
//! - Named, versioned buckets holding request/response pairs
//! - One entry per request key, overwritten by newer responses
//! - Network-first and cache-first strategies over those buckets
//! - A queue of writes captured while offline, replayed by background sync

mod buckets;
mod key;
mod layer;
mod queue;
mod storage;
mod traits;

pub use buckets::{BucketKind, BucketNames};
pub use key::CacheKey;
pub use layer::{CacheLayer, Served};
pub use queue::{MutationQueue, NewMutation, PendingMutation, RetryState};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CacheWrite, CachedResponse};

#[cfg(test)]
pub(crate) use layer::testing;
