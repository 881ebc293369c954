//! Background sync: replay writes captured while offline.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{MutationQueue, PendingMutation, RetryState};
use crate::config::Config;
use crate::http::Request;
use crate::network::Network;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Ids replayed successfully and removed from the queue
  pub replayed: Vec<i64>,
  /// Ids that failed and stay queued for the next trigger
  pub retained: Vec<i64>,
  /// Ids that exhausted their attempts
  pub dead_lettered: Vec<i64>,
}

impl SyncReport {
  pub fn is_empty(&self) -> bool {
    self.replayed.is_empty() && self.retained.is_empty() && self.dead_lettered.is_empty()
  }
}

pub struct BackgroundSync<Q: MutationQueue, N: Network> {
  queue: Arc<Q>,
  network: Arc<N>,
  origin: Url,
  max_attempts: u32,
}

impl<Q: MutationQueue, N: Network> BackgroundSync<Q, N> {
  pub fn new(queue: Arc<Q>, network: Arc<N>, origin: Url, max_attempts: u32) -> Self {
    Self {
      queue,
      network,
      origin,
      max_attempts,
    }
  }

  pub fn from_config(queue: Arc<Q>, network: Arc<N>, config: &Config) -> Result<Self> {
    Ok(Self::new(
      queue,
      network,
      config.origin_url()?,
      config.sync.max_attempts,
    ))
  }

  /// Replay every pending mutation once.
  ///
  /// Never fails: a queue that cannot be read yields an empty report, and a
  /// failing item is counted against its attempts without stopping the rest.
  pub async fn run(&self) -> SyncReport {
    let mut report = SyncReport::default();

    let pending = match self.queue.pending() {
      Ok(pending) => pending,
      Err(e) => {
        warn!(error = %e, "failed to read pending mutations");
        return report;
      }
    };

    if pending.is_empty() {
      debug!("no pending mutations");
      return report;
    }

    info!(count = pending.len(), "replaying pending mutations");

    for mutation in &pending {
      match self.replay(mutation).await {
        Ok(()) => match self.queue.remove(mutation.id) {
          Ok(()) => report.replayed.push(mutation.id),
          Err(e) => {
            // Replayed but still queued; it will be sent again.
            warn!(id = mutation.id, error = %e, "failed to dequeue replayed mutation");
            report.retained.push(mutation.id);
          }
        },
        Err(e) => self.fail(mutation, &e.to_string(), &mut report),
      }
    }

    info!(
      replayed = report.replayed.len(),
      retained = report.retained.len(),
      dead_lettered = report.dead_lettered.len(),
      "sync finished"
    );
    report
  }

  async fn replay(&self, mutation: &PendingMutation) -> Result<()> {
    let url = self
      .origin
      .join(&mutation.path)
      .map_err(|e| eyre!("Invalid mutation path {}: {}", mutation.path, e))?;

    let request = Request::new(mutation.method.clone(), url)
      .with_header("content-type", "application/json")
      .with_body(mutation.body.clone());

    let response = self.network.fetch(&request).await?;
    if !response.is_ok() {
      return Err(eyre!("HTTP {} {}", response.status, response.status_text));
    }

    debug!(id = mutation.id, status = response.status, "mutation replayed");
    Ok(())
  }

  fn fail(&self, mutation: &PendingMutation, error: &str, report: &mut SyncReport) {
    match self.queue.record_failure(mutation.id, error, self.max_attempts) {
      Ok(RetryState::Retained { attempts }) => {
        warn!(id = mutation.id, attempts, error, "replay failed, keeping for next sync");
        report.retained.push(mutation.id);
      }
      Ok(RetryState::DeadLettered { attempts }) => {
        warn!(id = mutation.id, attempts, error, "replay failed, giving up");
        report.dead_lettered.push(mutation.id);
      }
      Err(e) => {
        warn!(id = mutation.id, error = %e, "failed to record replay failure");
        report.retained.push(mutation.id);
      }
    }
  }
}
