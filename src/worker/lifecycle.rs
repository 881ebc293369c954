//! Worker lifecycle: install, activate, skip-waiting.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage};
use crate::config::Config;
use crate::http::{Method, Request};
use crate::network::Network;

pub const META_INSTALLED_VERSION: &str = "installed_version";
pub const META_ACTIVE_VERSION: &str = "active_version";

/// Worker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Initial state, nothing run yet
  Parsed,
  /// Pre-caching the static shell
  Installing,
  /// Installed, waiting to activate
  Installed,
  /// Evicting old buckets
  Activating,
  /// Active and controlling pages
  Activated,
  /// Install failed or replaced
  Redundant,
}

impl WorkerState {
  pub fn as_str(self) -> &'static str {
    match self {
      WorkerState::Parsed => "parsed",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Activated => "activated",
      WorkerState::Redundant => "redundant",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub bucket: String,
  /// URLs written to the static bucket
  pub cached: Vec<String>,
  /// Whether activation should follow without waiting for pages to close
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
  pub deleted: Vec<String>,
  /// Buckets that could not be deleted, with the reason
  pub failed: Vec<(String, String)>,
  /// Open pages taken over immediately
  pub claimed: bool,
}

/// Lifecycle state machine over a cache layer.
pub struct Lifecycle<S: CacheStorage, N: Network> {
  layer: CacheLayer<S, N>,
  manifest: Vec<Url>,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
}

impl<S: CacheStorage, N: Network> Lifecycle<S, N> {
  pub fn new(layer: CacheLayer<S, N>, manifest: Vec<Url>) -> Self {
    Self {
      layer,
      manifest,
      state: Mutex::new(WorkerState::Parsed),
      skip_waiting: AtomicBool::new(false),
    }
  }

  pub fn from_config(layer: CacheLayer<S, N>, config: &Config) -> Result<Self> {
    let manifest = config
      .routes
      .static_manifest
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;
    Ok(Self::new(layer, manifest))
  }

  pub fn state(&self) -> WorkerState {
    self.state.lock().map(|s| *s).unwrap_or(WorkerState::Redundant)
  }

  fn transition(&self, from: &[WorkerState], to: WorkerState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if !from.contains(&*state) {
      return Err(eyre!(
        "Invalid lifecycle transition {} -> {}",
        state.as_str(),
        to.as_str()
      ));
    }

    *state = to;
    Ok(())
  }

  fn set_state(&self, to: WorkerState) {
    if let Ok(mut state) = self.state.lock() {
      *state = to;
    }
  }

  /// Pick up an install recorded by an earlier run of this version.
  ///
  /// Returns the resulting state.
  pub fn resume(&self) -> Result<WorkerState> {
    let installed = self.layer.storage().get_meta(META_INSTALLED_VERSION)?;
    let active = self.layer.storage().get_meta(META_ACTIVE_VERSION)?;
    let version = self.layer.buckets().version();

    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if *state == WorkerState::Parsed {
      if active.as_deref() == Some(version) {
        *state = WorkerState::Activated;
      } else if installed.as_deref() == Some(version) {
        *state = WorkerState::Installed;
      }
    }
    Ok(*state)
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Ask to activate without waiting for open pages to close.
  ///
  /// Returns whether an installed worker is now ready to activate.
  pub fn skip_waiting(&self) -> bool {
    self.skip_waiting.store(true, Ordering::SeqCst);
    self.state() == WorkerState::Installed
  }

  /// Pre-cache the static manifest.
  ///
  /// All-or-nothing: if any manifest entry cannot be fetched, nothing is
  /// written and the worker becomes redundant, so the previous version
  /// keeps serving.
  pub async fn install(&self) -> Result<InstallReport> {
    self.transition(&[WorkerState::Parsed], WorkerState::Installing)?;
    info!(version = self.layer.buckets().version(), "installing");

    match self.precache().await {
      Ok(cached) => {
        self.set_state(WorkerState::Installed);
        let version = self.layer.buckets().version();
        if let Err(e) = self.layer.storage().set_meta(META_INSTALLED_VERSION, version) {
          warn!(error = %e, "failed to record installed version");
        }

        info!(count = cached.len(), "static files cached");
        Ok(InstallReport {
          bucket: self.layer.buckets().static_name().to_string(),
          cached,
          skip_waiting: self.skip_waiting(),
        })
      }
      Err(e) => {
        error!(error = %e, "install failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<Vec<String>> {
    let network = self.layer.network();
    let fetches = self.manifest.iter().map(|url| {
      let request = Request::new(Method::Get, url.clone());
      async move {
        let response = network
          .fetch(&request)
          .await
          .map_err(|e| eyre!("Failed to pre-cache {}: {}", request.url, e))?;
        if !response.is_ok() {
          return Err(eyre!(
            "Failed to pre-cache {}: HTTP {}",
            request.url,
            response.status
          ));
        }
        Ok::<_, color_eyre::Report>((request, response))
      }
    });

    let fetched = try_join_all(fetches).await?;

    let bucket = self.layer.buckets().static_name();
    self.layer.storage().open(bucket)?;
    let mut cached = Vec::with_capacity(fetched.len());
    for (request, response) in &fetched {
      self.layer.storage().put(bucket, request, response)?;
      cached.push(request.url.to_string());
    }

    Ok(cached)
  }

  /// Evict every bucket that does not belong to the current version, then
  /// claim open pages.
  ///
  /// Eviction failures are logged and reported, never fatal. Activating an
  /// already-active worker just runs eviction again.
  pub async fn activate(&self) -> Result<ActivateReport> {
    self.transition(
      &[WorkerState::Installed, WorkerState::Activated],
      WorkerState::Activating,
    )?;
    info!(buckets = %self.layer.buckets(), "activating");

    let mut report = ActivateReport::default();
    let storage = self.layer.storage();

    match storage.bucket_names() {
      Ok(names) => {
        for name in names {
          if self.layer.buckets().is_current(&name) {
            continue;
          }
          match storage.delete_bucket(&name) {
            Ok(_) => {
              info!(bucket = %name, "deleted old cache");
              report.deleted.push(name);
            }
            Err(e) => {
              warn!(bucket = %name, error = %e, "failed to delete old cache");
              report.failed.push((name, e.to_string()));
            }
          }
        }
      }
      Err(e) => warn!(error = %e, "failed to list caches, skipping eviction"),
    }

    if let Err(e) = storage.set_meta(META_ACTIVE_VERSION, self.layer.buckets().version()) {
      warn!(error = %e, "failed to record active version");
    }

    self.set_state(WorkerState::Activated);
    report.claimed = true;
    info!("activated");
    Ok(report)
  }
}
