//! Fetch handling: classify, pick a strategy, synthesize offline fallbacks.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::classify::{Classification, Classifier, PassReason, RequestClass, Strategy};
use crate::cache::{CacheLayer, CacheResult, CacheSource, CacheStorage, CacheWrite, Served};
use crate::config::Config;
use crate::http::{Request, Response};
use crate::network::{Network, NetworkError};

/// A request the worker answered itself.
#[derive(Debug, Clone)]
pub struct Handled {
  pub class: RequestClass,
  pub response: Response,
  pub source: CacheSource,
  pub cached_at: Option<DateTime<Utc>>,
  pub cache_write: CacheWrite,
}

impl Handled {
  fn new(class: RequestClass, served: Served) -> Self {
    Self {
      class,
      response: served.result.data,
      source: served.result.source,
      cached_at: served.result.cached_at,
      cache_write: served.cache_write,
    }
  }
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not intercepted; send the request to the network untouched
  PassThrough(PassReason),
  Handled(Handled),
}

/// A cache-first miss that the network could not fill either.
#[derive(Debug, Error)]
#[error("{class} request failed with nothing cached: {source}")]
pub struct FetchError {
  pub class: &'static str,
  #[source]
  pub source: NetworkError,
}

/// Routes intercepted requests to a caching strategy.
pub struct Dispatcher<S: CacheStorage, N: Network> {
  layer: CacheLayer<S, N>,
  classifier: Classifier,
  offline_page: Url,
}

impl<S: CacheStorage, N: Network> Dispatcher<S, N> {
  pub fn new(layer: CacheLayer<S, N>, classifier: Classifier, offline_page: Url) -> Self {
    Self {
      layer,
      classifier,
      offline_page,
    }
  }

  pub fn from_config(layer: CacheLayer<S, N>, config: &Config) -> Result<Self> {
    Ok(Self::new(
      layer,
      Classifier::from_config(config)?,
      config.resolve(&config.routes.offline_page)?,
    ))
  }

  pub fn layer(&self) -> &CacheLayer<S, N> {
    &self.layer
  }

  pub async fn handle(&self, request: &Request) -> Result<FetchOutcome, FetchError> {
    let class = match self.classifier.classify(request) {
      Classification::PassThrough(reason) => {
        debug!(url = %request.url, ?reason, "passing through");
        return Ok(FetchOutcome::PassThrough(reason));
      }
      Classification::Intercept(class) => class,
    };

    debug!(url = %request.url, class = class.as_str(), "intercepted");

    match class.strategy() {
      Strategy::NetworkFirst => match self.layer.network_first(request).await {
        Ok(served) => Ok(FetchOutcome::Handled(Handled::new(class, served))),
        Err(err) => {
          info!(url = %request.url, error = %err, "offline with nothing cached");
          Ok(FetchOutcome::Handled(Handled::new(
            class,
            self.offline_fallback(class),
          )))
        }
      },
      Strategy::CacheFirst(kind) => match self.layer.cache_first(request, kind).await {
        Ok(served) => Ok(FetchOutcome::Handled(Handled::new(class, served))),
        Err(source) => Err(FetchError {
          class: class.as_str(),
          source,
        }),
      },
    }
  }

  /// Send a pass-through request. Never reads or writes a bucket.
  pub async fn forward(&self, request: &Request) -> Result<Response, NetworkError> {
    self.layer.network().fetch(request).await
  }

  fn offline_fallback(&self, class: RequestClass) -> Served {
    let response = match class {
      RequestClass::Navigation => {
        let page = Request::new(crate::http::Method::Get, self.offline_page.clone());
        match self.layer.lookup(&page) {
          Some(cached) => cached.response,
          None => Response::offline_html(),
        }
      }
      _ => Response::offline_json(),
    };

    Served {
      result: CacheResult::offline(response),
      cache_write: CacheWrite::Skipped,
    }
  }
}
