//! Request classification.
//!
//! Precedence: non-GET and non-http(s) requests pass through, then API
//! patterns, then static files, then navigations, then everything else.

use color_eyre::Result;
use regex::Regex;

use crate::cache::BucketKind;
use crate::config::Config;
use crate::http::{Method, Request, RequestMode};

/// Why a request is left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassReason {
  /// Writes always go straight to the network
  NonGet(Method),
  /// Browser-internal schemes (chrome-extension:, data:, ...)
  NonHttpScheme(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Api,
  Static,
  Navigation,
  Default,
}

/// Which strategy a class is served with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NetworkFirst,
  CacheFirst(BucketKind),
}

impl RequestClass {
  pub fn strategy(self) -> Strategy {
    match self {
      RequestClass::Api | RequestClass::Navigation => Strategy::NetworkFirst,
      RequestClass::Static => Strategy::CacheFirst(BucketKind::Static),
      RequestClass::Default => Strategy::CacheFirst(BucketKind::Dynamic),
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      RequestClass::Api => "api",
      RequestClass::Static => "static",
      RequestClass::Navigation => "navigation",
      RequestClass::Default => "default",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
  PassThrough(PassReason),
  Intercept(RequestClass),
}

/// Pure URL/method predicates, built once from configuration.
#[derive(Debug, Clone)]
pub struct Classifier {
  api_patterns: Vec<Regex>,
  static_prefix: String,
  static_extensions: Vec<String>,
}

impl Classifier {
  pub fn new(api_patterns: Vec<Regex>, static_prefix: &str, static_extensions: &[String]) -> Self {
    Self {
      api_patterns,
      static_prefix: static_prefix.to_string(),
      static_extensions: static_extensions
        .iter()
        .map(|e| e.to_ascii_lowercase())
        .collect(),
    }
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self::new(
      config.api_patterns()?,
      &config.routes.static_prefix,
      &config.routes.static_extensions,
    ))
  }

  pub fn classify(&self, request: &Request) -> Classification {
    if !request.is_get() {
      return Classification::PassThrough(PassReason::NonGet(request.method.clone()));
    }

    let scheme = request.url.scheme();
    if scheme != "http" && scheme != "https" {
      return Classification::PassThrough(PassReason::NonHttpScheme(scheme.to_string()));
    }

    let class = if self.is_api(request.path()) {
      RequestClass::Api
    } else if self.is_static(request.path()) {
      RequestClass::Static
    } else if is_navigation(request) {
      RequestClass::Navigation
    } else {
      RequestClass::Default
    };

    Classification::Intercept(class)
  }

  pub fn is_api(&self, path: &str) -> bool {
    self.api_patterns.iter().any(|p| p.is_match(path))
  }

  pub fn is_static(&self, path: &str) -> bool {
    if path.starts_with(&self.static_prefix) {
      return true;
    }
    let path = path.to_ascii_lowercase();
    self.static_extensions.iter().any(|ext| path.ends_with(ext))
  }
}

fn is_navigation(request: &Request) -> bool {
  request.mode == RequestMode::Navigate || request.accepts_html()
}
