//! Request and response types the worker operates on.
//!
//! These carry exactly the fields the classifier, the strategies and the
//! cache depend on, so none of that logic needs a real browser or a real
//! socket to be exercised.

use bytes::Bytes;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// HTTP method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
  Other(String),
}

impl Method {
  pub fn parse(s: &str) -> Self {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Self::Get,
      "HEAD" => Self::Head,
      "POST" => Self::Post,
      "PUT" => Self::Put,
      "PATCH" => Self::Patch,
      "DELETE" => Self::Delete,
      "OPTIONS" => Self::Options,
      other => Self::Other(other.to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Options => "OPTIONS",
      Self::Other(s) => s,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Header map with lower-cased names.
///
/// Repeated lines are folded into one comma-separated value, except
/// `set-cookie`, whose lines cannot be joined and are kept apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, Vec<String>>);

const SEPARATE_LINES: &[&str] = &["set-cookie"];

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert a header, replacing any previous value for the same name.
  pub fn insert(&mut self, name: &str, value: impl Into<String>) {
    self.0.insert(name.to_ascii_lowercase(), vec![value.into()]);
  }

  /// Add a header line, keeping earlier lines with the same name.
  pub fn append(&mut self, name: &str, value: impl Into<String>) {
    let name = name.to_ascii_lowercase();
    let value = value.into();
    let separate = SEPARATE_LINES.contains(&name.as_str());

    match self.0.get_mut(&name) {
      Some(values) if separate => values.push(value),
      Some(values) => match values.first_mut() {
        Some(first) => {
          first.push_str(", ");
          first.push_str(&value);
        }
        None => values.push(value),
      },
      None => {
        self.0.insert(name, vec![value]);
      }
    }
  }

  /// The (folded) value, or the first line of a `set-cookie` style header.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .get(&name.to_ascii_lowercase())
      .and_then(|values| values.first())
      .map(String::as_str)
  }

  pub fn get_all(&self, name: &str) -> Vec<&str> {
    self
      .0
      .get(&name.to_ascii_lowercase())
      .map(|values| values.iter().map(String::as_str).collect())
      .unwrap_or_default()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.0.contains_key(&name.to_ascii_lowercase())
  }

  /// Every header line, one pair per line.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .0
      .iter()
      .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut headers = Headers::new();
    for (k, v) in iter {
      headers.append(k.as_ref(), v);
    }
    headers
  }
}

/// How the page issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Full document load (address bar, link click, reload)
  Navigate,
  SameOrigin,
  #[default]
  Cors,
  NoCors,
}

/// What the network does with a 3xx answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Redirect {
  /// Follow up to a fixed number of hops and return the final response
  #[default]
  Follow,
  /// Hand the 3xx back to the caller
  Manual,
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub mode: RequestMode,
  pub redirect: Redirect,
  pub body: Option<Bytes>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      mode: RequestMode::default(),
      redirect: Redirect::default(),
      body: None,
    }
  }

  /// Build a GET request from an absolute URL.
  pub fn get(url: &str) -> Result<Self, url::ParseError> {
    Ok(Self::new(Method::Get, Url::parse(url)?))
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_redirect(mut self, redirect: Redirect) -> Self {
    self.redirect = redirect;
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::Get
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// Whether the `Accept` header asks for an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get("accept")
      .is_some_and(|accept| accept.contains("text/html"))
  }
}

/// A response, either live from the network, replayed from a bucket, or
/// synthesized while offline.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  pub body: Bytes,
}

const OFFLINE_MESSAGE: &str = "You are offline. Please check your connection.";

const OFFLINE_HTML: &str = "<html><body><h1>You are offline</h1>\
<p>Please check your connection and try again.</p></body></html>";

impl Response {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      status_text: canonical_reason(status).to_string(),
      headers: Headers::new(),
      body: Bytes::new(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  /// Status in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get("content-type")
  }

  /// Header names listed in `Vary`, lower-cased. `*` is kept as-is.
  pub fn vary(&self) -> Vec<String> {
    self
      .headers
      .get_all("vary")
      .into_iter()
      .flat_map(|v| v.split(','))
      .map(|name| name.trim().to_ascii_lowercase())
      .filter(|name| !name.is_empty())
      .collect()
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// 503 JSON body returned for API requests with nothing cached.
  pub fn offline_json() -> Self {
    let body = json!({
      "error": "Offline",
      "message": OFFLINE_MESSAGE,
    });
    Self::new(503)
      .with_header("content-type", "application/json")
      .with_body(body.to_string())
  }

  /// Minimal page for navigations with neither a cached copy nor an
  /// offline page.
  pub fn offline_html() -> Self {
    Self::new(200)
      .with_header("content-type", "text/html")
      .with_body(OFFLINE_HTML)
  }
}

fn canonical_reason(status: u16) -> &'static str {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}
