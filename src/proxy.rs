//! Local reverse proxy that runs every browser request through the worker.
//!
//! Point the app at the listen address and it behaves as if the worker were
//! installed: reads are served per strategy, offline writes to the replay
//! endpoint are queued for background sync, and queued writes are replayed
//! periodically and as soon as the network answers again.

use axum::{
  body::Body,
  extract::State,
  http::{HeaderName, HeaderValue, StatusCode},
  response::IntoResponse,
};
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::{CacheSource, CacheStorage, MutationQueue, NewMutation};
use crate::config::Config;
use crate::http::{Headers, Method, Redirect, Request, RequestMode, Response};
use crate::network::Network;
use crate::worker::{Event, EventOutcome, FetchOutcome, Handled, Router};

/// Request bodies above this are rejected.
const MAX_BODY: usize = 8 * 1024 * 1024;

/// Tells the client where a response came from.
pub const SOURCE_HEADER: &str = "x-sw-cache";

/// Set to `failed` when a response could not be cached.
pub const CACHE_WRITE_HEADER: &str = "x-sw-cache-write";

const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-connection",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

pub struct Proxy<S: CacheStorage + MutationQueue, N: Network> {
  router: Router<S, N>,
  queue: Arc<S>,
  origin: Url,
  replay_endpoint: String,
  sync_tag: String,
  periodic_tag: String,
  /// Wakes the sync loop once the network answers while writes are queued
  sync_now: Notify,
}

impl<S: CacheStorage + MutationQueue, N: Network> Proxy<S, N> {
  pub fn new(router: Router<S, N>, queue: Arc<S>, config: &Config) -> Result<Self> {
    Ok(Self {
      router,
      queue,
      origin: config.origin_url()?,
      replay_endpoint: config.sync.replay_endpoint.clone(),
      sync_tag: config.sync.tag.clone(),
      periodic_tag: config.sync.periodic_tag.clone(),
      sync_now: Notify::new(),
    })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Answer one request the way the worker would.
  pub async fn respond(&self, request: Request) -> (Response, Option<CacheSource>) {
    let outcome = match self.router.dispatch(Event::Fetch(request.clone())).await {
      Ok(EventOutcome::Fetched(outcome)) => outcome,
      Ok(other) => {
        warn!(?other, "unexpected outcome for fetch");
        return (bad_gateway("unexpected worker outcome"), None);
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "request failed");
        return (bad_gateway(&e.to_string()), None);
      }
    };

    match outcome {
      FetchOutcome::Handled(handled) => served(handled),
      FetchOutcome::PassThrough(_) => match self.router.dispatcher().forward(&request).await {
        Ok(response) => {
          self.wake_sync_if_pending();
          (response, Some(CacheSource::Network))
        }
        Err(e) if self.should_queue(&request) => match self.enqueue(&request) {
          Ok(response) => {
            info!(url = %request.url, error = %e, "write queued for background sync");
            (response, None)
          }
          Err(qe) => {
            warn!(url = %request.url, error = %qe, "failed to queue write");
            (Response::offline_json(), Some(CacheSource::OfflineFallback))
          }
        },
        Err(e) => {
          warn!(url = %request.url, error = %e, "pass-through request failed");
          (bad_gateway(&e.to_string()), None)
        }
      },
    }
  }

  fn wake_sync_if_pending(&self) {
    match self.queue.pending() {
      Ok(pending) if !pending.is_empty() => {
        debug!(pending = pending.len(), "network is back, requesting sync");
        self.sync_now.notify_one();
      }
      Ok(_) => {}
      Err(e) => warn!(error = %e, "failed to read write queue"),
    }
  }

  /// Replay queued writes under the periodic sync tag.
  pub async fn periodic_sync(&self) -> Result<EventOutcome> {
    self
      .router
      .dispatch(Event::PeriodicSync {
        tag: self.periodic_tag.clone(),
      })
      .await
  }

  /// Replay queued writes under the one-shot sync tag.
  pub async fn sync(&self) -> Result<EventOutcome> {
    self
      .router
      .dispatch(Event::Sync {
        tag: self.sync_tag.clone(),
      })
      .await
  }

  /// Run periodic sync every `period` (if any), plus a one-shot sync
  /// whenever a pass-through request succeeds while writes are queued.
  pub async fn run_sync_loop(&self, period: Option<Duration>) {
    let mut ticker = period.map(|period| {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      ticker
    });

    loop {
      let result = tokio::select! {
        _ = tick(&mut ticker) => self.periodic_sync().await,
        _ = self.sync_now.notified() => self.sync().await,
      };
      match result {
        Ok(EventOutcome::Synced(report)) if !report.is_empty() => info!(
          replayed = report.replayed.len(),
          retained = report.retained.len(),
          dead_lettered = report.dead_lettered.len(),
          "background sync finished"
        ),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "background sync failed"),
      }
    }
  }

  fn should_queue(&self, request: &Request) -> bool {
    !request.is_get()
      && request.method != Method::Head
      && request.url.origin() == self.origin.origin()
      && request.path() == self.replay_endpoint
  }

  fn enqueue(&self, request: &Request) -> Result<Response> {
    let mutation = NewMutation {
      method: request.method.clone(),
      path: request.path().to_string(),
      body: request.body.as_ref().map(|b| b.to_vec()).unwrap_or_default(),
    };
    let id = self.queue.enqueue(&mutation)?;

    let body = serde_json::json!({ "queued": true, "id": id });
    Ok(
      Response::new(202)
        .with_header("content-type", "application/json")
        .with_body(body.to_string()),
    )
  }
}

async fn tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(ticker) => {
      ticker.tick().await;
    }
    None => std::future::pending().await,
  }
}

fn served(handled: Handled) -> (Response, Option<CacheSource>) {
  let mut response = handled.response;
  if handled.cache_write.is_failed() {
    warn!(cache_write = ?handled.cache_write, "response served but not cached");
    response.headers.insert(CACHE_WRITE_HEADER, "failed".to_string());
  }
  (response, Some(handled.source))
}

fn bad_gateway(message: &str) -> Response {
  Response::new(502)
    .with_header("content-type", "text/plain; charset=utf-8")
    .with_body(message.to_string())
}

/// Build the axum app. Every path goes through the worker.
pub fn app<S, N>(proxy: Arc<Proxy<S, N>>) -> axum::Router
where
  S: CacheStorage + MutationQueue + 'static,
  N: Network + 'static,
{
  axum::Router::new().fallback(handle::<S, N>).with_state(proxy)
}

/// Serve until ctrl-c, with background sync running alongside.
pub async fn serve<S, N>(
  proxy: Arc<Proxy<S, N>>,
  listen: &str,
  sync_interval: Option<Duration>,
) -> Result<()>
where
  S: CacheStorage + MutationQueue + 'static,
  N: Network + 'static,
{
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;

  info!(listen, origin = %proxy.origin(), ?sync_interval, "proxy listening");

  let sync_task = {
    let proxy = Arc::clone(&proxy);
    tokio::spawn(async move { proxy.run_sync_loop(sync_interval).await })
  };

  let result = axum::serve(listener, app(proxy).into_make_service())
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("shutting down");
    })
    .await
    .map_err(|e| eyre!("Proxy server error: {}", e));

  sync_task.abort();
  result
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle<S, N>(
  State(proxy): State<Arc<Proxy<S, N>>>,
  request: axum::extract::Request,
) -> axum::response::Response
where
  S: CacheStorage + MutationQueue + 'static,
  N: Network + 'static,
{
  let (parts, body) = request.into_parts();
  let body = match axum::body::to_bytes(body, MAX_BODY).await {
    Ok(b) => b,
    Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
  };

  let request = match to_worker_request(proxy.origin(), &parts, body) {
    Ok(r) => r,
    Err(e) => {
      debug!(error = %e, "rejecting request");
      return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
  };

  let (response, source) = proxy.respond(request).await;
  to_axum_response(response, source)
}

/// Rewrite an incoming request onto the origin.
pub(crate) fn to_worker_request(
  origin: &Url,
  parts: &axum::http::request::Parts,
  body: Bytes,
) -> Result<Request> {
  // Path and query only; the authority always comes from the origin.
  let mut url = origin.clone();
  url.set_path(parts.uri.path());
  url.set_query(parts.uri.query());

  let headers: Headers = parts
    .headers
    .iter()
    .filter(|(name, _)| forwardable(name.as_str()))
    .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v.to_string())))
    .collect();

  let mode = match headers.get("sec-fetch-mode") {
    Some("navigate") => RequestMode::Navigate,
    Some("same-origin") => RequestMode::SameOrigin,
    Some("no-cors") => RequestMode::NoCors,
    _ => RequestMode::Cors,
  };

  // 3xx answers go back to the browser as-is
  let mut request = Request::new(Method::parse(parts.method.as_str()), url)
    .with_mode(mode)
    .with_redirect(Redirect::Manual);
  request.headers = headers;
  if !body.is_empty() {
    request.body = Some(body);
  }
  Ok(request)
}

fn forwardable(name: &str) -> bool {
  name != "host" && name != "content-length" && !HOP_BY_HOP.contains(&name)
}

fn to_axum_response(response: Response, source: Option<CacheSource>) -> axum::response::Response {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut builder = axum::response::Response::builder().status(status);

  for (name, value) in response.headers.iter() {
    if !forwardable(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      builder = builder.header(name, value);
    }
  }
  if let Some(source) = source {
    builder = builder.header(SOURCE_HEADER, source.as_str());
  }

  builder
    .body(Body::from(response.body))
    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheWrite, SqliteStorage};
  use crate::network::testing::FakeNetwork;
  use crate::worker::RequestClass;

  fn proxy() -> (
    Proxy<SqliteStorage, FakeNetwork>,
    Arc<SqliteStorage>,
    Arc<FakeNetwork>,
  ) {
    let config = Config::from_origin("https://app.test").unwrap();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let router =
      Router::from_config(Arc::clone(&storage), Arc::clone(&network), &config).unwrap();
    let proxy = Proxy::new(router, Arc::clone(&storage), &config).unwrap();
    (proxy, storage, network)
  }

  fn parts(method: &str, uri: &str, headers: &[(&str, &str)]) -> axum::http::request::Parts {
    let mut builder = axum::http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
      builder = builder.header(*name, *value);
    }
    builder.body(()).unwrap().into_parts().0
  }

  #[test]
  fn test_rewrites_onto_origin_and_drops_hop_headers() {
    let origin = Url::parse("https://app.test").unwrap();
    let parts = parts(
      "GET",
      "/api/todos?done=false",
      &[
        ("host", "127.0.0.1:8787"),
        ("connection", "keep-alive"),
        ("accept", "application/json"),
        ("sec-fetch-mode", "cors"),
      ],
    );

    let request = to_worker_request(&origin, &parts, Bytes::new()).unwrap();
    assert_eq!(request.url.as_str(), "https://app.test/api/todos?done=false");
    assert_eq!(request.headers.get("accept"), Some("application/json"));
    assert!(!request.headers.contains("host"));
    assert!(!request.headers.contains("connection"));
    assert_eq!(request.mode, RequestMode::Cors);
    assert_eq!(request.redirect, Redirect::Manual);
    assert!(request.body.is_none());
  }

  #[test]
  fn test_authority_in_path_cannot_escape_origin() {
    let origin = Url::parse("https://app.test").unwrap();
    let parts = parts("GET", "//evil.test/api/todos", &[]);
    let request = to_worker_request(&origin, &parts, Bytes::new()).unwrap();
    assert_eq!(request.url.host_str(), Some("app.test"));
  }

  #[test]
  fn test_navigate_mode_from_fetch_metadata() {
    let origin = Url::parse("https://app.test").unwrap();
    let parts = parts("GET", "/dashboard", &[("sec-fetch-mode", "navigate")]);
    let request = to_worker_request(&origin, &parts, Bytes::new()).unwrap();
    assert_eq!(request.mode, RequestMode::Navigate);
  }

  #[tokio::test]
  async fn test_offline_write_to_replay_endpoint_is_queued() {
    let (proxy, storage, network) = proxy();
    network.set_offline(true);

    let request = Request::get("https://app.test/api/todos")
      .unwrap()
      .with_method(Method::Post)
      .with_body(r#"{"title":"Buy milk"}"#);
    let (response, _) = proxy.respond(request).await;

    assert_eq!(response.status, 202);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["queued"], true);

    let pending = storage.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].body, br#"{"title":"Buy milk"}"#.to_vec());
    assert_eq!(body["id"], pending[0].id);
  }

  #[tokio::test]
  async fn test_offline_write_elsewhere_is_not_queued() {
    let (proxy, storage, network) = proxy();
    network.set_offline(true);

    let request = Request::get("https://app.test/api/user")
      .unwrap()
      .with_method(Method::Put)
      .with_body("{}");
    let (response, _) = proxy.respond(request).await;

    assert_eq!(response.status, 502);
    assert!(storage.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_online_write_is_forwarded_not_cached() {
    let (proxy, storage, network) = proxy();
    network.route("POST", "https://app.test/api/todos", Response::new(201));

    let request = Request::get("https://app.test/api/todos")
      .unwrap()
      .with_method(Method::Post)
      .with_body("{}");
    let (response, source) = proxy.respond(request).await;

    assert_eq!(response.status, 201);
    assert_eq!(source, Some(CacheSource::Network));
    assert!(storage.pending().unwrap().is_empty());
    assert!(storage.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_read_gets_offline_json() {
    let (proxy, _storage, network) = proxy();
    network.set_offline(true);

    let (response, source) = proxy
      .respond(Request::get("https://app.test/api/todos").unwrap())
      .await;
    assert_eq!(response.status, 503);
    assert_eq!(source, Some(CacheSource::OfflineFallback));
  }

  #[tokio::test]
  async fn test_static_miss_while_offline_is_bad_gateway() {
    let (proxy, _storage, network) = proxy();
    network.set_offline(true);

    let (response, source) = proxy
      .respond(Request::get("https://app.test/static/js/bundle.js").unwrap())
      .await;
    assert_eq!(response.status, 502);
    assert_eq!(source, None);
  }

  #[test]
  fn test_axum_response_carries_source_header() {
    let response = Response::new(200)
      .with_header("content-type", "application/json")
      .with_header("transfer-encoding", "chunked")
      .with_body("[]");
    let response = to_axum_response(response, Some(CacheSource::Cache));

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[SOURCE_HEADER], "cache");
    assert_eq!(response.headers()["content-type"], "application/json");
    assert!(response.headers().get("transfer-encoding").is_none());
  }

  #[test]
  fn test_axum_response_keeps_every_set_cookie_line() {
    let mut response = Response::new(200);
    response.headers.append("set-cookie", "session=abc; HttpOnly");
    response.headers.append("set-cookie", "theme=dark");
    response.headers.append("vary", "accept");
    response.headers.append("vary", "accept-encoding");

    let response = to_axum_response(response, Some(CacheSource::Network));
    let cookies: Vec<&str> = response
      .headers()
      .get_all("set-cookie")
      .iter()
      .map(|v| v.to_str().unwrap())
      .collect();
    assert_eq!(cookies, vec!["session=abc; HttpOnly", "theme=dark"]);
    assert_eq!(response.headers()["vary"], "accept, accept-encoding");
  }

  #[tokio::test]
  async fn test_redirect_is_handed_back_to_the_browser() {
    let (proxy, storage, network) = proxy();
    network.route(
      "GET",
      "https://app.test/old-dashboard",
      Response::new(301).with_header("location", "/dashboard"),
    );
    network.route("GET", "https://app.test/dashboard", Response::new(200));

    let parts = parts("GET", "/old-dashboard", &[("sec-fetch-mode", "navigate")]);
    let request = to_worker_request(proxy.origin(), &parts, Bytes::new()).unwrap();
    let (response, source) = proxy.respond(request).await;

    assert_eq!(response.status, 301);
    assert_eq!(response.headers.get("location"), Some("/dashboard"));
    assert_eq!(source, Some(CacheSource::Network));
    assert_eq!(network.call_count(), 1);
    assert_eq!(storage.entry_count("todoapp-dynamic-v1.0.0").unwrap(), 0);
  }

  #[test]
  fn test_failed_cache_write_is_reported_to_client() {
    let handled = Handled {
      class: RequestClass::Api,
      response: Response::new(200).with_body("[]"),
      source: CacheSource::Network,
      cached_at: None,
      cache_write: CacheWrite::Failed {
        bucket: "todoapp-dynamic-v1.0.0".to_string(),
        reason: "quota exceeded".to_string(),
      },
    };

    let (response, source) = served(handled);
    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get(CACHE_WRITE_HEADER), Some("failed"));
    assert_eq!(source, Some(CacheSource::Network));

    let response = to_axum_response(response, source);
    assert_eq!(response.headers()[CACHE_WRITE_HEADER], "failed");
  }

  #[test]
  fn test_stored_response_has_no_cache_write_header() {
    let handled = Handled {
      class: RequestClass::Api,
      response: Response::new(200),
      source: CacheSource::Network,
      cached_at: None,
      cache_write: CacheWrite::Stored {
        bucket: "todoapp-dynamic-v1.0.0".to_string(),
      },
    };
    let (response, _) = served(handled);
    assert!(!response.headers.contains(CACHE_WRITE_HEADER));
  }

  #[tokio::test]
  async fn test_periodic_sync_replays_queue() {
    let (proxy, storage, network) = proxy();
    storage
      .enqueue(&NewMutation::post("/api/todos", r#"{"title":"Buy milk"}"#))
      .unwrap();
    network.route("POST", "https://app.test/api/todos", Response::new(201));

    match proxy.periodic_sync().await.unwrap() {
      EventOutcome::Synced(report) => assert_eq!(report.replayed.len(), 1),
      other => panic!("unexpected outcome {:?}", other),
    }
    assert!(storage.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_pass_through_success_wakes_sync_only_with_pending_writes() {
    let (proxy, storage, network) = proxy();
    network.route("PUT", "https://app.test/api/user", Response::new(200));
    let write = || {
      Request::get("https://app.test/api/user")
        .unwrap()
        .with_method(Method::Put)
        .with_body("{}")
    };

    proxy.respond(write()).await;
    let woke = tokio::time::timeout(Duration::from_millis(50), proxy.sync_now.notified()).await;
    assert!(woke.is_err());

    storage.enqueue(&NewMutation::post("/api/todos", "{}")).unwrap();
    proxy.respond(write()).await;
    let woke = tokio::time::timeout(Duration::from_millis(50), proxy.sync_now.notified()).await;
    assert!(woke.is_ok());
  }

  async fn wait_for_empty_queue(storage: &SqliteStorage) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
      while !storage.pending().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .is_ok()
  }

  #[tokio::test]
  async fn test_sync_loop_replays_once_network_returns() {
    let (proxy, storage, network) = proxy();
    let proxy = Arc::new(proxy);
    let task = {
      let proxy = Arc::clone(&proxy);
      tokio::spawn(async move { proxy.run_sync_loop(None).await })
    };

    network.set_offline(true);
    let post = Request::get("https://app.test/api/todos")
      .unwrap()
      .with_method(Method::Post)
      .with_body(r#"{"title":"Buy milk"}"#);
    let (response, _) = proxy.respond(post).await;
    assert_eq!(response.status, 202);

    network.set_offline(false);
    network.route("POST", "https://app.test/api/todos", Response::new(201));
    network.route("PUT", "https://app.test/api/user", Response::new(200));
    let put = Request::get("https://app.test/api/user")
      .unwrap()
      .with_method(Method::Put)
      .with_body("{}");
    proxy.respond(put).await;

    assert!(wait_for_empty_queue(&storage).await);
    task.abort();
  }

  #[tokio::test]
  async fn test_sync_loop_runs_on_interval() {
    let (proxy, storage, network) = proxy();
    storage.enqueue(&NewMutation::post("/api/todos", "{}")).unwrap();
    network.route("POST", "https://app.test/api/todos", Response::new(201));

    let proxy = Arc::new(proxy);
    let task = {
      let proxy = Arc::clone(&proxy);
      tokio::spawn(async move { proxy.run_sync_loop(Some(Duration::from_millis(20))).await })
    };

    assert!(wait_for_empty_queue(&storage).await);
    task.abort();
  }
}
