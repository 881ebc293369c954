//! The network collaborator the strategies fall back on.

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use thiserror::Error;

use crate::http::{Headers, Redirect, Request, Response};

const MAX_REDIRECTS: usize = 10;

/// Why a fetch never produced a response.
///
/// A non-2xx status is not an error here; it is a response.
#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("request to {url} timed out after {timeout:?}")]
  Timeout { url: String, timeout: Duration },
  #[error("could not connect to {url}: {message}")]
  Connect { url: String, message: String },
  #[error("request to {url} failed: {message}")]
  Other { url: String, message: String },
}

/// Anything that can perform a request.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// `reqwest`-backed network with a hard per-request deadline.
///
/// Requests marked [`Redirect::Manual`] go through a client that never
/// follows 3xx, so the proxy hands redirects back to the browser untouched.
#[derive(Clone)]
pub struct HttpNetwork {
  following: reqwest::Client,
  manual: reqwest::Client,
  timeout: Duration,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let following = reqwest::Client::builder()
      .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    let manual = reqwest::Client::builder()
      .redirect(reqwest::redirect::Policy::none())
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      following,
      manual,
      timeout,
    })
  }

  fn client(&self, redirect: Redirect) -> &reqwest::Client {
    match redirect {
      Redirect::Follow => &self.following,
      Redirect::Manual => &self.manual,
    }
  }

  async fn send(&self, request: &Request) -> Result<Response, NetworkError> {
    let url = request.url.to_string();
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes()).map_err(|e| {
      NetworkError::Other {
        url: url.clone(),
        message: e.to_string(),
      }
    })?;

    let mut builder = self
      .client(request.redirect)
      .request(method, request.url.clone());
    for (name, value) in request.headers.iter() {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder.send().await.map_err(|e| classify_error(&url, self.timeout, e))?;

    let status = resp.status();
    let headers: Headers = resp
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
      .collect();
    let body: Bytes = resp.bytes().await.map_err(|e| classify_error(&url, self.timeout, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      headers,
      body,
    })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    match tokio::time::timeout(self.timeout, self.send(request)).await {
      Ok(result) => result,
      Err(_) => Err(NetworkError::Timeout {
        url: request.url.to_string(),
        timeout: self.timeout,
      }),
    }
  }
}

fn classify_error(url: &str, timeout: Duration, err: reqwest::Error) -> NetworkError {
  if err.is_timeout() {
    NetworkError::Timeout {
      url: url.to_string(),
      timeout,
    }
  } else if err.is_connect() {
    NetworkError::Connect {
      url: url.to_string(),
      message: err.to_string(),
    }
  } else {
    NetworkError::Other {
      url: url.to_string(),
      message: err.to_string(),
    }
  }
}


#[cfg(test)]
mod tests {
  use super::testing::silent_listener;
  use super::*;

  #[tokio::test]
  async fn test_unreachable_host_is_an_error_not_a_response() {
    let network = HttpNetwork::new(Duration::from_secs(2)).unwrap();
    // Port 9 (discard) on localhost is closed in test environments.
    let request = Request::get("http://127.0.0.1:9/api/todos").unwrap();

    let err = network.fetch(&request).await.unwrap_err();
    assert!(matches!(
      err,
      NetworkError::Connect { .. } | NetworkError::Other { .. } | NetworkError::Timeout { .. }
    ));
  }

  /// Serves one canned HTTP/1.1 answer per connection, picked by path.
  async fn scripted_server(
    answers: Vec<(&'static str, &'static str)>,
  ) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
      while let Ok((mut socket, _)) = listener.accept().await {
        let mut buf = vec![0u8; 4096];
        let n = socket.read(&mut buf).await.unwrap_or(0);
        let head = String::from_utf8_lossy(&buf[..n]).to_string();
        let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
        let answer = answers
          .iter()
          .find(|(p, _)| *p == path)
          .map(|(_, a)| *a)
          .unwrap_or("HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        let _ = socket.write_all(answer.as_bytes()).await;
        let _ = socket.shutdown().await;
      }
    });
    (addr, handle)
  }

  #[tokio::test]
  async fn test_silent_server_times_out() {
    let (addr, server) = silent_listener().await;
    let network = HttpNetwork::new(Duration::from_millis(200)).unwrap();
    let request = Request::get(&format!("http://{}/api/todos", addr)).unwrap();

    let started = std::time::Instant::now();
    let err = network.fetch(&request).await.unwrap_err();

    assert!(matches!(err, NetworkError::Timeout { .. }), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(2));
    server.abort();
  }

  #[tokio::test]
  async fn test_redirects_followed_unless_manual() {
    let (addr, server) = scripted_server(vec![
      (
        "/",
        "HTTP/1.1 302 Found\r\nlocation: /index.html\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
      ),
      (
        "/index.html",
        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 5\r\nconnection: close\r\n\r\nshell",
      ),
    ])
    .await;
    let network = HttpNetwork::new(Duration::from_secs(2)).unwrap();
    let url = format!("http://{}/", addr);

    let followed = network.fetch(&Request::get(&url).unwrap()).await.unwrap();
    assert_eq!(followed.status, 200);
    assert_eq!(followed.body_text(), "shell");

    let manual = network
      .fetch(&Request::get(&url).unwrap().with_redirect(Redirect::Manual))
      .await
      .unwrap();
    assert_eq!(manual.status, 302);
    assert_eq!(manual.headers.get("location"), Some("/index.html"));
    server.abort();
  }
}
