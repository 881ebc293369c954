//! Single entry point for every worker event.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::{ClientMessage, Event, EventOutcome, Notification, PushPayload};
use super::fetch::Dispatcher;
use super::lifecycle::Lifecycle;
use super::sync::BackgroundSync;
use crate::cache::{CacheLayer, CacheStorage, MutationQueue};
use crate::config::Config;
use crate::network::Network;

pub struct Router<S: CacheStorage + MutationQueue, N: Network> {
  dispatcher: Dispatcher<S, N>,
  lifecycle: Lifecycle<S, N>,
  sync: BackgroundSync<S, N>,
  sync_tag: String,
  periodic_tag: String,
}

impl<S: CacheStorage + MutationQueue, N: Network> Router<S, N> {
  pub fn from_config(storage: Arc<S>, network: Arc<N>, config: &Config) -> Result<Self> {
    let layer = CacheLayer::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      config.bucket_names(),
    );

    Ok(Self {
      dispatcher: Dispatcher::from_config(layer.clone(), config)?,
      lifecycle: Lifecycle::from_config(layer, config)?,
      sync: BackgroundSync::from_config(storage, network, config)?,
      sync_tag: config.sync.tag.clone(),
      periodic_tag: config.sync.periodic_tag.clone(),
    })
  }

  pub fn dispatcher(&self) -> &Dispatcher<S, N> {
    &self.dispatcher
  }

  pub fn lifecycle(&self) -> &Lifecycle<S, N> {
    &self.lifecycle
  }

  pub async fn dispatch(&self, event: Event) -> Result<EventOutcome> {
    debug!(event = event.name(), "dispatching");

    match event {
      Event::Install => {
        let install = self.lifecycle.install().await?;
        let activate = if install.skip_waiting {
          Some(self.lifecycle.activate().await?)
        } else {
          None
        };
        Ok(EventOutcome::Installed { install, activate })
      }

      Event::Activate => Ok(EventOutcome::Activated(self.lifecycle.activate().await?)),

      Event::Fetch(request) => Ok(EventOutcome::Fetched(
        self.dispatcher.handle(&request).await?,
      )),

      Event::Sync { tag } => self.on_sync(&tag, &self.sync_tag).await,

      Event::PeriodicSync { tag } => self.on_sync(&tag, &self.periodic_tag).await,

      Event::Message(value) => match ClientMessage::parse(&value) {
        Some(ClientMessage::SkipWaiting) => {
          info!("skip waiting requested by page");
          let activate = if self.lifecycle.skip_waiting() {
            Some(self.lifecycle.activate().await?)
          } else {
            None
          };
          Ok(EventOutcome::SkipWaiting { activate })
        }
        None => Ok(EventOutcome::Ignored(format!("unknown message {}", value))),
      },

      Event::Push(None) => Ok(EventOutcome::Ignored("push without data".to_string())),

      Event::Push(Some(data)) => {
        let payload: PushPayload = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to parse push payload: {}", e))?;
        Ok(EventOutcome::ShowNotification(Notification::from_push(
          payload,
        )))
      }

      Event::NotificationClick { action, .. } => match action.as_deref() {
        Some("open") => Ok(EventOutcome::OpenWindow("/".to_string())),
        _ => Ok(EventOutcome::NotificationClosed),
      },

      Event::NotificationClose { tag } => {
        info!(tag = tag.as_deref().unwrap_or(""), "notification closed");
        Ok(EventOutcome::NotificationClosed)
      }
    }
  }

  async fn on_sync(&self, tag: &str, expected: &str) -> Result<EventOutcome> {
    if tag != expected {
      warn!(tag, "ignoring unknown sync tag");
      return Ok(EventOutcome::Ignored(format!("unknown sync tag {}", tag)));
    }
    Ok(EventOutcome::Synced(self.sync.run().await))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, NewMutation, SqliteStorage};
  use crate::http::{Request, Response};
  use crate::network::testing::FakeNetwork;
  use crate::worker::{FetchOutcome, WorkerState};
  use bytes::Bytes;
  use serde_json::json;

  fn router() -> (
    Router<SqliteStorage, FakeNetwork>,
    Arc<SqliteStorage>,
    Arc<FakeNetwork>,
  ) {
    let config = Config::from_origin("https://app.test").unwrap();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let router =
      Router::from_config(Arc::clone(&storage), Arc::clone(&network), &config).unwrap();
    (router, storage, network)
  }

  fn serve_manifest(network: &FakeNetwork) {
    let config = Config::from_origin("https://app.test").unwrap();
    for path in &config.routes.static_manifest {
      network.route(
        "GET",
        config.resolve(path).unwrap().as_str(),
        Response::new(200),
      );
    }
  }

  #[tokio::test]
  async fn test_install_activates_immediately() {
    let (router, storage, network) = router();
    storage.open("todoapp-static-v0.9.0").unwrap();
    serve_manifest(&network);

    let outcome = router.dispatch(Event::Install).await.unwrap();
    match outcome {
      EventOutcome::Installed { install, activate } => {
        assert_eq!(install.cached.len(), 7);
        let activate = activate.unwrap();
        assert_eq!(activate.deleted, vec!["todoapp-static-v0.9.0"]);
      }
      other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(router.lifecycle().state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_fetch_event_goes_through_dispatcher() {
    let (router, _storage, network) = router();
    network.route(
      "GET",
      "https://app.test/api/todos",
      Response::new(200).with_body("[]"),
    );

    let request = Request::get("https://app.test/api/todos").unwrap();
    let outcome = router.dispatch(Event::Fetch(request)).await.unwrap();
    match outcome {
      EventOutcome::Fetched(FetchOutcome::Handled(handled)) => {
        assert_eq!(handled.source, CacheSource::Network);
      }
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_sync_tags() {
    let (router, storage, network) = router();
    storage.enqueue(&NewMutation::post("/api/todos", "{}")).unwrap();
    network.route("POST", "https://app.test/api/todos", Response::new(201));

    let ignored = router
      .dispatch(Event::Sync {
        tag: "something-else".to_string(),
      })
      .await
      .unwrap();
    assert!(matches!(ignored, EventOutcome::Ignored(_)));
    assert_eq!(storage.pending().unwrap().len(), 1);

    // The periodic tag is not accepted as a one-shot sync
    let ignored = router
      .dispatch(Event::Sync {
        tag: "todo-sync".to_string(),
      })
      .await
      .unwrap();
    assert!(matches!(ignored, EventOutcome::Ignored(_)));

    let synced = router
      .dispatch(Event::Sync {
        tag: "background-sync-todos".to_string(),
      })
      .await
      .unwrap();
    match synced {
      EventOutcome::Synced(report) => assert_eq!(report.replayed.len(), 1),
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_periodic_sync() {
    let (router, _storage, _network) = router();
    let outcome = router
      .dispatch(Event::PeriodicSync {
        tag: "todo-sync".to_string(),
      })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Synced(report) if report.is_empty()));
  }

  #[tokio::test]
  async fn test_skip_waiting_message_before_install() {
    let (router, _storage, _network) = router();
    let outcome = router
      .dispatch(Event::Message(json!({"type": "SKIP_WAITING"})))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::SkipWaiting { activate: None }));
    assert!(router.lifecycle().skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let (router, _storage, _network) = router();
    let outcome = router
      .dispatch(Event::Message(json!({"type": "HELLO"})))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Ignored(_)));
  }

  #[tokio::test]
  async fn test_push() {
    let (router, _storage, _network) = router();

    let outcome = router.dispatch(Event::Push(None)).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Ignored(_)));

    let data = Bytes::from_static(br#"{"title":"Reminder","body":"Walk the dog"}"#);
    match router.dispatch(Event::Push(Some(data))).await.unwrap() {
      EventOutcome::ShowNotification(n) => {
        assert_eq!(n.title, "Reminder");
        assert_eq!(n.badge, "/icons/badge-72x72.png");
      }
      other => panic!("unexpected outcome {:?}", other),
    }

    let garbage = Bytes::from_static(b"not json");
    assert!(router.dispatch(Event::Push(Some(garbage))).await.is_err());
  }

  #[tokio::test]
  async fn test_notification_click() {
    let (router, _storage, _network) = router();

    let open = router
      .dispatch(Event::NotificationClick {
        action: Some("open".to_string()),
        tag: None,
      })
      .await
      .unwrap();
    assert!(matches!(open, EventOutcome::OpenWindow(path) if path == "/"));

    for action in [Some("dismiss".to_string()), None] {
      let outcome = router
        .dispatch(Event::NotificationClick { action, tag: None })
        .await
        .unwrap();
      assert!(matches!(outcome, EventOutcome::NotificationClosed));
    }
  }
}
