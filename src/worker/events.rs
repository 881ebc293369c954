//! Platform events delivered to the worker and what it does in response.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::fetch::FetchOutcome;
use super::lifecycle::{ActivateReport, InstallReport};
use super::sync::SyncReport;
use crate::http::Request;

pub const NOTIFICATION_ICON: &str = "/icons/icon-192x192.png";
pub const NOTIFICATION_BADGE: &str = "/icons/badge-72x72.png";
pub const NOTIFICATION_VIBRATE: [u32; 3] = [100, 50, 100];

#[derive(Debug, Clone)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
  Sync { tag: String },
  PeriodicSync { tag: String },
  /// Message posted by a page
  Message(serde_json::Value),
  /// Push message, raw payload if any
  Push(Option<Bytes>),
  NotificationClick {
    action: Option<String>,
    tag: Option<String>,
  },
  NotificationClose { tag: Option<String> },
}

impl Event {
  pub fn name(&self) -> &'static str {
    match self {
      Event::Install => "install",
      Event::Activate => "activate",
      Event::Fetch(_) => "fetch",
      Event::Sync { .. } => "sync",
      Event::PeriodicSync { .. } => "periodicsync",
      Event::Message(_) => "message",
      Event::Push(_) => "push",
      Event::NotificationClick { .. } => "notificationclick",
      Event::NotificationClose { .. } => "notificationclose",
    }
  }
}

/// Messages pages may post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate the waiting worker now
  SkipWaiting,
}

impl ClientMessage {
  /// `None` for anything the worker does not understand.
  pub fn parse(value: &serde_json::Value) -> Option<Self> {
    serde_json::from_value(value.clone()).ok()
  }
}

/// Push payload sent by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
  pub title: String,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

/// A notification to show.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: Option<String>,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: Option<serde_json::Value>,
  pub actions: Vec<NotificationAction>,
}

impl Notification {
  pub fn from_push(payload: PushPayload) -> Self {
    Self {
      title: payload.title,
      body: payload.body,
      icon: NOTIFICATION_ICON.to_string(),
      badge: NOTIFICATION_BADGE.to_string(),
      vibrate: NOTIFICATION_VIBRATE.to_vec(),
      data: payload.data,
      actions: vec![
        NotificationAction {
          action: "open".to_string(),
          title: "Open App".to_string(),
          icon: "/icons/action-open.png".to_string(),
        },
        NotificationAction {
          action: "dismiss".to_string(),
          title: "Dismiss".to_string(),
          icon: "/icons/action-dismiss.png".to_string(),
        },
      ],
    }
  }
}

/// Result of dispatching one event.
#[derive(Debug, Clone)]
pub enum EventOutcome {
  Installed {
    install: InstallReport,
    /// Present when skip-waiting activated the worker right away
    activate: Option<ActivateReport>,
  },
  Activated(ActivateReport),
  Fetched(FetchOutcome),
  Synced(SyncReport),
  /// Skip-waiting requested; activated immediately if already installed
  SkipWaiting { activate: Option<ActivateReport> },
  ShowNotification(Notification),
  /// Notification closed; open a window at this path
  OpenWindow(String),
  /// Notification closed, nothing else to do
  NotificationClosed,
  Ignored(String),
}
