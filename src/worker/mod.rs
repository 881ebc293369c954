//! The offline worker.
//!
//! Every platform event enters through [`Router::dispatch`]:
//! - `fetch` is classified and served network-first or cache-first
//! - `install` pre-caches the app shell, `activate` evicts old versions
//! - `sync` / `periodicsync` replay writes queued while offline
//! - `push` and notification events map to notification actions

mod classify;
mod events;
mod fetch;
mod lifecycle;
mod router;
mod sync;

pub use classify::{Classification, Classifier, PassReason, RequestClass, Strategy};
pub use events::{ClientMessage, Event, EventOutcome, Notification, NotificationAction, PushPayload};
pub use fetch::{Dispatcher, FetchError, FetchOutcome, Handled};
pub use lifecycle::{
  ActivateReport, InstallReport, Lifecycle, WorkerState, META_ACTIVE_VERSION, META_INSTALLED_VERSION,
};
pub use router::Router;
pub use sync::{BackgroundSync, SyncReport};
