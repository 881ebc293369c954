//! Subcommands.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use crate::cache::{
  CacheStorage, CacheWrite, MutationQueue, NewMutation, PendingMutation, SqliteStorage,
};
use crate::config::Config;
use crate::http::{Method, Request, RequestMode, Response};
use crate::network::HttpNetwork;
use crate::proxy::{self, Proxy};
use crate::todo::{Priority, Todo};
use crate::worker::{
  Event, EventOutcome, FetchOutcome, Router, SyncReport, WorkerState, META_ACTIVE_VERSION,
  META_INSTALLED_VERSION,
};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Pre-cache the app shell and activate this version
  Install,
  /// Evict caches left over from previous versions
  Activate,
  /// Run one request through the worker
  Fetch {
    /// URL or path on the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Accept header to send
    #[arg(long)]
    accept: Option<String>,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Replay queued writes
  Sync {
    /// Sync tag (default: the configured one-shot tag)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Inspect or add to the offline write queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// List caches with entry counts
  Caches,
  /// Show installed version and queue depth
  Status,
  /// Run the local proxy in front of the origin
  Serve {
    /// Listen address (default from config)
    #[arg(long)]
    listen: Option<String>,
  },
  /// Post a message from the page, e.g. '{"type":"SKIP_WAITING"}'
  Message {
    json: String,
  },
  /// Deliver a push, e.g. '{"title":"Reminder","body":"Walk the dog"}'
  Push {
    /// Payload (omit for a push without data)
    json: Option<String>,
  },
  /// Click a notification
  NotificationClick {
    /// Action button, e.g. open or dismiss
    #[arg(long)]
    action: Option<String>,
    #[arg(long)]
    tag: Option<String>,
  },
  /// Close a notification
  NotificationClose {
    #[arg(long)]
    tag: Option<String>,
  },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
  /// Queue a new todo for the next sync
  Add {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    body: String,
    /// low, medium or high
    #[arg(long, default_value = "medium")]
    priority: String,
    #[arg(long)]
    user: String,
    /// Due date, RFC 3339
    #[arg(long)]
    due: Option<String>,
  },
  /// List queued writes
  List {
    /// Show dead-lettered writes instead
    #[arg(long)]
    dead: bool,
  },
}

pub async fn run(command: Command, config: Config) -> Result<()> {
  let storage = Arc::new(SqliteStorage::open(config.database.as_deref())?);
  let network = Arc::new(HttpNetwork::new(config.network.timeout())?);
  let router = Router::from_config(Arc::clone(&storage), network, &config)?;

  match command {
    Command::Install => {
      let outcome = router.dispatch(Event::Install).await?;
      print_outcome(&outcome);
    }

    Command::Activate => {
      router.lifecycle().resume()?;
      let outcome = router.dispatch(Event::Activate).await?;
      print_outcome(&outcome);
    }

    Command::Fetch {
      url,
      method,
      accept,
      navigate,
      data,
    } => {
      let mut request = Request::new(Method::parse(&method.to_uppercase()), config.resolve(&url)?);
      if let Some(accept) = accept {
        request = request.with_header("accept", accept);
      }
      if navigate {
        request = request.with_mode(RequestMode::Navigate);
      }
      if let Some(data) = data {
        request = request
          .with_header("content-type", "application/json")
          .with_body(data);
      }

      match router.dispatch(Event::Fetch(request.clone())).await? {
        EventOutcome::Fetched(FetchOutcome::Handled(handled)) => {
          println!(
            "{} {} ({}, {})",
            handled.response.status,
            handled.response.status_text,
            handled.class.as_str(),
            handled.source.as_str()
          );
          if let Some(cached_at) = handled.cached_at {
            println!("cached at {}", cached_at.to_rfc3339());
          }
          print_cache_write(&handled.cache_write);
          print_body(&handled.response);
        }
        EventOutcome::Fetched(FetchOutcome::PassThrough(reason)) => {
          let response = router.dispatcher().forward(&request).await?;
          println!(
            "{} {} (pass-through: {:?})",
            response.status, response.status_text, reason
          );
          print_body(&response);
        }
        other => print_outcome(&other),
      }
    }

    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      let event = if tag == config.sync.periodic_tag {
        Event::PeriodicSync { tag }
      } else {
        Event::Sync { tag }
      };
      let outcome = router.dispatch(event).await?;
      print_outcome(&outcome);
    }

    Command::Queue { command } => match command {
      QueueCommand::Add {
        title,
        body,
        priority,
        user,
        due,
      } => {
        let priority: Priority = priority.parse()?;
        let mut todo = Todo::new(&title, &user)
          .with_body(&body)
          .with_priority(priority);
        if let Some(due) = due {
          todo = todo.with_due_date(parse_due(&due)?);
        }
        let id = storage.enqueue(&NewMutation::post(
          &config.sync.replay_endpoint,
          todo.to_payload()?,
        ))?;
        println!("queued #{}", id);
      }
      QueueCommand::List { dead } => {
        let items = if dead {
          storage.dead_letters()?
        } else {
          storage.pending()?
        };
        if items.is_empty() {
          println!("queue is empty");
        }
        for item in &items {
          print_mutation(item);
        }
      }
    },

    Command::Caches => {
      let buckets = config.bucket_names();
      for name in storage.bucket_names()? {
        let marker = if buckets.is_current(&name) { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.entry_count(&name)?);
      }
    }

    Command::Status => {
      let state = router.lifecycle().resume()?;
      println!("origin:    {}", config.origin);
      println!("version:   {}", config.version);
      println!("state:     {}", state.as_str());
      println!(
        "installed: {}",
        storage
          .get_meta(META_INSTALLED_VERSION)?
          .unwrap_or_else(|| "-".to_string())
      );
      println!(
        "active:    {}",
        storage
          .get_meta(META_ACTIVE_VERSION)?
          .unwrap_or_else(|| "-".to_string())
      );
      println!("pending:   {}", storage.pending()?.len());
      println!("dead:      {}", storage.dead_letters()?.len());
      if state != WorkerState::Activated {
        println!("run `sw-cache install` to activate this version");
      }
    }

    Command::Serve { listen } => {
      let listen = listen.unwrap_or_else(|| config.proxy.listen.clone());
      let proxy = Proxy::new(router, storage, &config)?;
      proxy::serve(Arc::new(proxy), &listen, config.sync.interval()).await?;
    }

    Command::Message { json } => {
      let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Failed to parse message: {}", e))?;
      router.lifecycle().resume()?;
      let outcome = router.dispatch(Event::Message(value)).await?;
      print_outcome(&outcome);
    }

    Command::Push { json } => {
      let outcome = router.dispatch(Event::Push(json.map(Bytes::from))).await?;
      print_outcome(&outcome);
    }

    Command::NotificationClick { action, tag } => {
      let outcome = router
        .dispatch(Event::NotificationClick { action, tag })
        .await?;
      print_outcome(&outcome);
    }

    Command::NotificationClose { tag } => {
      let outcome = router.dispatch(Event::NotificationClose { tag }).await?;
      print_outcome(&outcome);
    }
  }

  Ok(())
}

fn parse_due(due: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(due)
    .map(|d| d.with_timezone(&Utc))
    .map_err(|e| eyre!("Invalid due date {}: {}", due, e))
}

fn print_cache_write(write: &CacheWrite) {
  match write {
    CacheWrite::Stored { bucket } => println!("stored in {}", bucket),
    CacheWrite::Skipped => {}
    CacheWrite::Failed { bucket, reason } => {
      println!("not cached in {}: {}", bucket, reason)
    }
  }
}

fn print_body(response: &Response) {
  if !response.body.is_empty() {
    println!();
    println!("{}", response.body_text());
  }
}

fn print_mutation(item: &PendingMutation) {
  print!(
    "#{} {} {} attempts={} queued={}",
    item.id,
    item.method,
    item.path,
    item.attempts,
    item.created_at.to_rfc3339()
  );
  match &item.last_error {
    Some(error) => println!(" last_error={}", error),
    None => println!(),
  }
}

fn print_sync(report: &SyncReport) {
  println!(
    "replayed {}, retained {}, dead-lettered {}",
    report.replayed.len(),
    report.retained.len(),
    report.dead_lettered.len()
  );
}

fn print_outcome(outcome: &EventOutcome) {
  match outcome {
    EventOutcome::Installed { install, activate } => {
      println!("installed {} ({} files)", install.bucket, install.cached.len());
      if let Some(activate) = activate {
        print_outcome(&EventOutcome::Activated(activate.clone()));
      }
    }
    EventOutcome::Activated(report) => {
      for name in &report.deleted {
        println!("deleted {}", name);
      }
      for (name, reason) in &report.failed {
        println!("could not delete {}: {}", name, reason);
      }
      println!("activated");
    }
    EventOutcome::Synced(report) => print_sync(report),
    EventOutcome::SkipWaiting { activate } => match activate {
      Some(report) => print_outcome(&EventOutcome::Activated(report.clone())),
      None => println!("skip waiting requested; activates after the next install"),
    },
    EventOutcome::ShowNotification(notification) => {
      match serde_json::to_string_pretty(notification) {
        Ok(json) => println!("{}", json),
        Err(_) => println!("{:?}", notification),
      }
    }
    EventOutcome::OpenWindow(path) => println!("open window {}", path),
    EventOutcome::NotificationClosed => println!("notification closed"),
    EventOutcome::Ignored(reason) => println!("ignored: {}", reason),
    other => println!("{:?}", other),
  }
}
