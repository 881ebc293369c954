mod cache;
mod commands;
mod config;
mod http;
mod network;
mod proxy;
mod todo;
mod worker;

use clap::Parser;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sw-cache")]
#[command(about = "Offline-first request cache and background sync for the TodoApp web client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sw-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin to sit in front of, e.g. https://todo.example.com
  #[arg(long, global = true)]
  origin: Option<String>,

  /// Cache database (default: $XDG_DATA_HOME/sw-cache/cache.db)
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  /// Verbose logging
  #[arg(long, global = true)]
  debug: bool,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log level comes from `--debug`, then `RUST_LOG`, then defaults to info.
/// With a log directory, a daily-rotated file gets the same events.
fn init_tracing(debug: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = if debug {
    EnvFilter::new("sw_cache=debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sw_cache=info"))
  };

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "sw-cache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

fn load_config(args: &Args) -> Result<config::Config> {
  // --origin alone is enough to run without a config file
  let config = match (&args.config, &args.origin) {
    (None, Some(origin)) if config::Config::find_config_file().is_none() => {
      config::Config::from_origin(origin)?
    }
    _ => config::Config::load(args.config.as_deref())?,
  };

  let mut config = config.apply_env()?;

  if let Some(origin) = &args.origin {
    config = config.with_origin(origin)?;
  }
  if let Some(database) = &args.database {
    config.database = Some(database.clone());
  }

  Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = load_config(&args)?;
  let _guard = init_tracing(args.debug, config.log_dir.as_deref());

  tracing::debug!(origin = %config.origin, version = %config.version, "config loaded");

  commands::run(args.command, config).await
}
