mod agent;
mod cache;
mod clients;
mod config;
mod host;
mod http;
mod lifecycle;
mod network;
mod offline;
mod strategy;
mod sync;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::agent::Agent;
use crate::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use crate::http::Request;
use crate::network::HttpFetcher;

#[derive(Parser, Debug)]
#[command(name = "offline-agent")]
#[command(about = "Request-interception agent with offline caching and deferred sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-agent/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep the cache in memory instead of the on-disk database
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the manifest
  Install,
  /// Drop partitions of other versions and seed business data
  Activate,
  /// Run one request through the agent
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Deliver a sync wake-up
  Sync { tag: String },
  /// List cache partitions
  Partitions,
  /// Read host commands from stdin
  Run,
}

/// Log to a daily file in the data directory; stdout carries command output.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = config::data_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "offline-agent.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter =
    EnvFilter::try_from_env("OFFLINE_AGENT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let storage: Arc<dyn CacheStorage> = if args.ephemeral {
    Arc::new(MemoryStorage::new())
  } else {
    Arc::new(SqliteStorage::open()?)
  };
  let fetcher = Arc::new(HttpFetcher::new()?);
  let agent = Agent::new(config, storage, fetcher)?;

  match args.command {
    Command::Install => {
      let report = agent.install().await?;
      println!(
        "Installed {} static assets, {} offline pages, {} critical endpoints",
        report.static_assets, report.offline_pages, report.critical_endpoints
      );
      for miss in &report.misses {
        println!("  not cached: {}", miss);
      }
    }
    Command::Activate => {
      let report = agent.activate()?;
      for partition in &report.deleted_partitions {
        println!("Deleted {}", partition);
      }
      if report.seeded {
        println!("Seeded business data");
      }
    }
    Command::Fetch {
      url,
      method,
      body,
      navigate,
    } => {
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request = Request::new(method, agent.context().config.resolve_url(&url)?);
      if let Some(body) = body {
        request = request
          .with_header("content-type", "application/json")
          .with_body(body);
      }
      if navigate {
        request = request.navigate();
      }

      let response = agent.handle_fetch(request).await;
      println!("{}", host::describe(&response));
      for tag in agent.take_sync_tags() {
        println!("Sync registered: {}", tag);
      }
    }
    Command::Sync { tag } => {
      agent.on_sync_wake(&tag).await?;
      println!("Sync {} finished", tag);
    }
    Command::Partitions => {
      let storage = &agent.context().storage;
      for partition in storage.partitions()? {
        println!("{}\t{}", partition, storage.keys(&partition)?.len());
      }
    }
    Command::Run => host::run(agent).await?,
  }

  Ok(())
}
