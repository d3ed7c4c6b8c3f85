mod cache;
mod config;
mod host;
mod http;
mod logging;
mod message;
mod net;
mod offline;
mod router;
mod sync;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;

use cache::{MemoryStorage, SqliteStorage, Store};
use host::ConsoleHost;
use http::Request;
use message::ControlMessage;
use net::ReqwestFetcher;
use worker::ServiceWorker;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Parser, Debug)]
#[command(name = "wbs-sw")]
#[command(about = "Offline worker for the WBS web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/wbs-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep caches in memory for this run instead of the cache database
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the asset list into the current cache
  Install,
  /// Delete every cache but the current one
  Activate,
  /// Route one request through the worker and print the response
  Fetch {
    /// Absolute URL, or a path resolved against the app origin
    target: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request header as "Name: value"; repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Post a control message, e.g. '{"type":"CLEAR_CACHE"}'
  Message { json: String },
  /// Run a background sync
  Sync {
    #[arg(long, default_value = sync::SYNC_REPORTS)]
    tag: String,
  },
  /// Run a periodic sync
  PeriodicSync {
    #[arg(long, default_value = sync::UPDATE_DASHBOARD)]
    tag: String,
  },
  /// Deliver a push message
  Push { text: Option<String> },
  /// Simulate a click on the push notification
  NotificationClick {
    #[arg(long)]
    action: Option<String>,
  },
  /// Remove one entry from the current cache
  Evict {
    /// Absolute URL, or a path resolved against the app origin
    target: String,
  },
  /// List caches and the outbox
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let database = match &config.database {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  let log_dir = database
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."));
  let _log_guard = logging::init(&log_dir)?;

  let fetcher = Arc::new(ReqwestFetcher::new(
    &config.origin_url()?,
    config.fetch_timeout(),
  )?);

  if args.ephemeral {
    let storage = Arc::new(MemoryStorage::new());
    let worker = ServiceWorker::new(config, storage, fetcher, ConsoleHost)?;
    run(&worker, args.command).await
  } else {
    let storage = Arc::new(SqliteStorage::open_at(&database)?);
    let worker = ServiceWorker::new(config, storage, fetcher, ConsoleHost)?;
    run(&worker, args.command).await
  }
}

async fn run<S: Store + 'static>(
  worker: &ServiceWorker<S, ReqwestFetcher, ConsoleHost>,
  command: Command,
) -> Result<()> {
  let cache_name = worker.config().cache_name.clone();

  match command {
    Command::Install => {
      let result = worker.install().await;
      println!("state: {}", worker.state());
      result?;

      let entries = worker.storage().keys(&cache_name)?.len();
      println!("installed {} ({} entries)", cache_name, entries);
      println!("skip waiting: {}", worker.is_skip_waiting());
    }
    Command::Activate => {
      worker.activate().await?;
      println!("state: {}", worker.state());
      println!("activated {}", cache_name);
      println!("clients claimed: {}", worker.clients_claimed());
    }
    Command::Evict { target } => {
      let request = Request::get(worker.config().resolve(&target)?);
      let removed = worker.storage().delete_entry(&cache_name, &request)?;
      println!("{} {}", if removed { "evicted" } else { "not cached:" }, request.url);
    }
    Command::Fetch {
      target,
      method,
      headers,
      data,
    } => {
      let request = build_request(worker, &target, &method, &headers, data)?;
      let routed = worker.handle_fetch(&request).await;
      // The CLI exits right after, so give detached cache writes a chance to land
      worker.settle().await;

      let routed =
        routed.ok_or_else(|| eyre!("Network error: nothing to serve for {}", request.url))?;
      let response = &routed.response;
      println!(
        "{} {} ({})",
        response.status, response.status_text, routed.source
      );
      for (name, value) in &response.headers {
        println!("{}: {}", name, value);
      }
      println!();
      println!("{}", response.text());
    }
    Command::Message { json } => {
      let message = ControlMessage::parse(&json)?;
      let (tx, rx) = oneshot::channel();
      worker.handle_message(message, Some(tx)).await?;

      // Only some messages are answered; a dropped port means no reply
      if let Ok(reply) = rx.await {
        let json = serde_json::to_string(&reply)
          .map_err(|e| eyre!("Failed to serialize reply: {}", e))?;
        println!("{}", json);
      }
      println!("skip waiting: {}", worker.is_skip_waiting());
    }
    Command::Sync { tag } => match worker.handle_sync(&tag).await? {
      Some(summary) => println!(
        "delivered {}, still pending {}",
        summary.delivered, summary.kept
      ),
      None => println!("ignored sync tag {}", tag),
    },
    Command::PeriodicSync { tag } => {
      let refreshed = worker.handle_periodic_sync(&tag).await;
      println!("refreshed: {}", refreshed);
    }
    Command::Push { text } => worker.handle_push(text.as_deref())?,
    Command::NotificationClick { action } => {
      worker.handle_notification_click(action.as_deref())?
    }
    Command::Caches => {
      let storage = worker.storage();
      if !storage.has_cache(&cache_name)? {
        println!("current cache {} is not installed", cache_name);
      }
      for name in storage.cache_names()? {
        let marker = if name == cache_name { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.keys(&name)?.len());
      }

      let pending = storage.pending()?;
      println!("outbox: {} pending", pending.len());
      for entry in pending {
        println!(
          "  #{} {} {} queued {} attempts {}",
          entry.id,
          entry.request.method,
          entry.request.url,
          entry.queued_at.format(TIME_FORMAT),
          entry.attempts
        );
        if let (Some(at), Some(error)) = (entry.last_attempt_at, &entry.last_error) {
          println!("    last attempt {}: {}", at.format(TIME_FORMAT), error);
        }
      }
    }
  }

  Ok(())
}

fn build_request<S: Store + 'static>(
  worker: &ServiceWorker<S, ReqwestFetcher, ConsoleHost>,
  target: &str,
  method: &str,
  headers: &[String],
  data: Option<String>,
) -> Result<Request> {
  let url = worker.config().resolve(target)?;
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = Request::new(method, url);
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Header must look like 'Name: value', got '{}'", header))?;
    request = request.with_header(name.trim(), value.trim());
  }
  if let Some(body) = data {
    request = request.with_body(body);
  }

  Ok(request)
}
