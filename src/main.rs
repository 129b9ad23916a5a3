mod cache;
mod config;
mod http;
mod logging;
mod network;
mod router;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use cache::{CacheResult, CacheStorage, SqliteStorage};
use http::{Request, Response};
use network::HttpNetwork;
use worker::{LifecycleState, ServiceWorker, WindowClient, WorkerMessage};

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "An offline-first request router with a versioned response cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offcache.yaml or $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Site origin, overrides the config file
  #[arg(short, long)]
  origin: Option<String>,

  /// Cache database path, overrides the config file
  #[arg(long)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest for the configured version
  Install,
  /// Activate an installed version, deleting every other cache version
  Activate,
  /// Fetch a path or URL through the router
  Fetch {
    target: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Print only the status line and headers
    #[arg(long)]
    head: bool,
  },
  /// Send a form submission, queueing it for background sync when offline
  Submit {
    target: String,
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Content type of the body
    #[arg(long, default_value = "application/x-www-form-urlencoded")]
    content_type: String,
  },
  /// Replay queued submissions for a sync tag
  Sync { tag: String },
  /// Render a push payload, optionally resolving a click on it
  Push {
    /// JSON payload, e.g. '{"title":"New post","url":"/blog/new"}'
    payload: String,
    /// Simulate a click with this action (use "" for a click on the body)
    #[arg(long)]
    click: Option<String>,
    /// Open window as ID=URL, may be repeated
    #[arg(long = "client")]
    clients: Vec<String>,
  },
  /// Post a control message, e.g. '{"type":"GET_VERSION"}'
  Message { json: String },
  /// List cache stores, their entries and queued submissions
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(database) = args.database {
    config.database = Some(database);
  }

  let _log_guard = logging::init(&config.logging)?;

  let storage = Arc::new(SqliteStorage::open(config.database.as_deref())?);
  let network = Arc::new(HttpNetwork::new(Duration::from_secs(config.timeout_secs))?);
  let worker = ServiceWorker::new(&config, Arc::clone(&storage), network)?;

  match args.command {
    Command::Install => {
      let count = worker.install().await?;
      println!("installed {} ({} entries)", worker.cache_name(), count);
      if worker.is_skip_waiting() {
        let report = worker.activate().await?;
        for name in &report.deleted {
          println!("deleted {}", name);
        }
        println!("activated {}", worker.cache_name());
      }
    }
    Command::Activate => {
      if worker.state() == LifecycleState::Activated {
        println!("{} is already active", worker.cache_name());
        return Ok(());
      }
      let report = worker.activate().await?;
      for name in &report.deleted {
        println!("deleted {}", name);
      }
      for name in &report.failed {
        println!("failed to delete {}", name);
      }
      if worker.clients_claimed() {
        println!("activated {}", worker.cache_name());
      }
    }
    Command::Fetch {
      target,
      navigate,
      head,
    } => {
      worker.start().await?;
      let url = config.resolve(&target)?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      tracing::debug!(strategy = %worker.strategy_for(request.url.path()), "Fetching");
      let result = worker.handle_fetch(&request).await?;
      print_response(&result, head)?;
      worker.settle().await;
    }
    Command::Submit {
      target,
      method,
      data,
      content_type,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request = Request::get(config.resolve(&target)?).with_method(method);
      if let Some(data) = data {
        request = request
          .with_header("content-type", content_type)
          .with_body(data);
      }
      let result = worker.submit(&request).await?;
      print_response(&result, false)?;
    }
    Command::Sync { tag } => {
      let report = worker.handle_sync(&tag).await?;
      println!(
        "{}: {} replayed, {} still queued",
        tag, report.replayed, report.remaining
      );
    }
    Command::Push {
      payload,
      click,
      clients,
    } => match worker.handle_push(payload.as_bytes())? {
      Some(notification) => {
        println!("{}", serde_json::to_string_pretty(&notification)?);
        if let Some(action) = click {
          let clients = parse_clients(&clients)?;
          let action = (!action.is_empty()).then_some(action.as_str());
          let outcome = worker.handle_notification_click(&notification, action, &clients)?;
          println!("{:?}", outcome);
        }
      }
      None => println!("empty push, no notification"),
    },
    Command::Message { json } => {
      let message = WorkerMessage::parse(&json)?;
      let (tx, rx) = oneshot::channel();
      worker.handle_message(message, Some(tx));
      match rx.await {
        Ok(reply) => println!("{}", serde_json::to_string(&reply)?),
        Err(_) => println!("ok"),
      }
    }
    Command::Caches => {
      for name in storage.store_names()? {
        let marker = if name == worker.cache_name() { "*" } else { " " };
        println!("{} {}", marker, name);
        for entry in storage.entries(&name)? {
          println!(
            "    {} {} {} ({} bytes, cached {})",
            entry.response.status,
            entry.request.method,
            entry.request.url,
            entry.response.body.len(),
            entry.cached_at.format("%Y-%m-%d %H:%M:%S")
          );
        }
      }
      for pending in storage.pending()? {
        println!(
          "  queued {} {} (since {})",
          pending.request.method,
          pending.request.url,
          pending.queued_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
  }

  Ok(())
}

fn print_response(result: &CacheResult<Response>, head_only: bool) -> Result<()> {
  let response = &result.data;
  eprintln!("source: {}", result.source);
  if let Some(cached_at) = result.cached_at {
    eprintln!("cached at: {}", cached_at.to_rfc3339());
  }

  let mut out = std::io::stdout().lock();
  writeln!(out, "{}", response.status)?;
  for (name, value) in &response.headers {
    writeln!(out, "{}: {}", name, value)?;
  }
  if !head_only {
    writeln!(out)?;
    out.write_all(&response.body)?;
  }
  out.flush()?;
  Ok(())
}

fn parse_clients(clients: &[String]) -> Result<Vec<WindowClient>> {
  clients
    .iter()
    .map(|client| -> Result<WindowClient> {
      let (id, url) = client
        .split_once('=')
        .ok_or_else(|| eyre!("Client must be given as ID=URL, got '{}'", client))?;
      Ok(WindowClient {
        id: id.to_string(),
        url: url.to_string(),
      })
    })
    .collect()
}
