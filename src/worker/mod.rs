//! The offline worker: lifecycle, request routing and auxiliary events.
//!
//! A worker owns one cache version. It precaches on install, removes other
//! versions on activate, and from then on routes every GET request through the
//! strategy its path selects.

mod messages;
mod push;
mod sync;

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::config::{Config, NotificationConfig};
use crate::http::{Request, Response};
use crate::network::Network;
use crate::router::{Strategy, StrategyTable};

pub use messages::{MessageReply, WorkerMessage};
pub use push::{ClientAction, Notification, WindowClient};
pub use sync::{BackgroundSync, SyncReport};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Created, nothing installed yet
  Parsed,
  /// Precaching in progress
  Installing,
  /// Installed and waiting to activate
  Installed,
  /// Removing old cache versions
  Activating,
  /// Controlling requests
  Activated,
  /// Installation failed; this worker will never activate
  Redundant,
}

impl LifecycleState {
  /// Only an active worker intercepts fetches
  pub fn can_intercept_fetch(&self) -> bool {
    matches!(self, LifecycleState::Activated)
  }
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LifecycleState::Parsed => write!(f, "parsed"),
      LifecycleState::Installing => write!(f, "installing"),
      LifecycleState::Installed => write!(f, "installed"),
      LifecycleState::Activating => write!(f, "activating"),
      LifecycleState::Activated => write!(f, "activated"),
      LifecycleState::Redundant => write!(f, "redundant"),
    }
  }
}

/// Stores removed during activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  pub failed: Vec<String>,
}

pub struct ServiceWorker<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  cache_name: String,
  origin: Url,
  precache: Vec<String>,
  table: StrategyTable,
  layer: CacheLayer<S, N>,
  sync: BackgroundSync,
  notifications: NotificationConfig,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
  clients_claimed: AtomicBool,
}

impl<S, N> ServiceWorker<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  /// Create a worker for the configured cache version.
  ///
  /// A store that was activated before resumes as activated. A store that was
  /// installed but never activated resumes as installed and waiting, so the
  /// next `start` still removes the old versions. Otherwise the worker starts
  /// out parsed and must be installed.
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    let cache_name = config.cache_name();
    let table = config.strategy_table()?;
    let origin = config.origin_url()?;

    let state = if !storage.has_store(&cache_name)? {
      LifecycleState::Parsed
    } else if storage.is_activated(&cache_name)? {
      debug!(cache = %cache_name, "Resuming active version");
      LifecycleState::Activated
    } else {
      debug!(cache = %cache_name, "Resuming installed version");
      LifecycleState::Installed
    };

    let layer = CacheLayer::new(Arc::clone(&storage), Arc::clone(&network), cache_name.clone())
      .with_offline_page(config.resolve(&config.offline_url)?);

    Ok(Self {
      storage,
      network,
      cache_name,
      origin,
      precache: config.precache.clone(),
      table,
      layer,
      sync: BackgroundSync::new(config.sync.tags.clone()),
      notifications: config.notifications.clone(),
      state: Mutex::new(state),
      skip_waiting: AtomicBool::new(state == LifecycleState::Installed),
      clients_claimed: AtomicBool::new(state == LifecycleState::Activated),
    })
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn state(&self) -> LifecycleState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  fn set_state(&self, next: LifecycleState) {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    let previous = *state;
    debug!(from = %previous, to = %next, "Lifecycle transition");
    *state = next;
  }

  /// Ask to activate as soon as installation finishes.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn is_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Whether the worker has taken control of open pages.
  pub fn clients_claimed(&self) -> bool {
    self.clients_claimed.load(Ordering::SeqCst)
  }

  /// Install: fetch every precache URL, then store them all.
  ///
  /// Nothing is written unless every URL fetched with a 2xx status. A failure
  /// leaves the worker redundant and is returned to the caller.
  pub async fn install(&self) -> Result<usize> {
    match self.state() {
      LifecycleState::Installing | LifecycleState::Activating => {
        return Err(eyre!("Cannot install while {}", self.state()));
      }
      _ => {}
    }

    info!(cache = %self.cache_name, "Installing");
    self.set_state(LifecycleState::Installing);

    match self.precache().await {
      Ok(count) => {
        info!(cache = %self.cache_name, count, "Installation complete");
        self.set_state(LifecycleState::Installed);
        self.skip_waiting();
        Ok(count)
      }
      Err(e) => {
        error!(cache = %self.cache_name, error = %e, "Installation failed");
        self.set_state(LifecycleState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let requests = self
      .precache
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid precache URL '{}': {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let responses =
      futures::future::join_all(requests.iter().map(|request| self.network.fetch(request))).await;

    let mut fetched = Vec::with_capacity(requests.len());
    for (request, response) in requests.into_iter().zip(responses) {
      let response = response?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      fetched.push((request, response));
    }

    self.storage.put_all(&self.cache_name, &fetched)?;

    Ok(fetched.len())
  }

  /// Activate: delete every other cache version, then claim clients.
  pub async fn activate(&self) -> Result<ActivationReport> {
    let state = self.state();
    if state != LifecycleState::Installed {
      return Err(eyre!("Cannot activate a worker in the {} state", state));
    }

    info!(cache = %self.cache_name, "Activating");
    self.set_state(LifecycleState::Activating);

    let names = match self.storage.store_names() {
      Ok(names) => names,
      Err(e) => {
        self.set_state(LifecycleState::Installed);
        return Err(e);
      }
    };

    let mut report = ActivationReport::default();
    for name in names.into_iter().filter(|name| *name != self.cache_name) {
      match self.storage.delete_store(&name) {
        Ok(_) => {
          info!(cache = %name, "Deleted old cache");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(cache = %name, error = %e, "Failed to delete old cache");
          report.failed.push(name);
        }
      }
    }

    if let Err(e) = self.storage.mark_activated(&self.cache_name) {
      warn!(cache = %self.cache_name, error = %e, "Failed to record activation");
    }

    self.set_state(LifecycleState::Activated);
    self.clients_claimed.store(true, Ordering::SeqCst);
    info!(cache = %self.cache_name, "Activation complete");

    Ok(report)
  }

  /// Bring the worker to the activated state, installing first if needed.
  pub async fn start(&self) -> Result<()> {
    if self.state() == LifecycleState::Parsed {
      self.install().await?;
    }
    if self.state() == LifecycleState::Installed && self.is_skip_waiting() {
      self.activate().await?;
    }
    Ok(())
  }

  /// The strategy a GET for `path` would be routed to.
  pub fn strategy_for(&self, path: &str) -> Strategy {
    self.table.select(path)
  }

  /// Handle an intercepted request.
  ///
  /// Non-GET and non-http(s) requests, and every request seen before
  /// activation, go straight to the network; only those can fail. Routed
  /// requests always produce a response.
  pub async fn handle_fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    if !self.state().can_intercept_fetch() || request.method != Method::GET || !request.is_http()
    {
      debug!(method = %request.method, url = %request.url, "Passing through");
      let response = self.network.fetch(request).await?;
      return Ok(CacheResult::passthrough(response));
    }

    let strategy = self.table.select(request.url.path());
    debug!(url = %request.url, %strategy, "Routing request");

    let result = match strategy {
      Strategy::CacheFirst => self.layer.cache_first(request).await,
      Strategy::NetworkFirst => self.layer.network_first(request).await,
      Strategy::StaleWhileRevalidate => self.layer.stale_while_revalidate(request).await,
    };

    Ok(result)
  }

  /// Send a submission; if the network is down and a sync tag covers its URL,
  /// queue it for background sync and answer 202.
  pub async fn submit(&self, request: &Request) -> Result<CacheResult<Response>> {
    match self.network.fetch(request).await {
      Ok(response) => Ok(CacheResult::passthrough(response)),
      Err(e) => match self.sync.tag_for(request) {
        Some(tag) => {
          self.storage.enqueue(request)?;
          info!(tag, url = %request.url, error = %e, "Queued for background sync");
          Ok(CacheResult::offline(Response::queued()))
        }
        None => Err(e),
      },
    }
  }

  /// Replay queued submissions for a sync tag.
  pub async fn handle_sync(&self, tag: &str) -> Result<SyncReport> {
    self
      .sync
      .replay(tag, self.storage.as_ref(), self.network.as_ref())
      .await
  }

  /// Handle a page message, answering over `reply` when the message has an answer.
  pub fn handle_message(
    &self,
    message: WorkerMessage,
    reply: Option<oneshot::Sender<MessageReply>>,
  ) {
    let answer = match message {
      WorkerMessage::SkipWaiting => {
        self.skip_waiting();
        None
      }
      WorkerMessage::GetVersion => Some(MessageReply::Version {
        version: self.cache_name.clone(),
      }),
      WorkerMessage::ClearCache => {
        let success = match self.storage.delete_store(&self.cache_name) {
          Ok(_) => true,
          Err(e) => {
            warn!(cache = %self.cache_name, error = %e, "Failed to clear cache");
            false
          }
        };
        Some(MessageReply::Cleared { success })
      }
    };

    if let (Some(answer), Some(reply)) = (answer, reply) {
      if reply.send(answer).is_err() {
        debug!("Message sender went away before the reply");
      }
    }
  }

  /// Render a push payload into a notification.
  pub fn handle_push(&self, payload: &[u8]) -> Result<Option<Notification>> {
    push::render(payload, &self.notifications)
  }

  /// Resolve a notification click against the open windows.
  pub fn handle_notification_click(
    &self,
    notification: &Notification,
    action: Option<&str>,
    clients: &[WindowClient],
  ) -> Result<ClientAction> {
    push::on_click(notification, action, clients, &self.origin)
  }

  /// Wait for background revalidations started by earlier fetches.
  pub async fn settle(&self) {
    self.layer.wait_for_revalidations().await;
  }
}
