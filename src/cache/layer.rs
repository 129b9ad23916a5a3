//! Cache layer that runs the caching strategies against a store and the network.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{CacheResult, CachedResponse};
use crate::http::{Request, RequestKey, Response};
use crate::network::Network;

/// Cache layer that manages caching logic and network fetching.
///
/// Every strategy resolves to a response: network failures are answered from the
/// cache or with a synthetic offline response, and cache failures are logged and
/// treated as a miss (reads) or as if nothing was written (writes).
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  /// Name of the versioned store this layer reads and writes
  store: String,
  /// Absolute URL of the offline page served to navigations
  offline_page: Option<Url>,
  /// Background refreshes not yet awaited
  revalidations: Arc<Mutex<Vec<JoinHandle<Option<Response>>>>>,
}

impl<S, N> CacheLayer<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  /// Create a new cache layer over `store`.
  pub fn new(storage: Arc<S>, network: Arc<N>, store: impl Into<String>) -> Self {
    Self {
      storage,
      network,
      store: store.into(),
      offline_page: None,
      revalidations: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Set the offline fallback page, resolved against the site origin.
  pub fn with_offline_page(mut self, url: Url) -> Self {
    self.offline_page = Some(url);
    self
  }

  /// Look up a cached response, treating storage failures as a miss.
  pub fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.get(&self.store, key) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(store = %self.store, key = %key, error = %e, "Cache read failed");
        None
      }
    }
  }

  /// Store a successful response; failures are logged and otherwise ignored.
  fn remember(&self, request: &Request, response: &Response) {
    store_success(self.storage.as_ref(), &self.store, request, response);
  }

  /// Cache-first strategy.
  ///
  /// 1. Serve the cached entry if there is one
  /// 2. Otherwise fetch, storing 2xx responses
  /// 3. If the fetch fails, answer with a synthetic 503
  pub async fn cache_first(&self, request: &Request) -> CacheResult<Response> {
    if let Some(cached) = self.lookup(&request.key()) {
      debug!(url = %request.url, "Cache hit");
      return CacheResult::cached(cached);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.remember(request, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache first failed");
        CacheResult::offline(Response::offline())
      }
    }
  }

  /// Network-first strategy.
  ///
  /// 1. Fetch; any completed round trip is returned, 2xx responses are stored
  /// 2. If the fetch fails, serve the cached entry
  /// 3. On a miss, navigations get the offline page and everything else a 503
  pub async fn network_first(&self, request: &Request) -> CacheResult<Response> {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.remember(request, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed, trying cache");

        if let Some(cached) = self.lookup(&request.key()) {
          return CacheResult::cached(cached);
        }

        if request.is_navigation() {
          return CacheResult::offline(self.offline_page());
        }

        CacheResult::offline(Response::offline())
      }
    }
  }

  /// Stale-while-revalidate strategy.
  ///
  /// A refresh is always started. A cached entry is returned without waiting for
  /// it; without one, the refresh result is awaited. Refresh failures are logged,
  /// never returned.
  pub async fn stale_while_revalidate(&self, request: &Request) -> CacheResult<Response> {
    let cached = self.lookup(&request.key());

    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let store = self.store.clone();
    let refresh_request = request.clone();
    let refresh = tokio::spawn(async move {
      match network.fetch(&refresh_request).await {
        Ok(response) => {
          store_success(storage.as_ref(), &store, &refresh_request, &response);
          Some(response)
        }
        Err(e) => {
          warn!(url = %refresh_request.url, error = %e, "Stale while revalidate network failed");
          None
        }
      }
    });

    match cached {
      Some(cached) => {
        debug!(url = %request.url, "Serving stale entry, revalidating");
        self.track(refresh);
        CacheResult::cached(cached)
      }
      None => match refresh.await {
        Ok(Some(response)) => CacheResult::from_network(response),
        Ok(None) => CacheResult::offline(Response::offline()),
        Err(e) => {
          warn!(url = %request.url, error = %e, "Revalidation task failed");
          CacheResult::offline(Response::offline())
        }
      },
    }
  }

  /// Wait until every background refresh started so far has finished.
  pub async fn wait_for_revalidations(&self) {
    let pending: Vec<JoinHandle<Option<Response>>> = match self.revalidations.lock() {
      Ok(mut handles) => handles.drain(..).collect(),
      Err(e) => {
        warn!(error = %e, "Revalidation list poisoned");
        return;
      }
    };

    for handle in futures::future::join_all(pending).await {
      if let Err(e) = handle {
        warn!(error = %e, "Revalidation task failed");
      }
    }
  }

  fn track(&self, refresh: JoinHandle<Option<Response>>) {
    match self.revalidations.lock() {
      Ok(mut handles) => {
        handles.retain(|h| !h.is_finished());
        handles.push(refresh);
      }
      Err(e) => warn!(error = %e, "Revalidation list poisoned"),
    }
  }

  /// The cached offline page, or the built-in one if it was never cached.
  fn offline_page(&self) -> Response {
    let cached = self
      .offline_page
      .as_ref()
      .and_then(|url| self.lookup(&Request::get(url.clone()).key()));

    match cached {
      Some(cached) => cached.response,
      None => Response::offline_page(),
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      store: self.store.clone(),
      offline_page: self.offline_page.clone(),
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}

fn store_success<S: CacheStorage + ?Sized>(
  storage: &S,
  store: &str,
  request: &Request,
  response: &Response,
) {
  if !response.is_success() {
    return;
  }
  if let Err(e) = storage.put(store, request, response) {
    warn!(store, url = %request.url, error = %e, "Cache write failed");
  }
}
