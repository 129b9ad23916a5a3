//! Network access behind a trait so the router can be driven without a real origin.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::http::{Request, Response};

/// Anything that can perform a request round trip.
///
/// An `Err` means the round trip itself failed (offline, DNS, timeout, aborted).
/// A completed round trip with a 4xx/5xx status is still `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Network implementation backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("offcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
pub mod testing {
  //! Scriptable network for tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Serves canned responses by URL path, counts calls, and can be switched offline.
  pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Response>>,
    online: AtomicBool,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    seen: Mutex<Vec<Request>>,
  }

  impl FakeNetwork {
    pub fn new() -> Self {
      Self {
        routes: Mutex::new(HashMap::new()),
        online: AtomicBool::new(true),
        calls: AtomicUsize::new(0),
        delay: Mutex::new(None),
        seen: Mutex::new(Vec::new()),
      }
    }

    pub fn offline() -> Self {
      let network = Self::new();
      network.set_online(false);
      network
    }

    /// Serve `body` with status 200 for `path`.
    pub fn serve(&self, path: &str, body: &str) {
      self.respond(path, Response::new(200, body));
    }

    pub fn respond(&self, path: &str, response: Response) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(path.to_string(), response);
    }

    pub fn set_online(&self, online: bool) {
      self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
      *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    /// Bodies of every request that reached the network while online.
    pub fn bodies(&self) -> Vec<String> {
      self
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|r| String::from_utf8_lossy(r.body.as_deref().unwrap_or_default()).into_owned())
        .collect()
    }
  }

  #[async_trait]
  impl Network for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      self.calls.fetch_add(1, Ordering::SeqCst);

      let delay = *self.delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }

      if !self.online.load(Ordering::SeqCst) {
        return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
      }
      self.seen.lock().unwrap().push(request.clone());

      let response = self
        .routes
        .lock()
        .unwrap()
        .get(request.url.path())
        .cloned()
        .unwrap_or_else(|| Response::new(404, "Not Found"));
      Ok(response)
    }
  }
}
