//! Request and response types shared by the router, the cache and the network.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Body served when neither the cache nor the network can answer.
const OFFLINE_BODY: &str = "Offline";

/// Minimal page served for navigations when the offline page itself was never cached.
const OFFLINE_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Offline</title></head>
<body><h1>You are offline</h1><p>This page is not available offline yet.</p></body>
</html>
"#;

/// What the request is for, as far as caching is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
  /// Loading a new top-level document
  Navigate,
  /// Any sub-resource (script, stylesheet, image, API call)
  #[default]
  Subresource,
}

/// An outgoing request intercepted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET sub-resource request.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Subresource,
      headers: Vec::new(),
      body: None,
    }
  }

  /// A GET request for a top-level document.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Only http(s) requests are ever routed through the cache.
  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Normalized request identity used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  /// Human-readable identity, e.g. `GET https://example.com/a.css`
  identity: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      identity: format!("{} {}", method.as_str().to_uppercase(), url),
    }
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.identity.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.identity)
  }
}

/// A response as returned to the page, either from the network or the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Synthetic "service unavailable" answer.
  pub fn offline() -> Self {
    Self::new(503, OFFLINE_BODY).with_header("content-type", "text/plain; charset=utf-8")
  }

  /// Built-in offline document for navigations.
  pub fn offline_page() -> Self {
    Self::new(503, OFFLINE_PAGE_HTML).with_header("content-type", "text/html; charset=utf-8")
  }

  /// Answer for a submission that was queued for background sync.
  pub fn queued() -> Self {
    Self::new(202, "Queued").with_header("content-type", "text/plain; charset=utf-8")
  }

  /// 2xx status, the only responses worth storing.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
