//! Background sync: replaying submissions that failed while offline.

use color_eyre::Result;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::http::Request;
use crate::network::Network;

/// Outcome of replaying one sync tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Requests replayed successfully and removed from the queue
  pub replayed: usize,
  /// Matching requests that are still queued after this run
  pub remaining: usize,
}

/// Sync tags and the URL filter each of them replays.
#[derive(Debug, Clone)]
pub struct BackgroundSync {
  tags: BTreeMap<String, String>,
}

impl BackgroundSync {
  pub fn new(tags: BTreeMap<String, String>) -> Self {
    Self { tags }
  }

  /// The first tag whose filter matches the request URL.
  pub fn tag_for(&self, request: &Request) -> Option<&str> {
    self
      .tags
      .iter()
      .find(|(_, filter)| request.url.as_str().contains(filter.as_str()))
      .map(|(tag, _)| tag.as_str())
  }

  /// Replay every queued request matching `tag`'s filter.
  ///
  /// A request is removed once its replay gets a 2xx answer. Failed replays
  /// stay queued and do not stop the remaining ones. Unknown tags are ignored.
  pub async fn replay<S, N>(&self, tag: &str, storage: &S, network: &N) -> Result<SyncReport>
  where
    S: CacheStorage + ?Sized,
    N: Network + ?Sized,
  {
    let Some(filter) = self.tags.get(tag) else {
      debug!(tag, "Ignoring unknown sync tag");
      return Ok(SyncReport::default());
    };

    let mut report = SyncReport::default();
    let pending = storage.pending()?;

    for queued in pending
      .iter()
      .filter(|p| p.request.url.as_str().contains(filter.as_str()))
    {
      let request = &queued.request;
      match network.fetch(request).await {
        Ok(response) if response.is_success() => match storage.dequeue(queued.id) {
          Ok(_) => {
            info!(tag, url = %request.url, "Replayed queued request");
            report.replayed += 1;
          }
          Err(e) => {
            warn!(tag, url = %request.url, error = %e, "Replayed request could not be removed from queue");
            report.remaining += 1;
          }
        },
        Ok(response) => {
          warn!(tag, url = %request.url, status = response.status, "Replay rejected, keeping request queued");
          report.remaining += 1;
        }
        Err(e) => {
          warn!(tag, url = %request.url, error = %e, "Replay failed, keeping request queued");
          report.remaining += 1;
        }
      }
    }

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::SyncConfig;
  use crate::http::Response;
  use crate::network::testing::FakeNetwork;
  use reqwest::Method;
  use url::Url;

  fn post(path: &str, body: &str) -> Request {
    Request::get(Url::parse("https://site.test").unwrap().join(path).unwrap())
      .with_method(Method::POST)
      .with_body(body)
  }

  fn sync() -> BackgroundSync {
    BackgroundSync::new(SyncConfig::default().tags)
  }

  #[test]
  fn test_tag_for() {
    let sync = sync();
    assert_eq!(sync.tag_for(&post("/api/newsletter", "")), Some("newsletter-sync"));
    assert_eq!(sync.tag_for(&post("/api/contact?lang=fr", "")), Some("contact-sync"));
    assert_eq!(sync.tag_for(&post("/api/comments", "")), None);
  }

  #[tokio::test]
  async fn test_replay_removes_successful_requests_for_tag_only() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = FakeNetwork::new();
    network.serve("/api/newsletter", "subscribed");
    network.serve("/api/contact", "sent");

    storage.enqueue(&post("/api/newsletter", "a@b.c")).unwrap();
    storage.enqueue(&post("/api/contact", "hello")).unwrap();

    let report = sync()
      .replay("newsletter-sync", &storage, &network)
      .await
      .unwrap();
    assert_eq!(report, SyncReport { replayed: 1, remaining: 0 });

    let pending = storage.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].request.url.path().ends_with("/api/contact"));
  }

  #[tokio::test]
  async fn test_replay_sends_every_queued_body() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = FakeNetwork::new();
    network.serve("/api/newsletter", "subscribed");

    storage.enqueue(&post("/api/newsletter", "email=alice@x")).unwrap();
    storage.enqueue(&post("/api/newsletter", "email=bob@x")).unwrap();
    assert_eq!(storage.pending().unwrap().len(), 2);

    let report = sync()
      .replay("newsletter-sync", &storage, &network)
      .await
      .unwrap();
    assert_eq!(report, SyncReport { replayed: 2, remaining: 0 });
    assert_eq!(network.bodies(), vec!["email=alice@x", "email=bob@x"]);
    assert!(storage.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_replay_keeps_failed_requests() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = FakeNetwork::new();
    network.respond("/api/contact", Response::new(500, "down"));

    storage.enqueue(&post("/api/contact", "first")).unwrap();
    storage.enqueue(&post("/api/contact?retry=1", "second")).unwrap();

    let report = sync().replay("contact-sync", &storage, &network).await.unwrap();
    assert_eq!(report, SyncReport { replayed: 0, remaining: 2 });
    assert_eq!(network.calls(), 2);
    assert_eq!(storage.pending().unwrap().len(), 2);

    network.set_online(false);
    let report = sync().replay("contact-sync", &storage, &network).await.unwrap();
    assert_eq!(report.remaining, 2);
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = FakeNetwork::new();
    storage.enqueue(&post("/api/contact", "hello")).unwrap();

    let report = sync().replay("other-sync", &storage, &network).await.unwrap();
    assert_eq!(report, SyncReport::default());
    assert_eq!(network.calls(), 0);
  }
}
