//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use url::Url;

use super::traits::{CacheEntry, CachedResponse, PendingRequest};
use crate::http::{Request, RequestKey, RequestMode, Response};

/// Trait for cache storage backends.
///
/// Responses live in named stores; the pending-request queue is kept apart from
/// them so that dropping stores never loses queued submissions.
pub trait CacheStorage: Send + Sync {
  /// Whether the named store exists.
  fn has_store(&self, store: &str) -> Result<bool>;

  /// Whether the named store was activated at some point.
  fn is_activated(&self, store: &str) -> Result<bool>;

  /// Record that the named store is the active version.
  fn mark_activated(&self, store: &str) -> Result<()>;

  /// Names of every existing store, oldest first.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns whether it existed.
  fn delete_store(&self, store: &str) -> Result<bool>;

  /// Store a response for a request, replacing any previous entry for the same key.
  fn put(&self, store: &str, request: &Request, response: &Response) -> Result<()>;

  /// Create the store if needed and write every entry, or nothing at all.
  fn put_all(&self, store: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Look up the response stored for a request key.
  fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// List every entry of a store.
  fn entries(&self, store: &str) -> Result<Vec<CacheEntry>>;

  /// Append a request to the background-sync queue. Returns its queue id.
  fn enqueue(&self, request: &Request) -> Result<i64>;

  /// All queued requests, oldest first.
  fn pending(&self) -> Result<Vec<PendingRequest>>;

  /// Remove a queued request. Returns whether it was queued.
  fn dequeue(&self, id: i64) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named, versioned response stores
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    activated INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);

-- One response per (store, request key)
CREATE TABLE IF NOT EXISTS cache_entries (
    store TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    mode TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    PRIMARY KEY (store, request_hash),
    FOREIGN KEY (store) REFERENCES cache_stores(name) ON DELETE CASCADE
);

-- Background-sync queue
CREATE TABLE IF NOT EXISTS pending_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    queued_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);
"#;

fn open_store(conn: &Connection, store: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![store],
    )
    .map_err(|e| eyre!("Failed to open cache store {}: {}", store, e))?;

  Ok(())
}

fn insert_entry(conn: &Connection, store: &str, request: &Request, response: &Response) -> Result<()> {
  let key = request.key();
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
  let mode = serde_json::to_string(&request.mode)
    .map_err(|e| eyre!("Failed to serialize request mode: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (store, request_hash, method, url, mode, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%d %H:%M:%f', 'now'))",
      params![
        store,
        key.hash(),
        request.method.as_str(),
        request.url.as_str(),
        mode,
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn has_store(&self, store: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![store],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", store, e))?;

    Ok(found.is_some())
  }

  fn is_activated(&self, store: &str) -> Result<bool> {
    let conn = self.lock()?;

    let activated: Option<bool> = conn
      .query_row(
        "SELECT activated FROM cache_stores WHERE name = ?",
        params![store],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", store, e))?;

    Ok(activated.unwrap_or(false))
  }

  fn mark_activated(&self, store: &str) -> Result<()> {
    let conn = self.lock()?;

    let updated = conn
      .execute(
        "UPDATE cache_stores SET activated = 1 WHERE name = ?",
        params![store],
      )
      .map_err(|e| eyre!("Failed to activate cache store {}: {}", store, e))?;

    if updated == 0 {
      return Err(eyre!("Cache store {} does not exist", store));
    }
    Ok(())
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    let conn = self.lock()?;

    let deleted = conn
      .execute("DELETE FROM cache_stores WHERE name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", store, e))?;

    Ok(deleted > 0)
  }

  fn put(&self, store: &str, request: &Request, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    open_store(&conn, store)?;
    insert_entry(&conn, store, request, response)
  }

  fn put_all(&self, store: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    open_store(&tx, store)?;
    for (request, response) in entries {
      insert_entry(&tx, store, request, response)?;
    }

    tx
      .commit()
      .map_err(|e| eyre!("Failed to commit cache store {}: {}", store, e))?;

    Ok(())
  }

  fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE store = ? AND request_hash = ?",
        params![store, key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(CachedResponse {
        response: Response {
          status,
          headers: parse_headers(&headers)?,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn entries(&self, store: &str) -> Result<Vec<CacheEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT method, url, mode, status, headers, body, cached_at FROM cache_entries
         WHERE store = ?
         ORDER BY cached_at, url",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    type Row = (String, String, String, u16, String, Vec<u8>, String);
    let rows: Vec<Row> = stmt
      .query_map(params![store], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url, mode, status, headers, body, cached_at)| -> Result<CacheEntry> {
        let mode: RequestMode = serde_json::from_str(&mode)
          .map_err(|e| eyre!("Failed to parse request mode '{}': {}", mode, e))?;
        Ok(CacheEntry {
          request: Request {
            method: parse_method(&method)?,
            url: parse_url(&url)?,
            mode,
            headers: Vec::new(),
            body: None,
          },
          response: Response {
            status,
            headers: parse_headers(&headers)?,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }

  fn enqueue(&self, request: &Request) -> Result<i64> {
    let conn = self.lock()?;
    let key = request.key();
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_requests (method, url, headers, body, queued_at)
         VALUES (?, ?, ?, ?, strftime('%Y-%m-%d %H:%M:%f', 'now'))",
        params![
          request.method.as_str(),
          request.url.as_str(),
          headers,
          request.body
        ],
      )
      .map_err(|e| eyre!("Failed to queue {}: {}", key, e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<PendingRequest>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, headers, body, queued_at FROM pending_requests
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare pending query: {}", e))?;

    type Row = (i64, String, String, String, Option<Vec<u8>>, String);
    let rows: Vec<Row> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query pending requests: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read pending request: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, headers, body, queued_at)| -> Result<PendingRequest> {
        Ok(PendingRequest {
          id,
          request: Request {
            method: parse_method(&method)?,
            url: parse_url(&url)?,
            mode: RequestMode::Subresource,
            headers: parse_headers(&headers)?,
            body,
          },
          queued_at: parse_datetime(&queued_at)?,
        })
      })
      .collect()
  }

  fn dequeue(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;

    let deleted = conn
      .execute("DELETE FROM pending_requests WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued request {}: {}", id, e))?;

    Ok(deleted > 0)
  }
}

fn parse_headers(s: &str) -> Result<Vec<(String, String)>> {
  serde_json::from_str(s).map_err(|e| eyre!("Failed to parse stored headers: {}", e))
}

fn parse_method(s: &str) -> Result<Method> {
  Method::from_bytes(s.as_bytes()).map_err(|e| eyre!("Invalid stored method '{}': {}", s, e))
}

fn parse_url(s: &str) -> Result<Url> {
  Url::parse(s).map_err(|e| eyre!("Invalid stored URL '{}': {}", s, e))
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS.SSS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://site.test").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_put_then_get() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = request("/assets/css/main.bundle.css");
    let resp = Response::new(200, "body { }").with_header("content-type", "text/css");

    storage.put("site-v1", &req, &resp).unwrap();

    let cached = storage.get("site-v1", &req.key()).unwrap().unwrap();
    assert_eq!(cached.response, resp);
    assert!(storage.get("site-v2", &req.key()).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = request("/index.html");

    storage.put("site-v1", &req, &Response::new(200, "old")).unwrap();
    storage.put("site-v1", &req, &Response::new(200, "new")).unwrap();

    let entries = storage.entries("site-v1").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].response.text(), "new");
    assert_eq!(entries[0].request.url, req.url);
  }

  #[test]
  fn test_delete_store_drops_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = request("/");
    storage.put("site-v1", &req, &Response::new(200, "home")).unwrap();
    storage.put_all("site-v2", &[]).unwrap();

    assert_eq!(storage.store_names().unwrap(), vec!["site-v1", "site-v2"]);
    assert!(storage.delete_store("site-v1").unwrap());
    assert!(!storage.delete_store("site-v1").unwrap());

    assert_eq!(storage.store_names().unwrap(), vec!["site-v2"]);
    assert!(storage.get("site-v1", &req.key()).unwrap().is_none());
    assert!(storage.entries("site-v1").unwrap().is_empty());
  }

  #[test]
  fn test_put_all_is_idempotent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (request("/"), Response::new(200, "home")),
      (request("/favicon.ico"), Response::new(200, "ico")),
    ];
    storage.put_all("site-v1", &entries).unwrap();
    storage.put_all("site-v1", &entries).unwrap();

    assert!(storage.has_store("site-v1").unwrap());
    assert!(!storage.has_store("site-v0").unwrap());
    assert_eq!(storage.store_names().unwrap().len(), 1);
    assert_eq!(storage.entries("site-v1").unwrap().len(), 2);
  }

  #[test]
  fn test_put_all_writes_nothing_when_one_entry_fails() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .lock()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER reject_manifest BEFORE INSERT ON cache_entries
         WHEN NEW.url LIKE '%/manifest.json'
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
      )
      .unwrap();

    let entries = vec![
      (request("/"), Response::new(200, "home")),
      (request("/manifest.json"), Response::new(200, "{}")),
      (request("/offline.html"), Response::new(200, "offline")),
    ];
    assert!(storage.put_all("site-v1", &entries).is_err());

    assert!(!storage.has_store("site-v1").unwrap());
    assert!(storage.entries("site-v1").unwrap().is_empty());
  }

  #[test]
  fn test_activation_flag() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put_all("site-v1", &[]).unwrap();
    assert!(!storage.is_activated("site-v1").unwrap());

    storage.mark_activated("site-v1").unwrap();
    assert!(storage.is_activated("site-v1").unwrap());
    storage.put("site-v1", &request("/"), &Response::new(200, "home")).unwrap();
    assert!(storage.is_activated("site-v1").unwrap());

    assert!(!storage.is_activated("site-v2").unwrap());
    assert!(storage.mark_activated("site-v2").is_err());
  }

  #[test]
  fn test_pending_queue_survives_store_deletion() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let submission = request("/api/newsletter")
      .with_method(Method::POST)
      .with_header("content-type", "application/json")
      .with_body(r#"{"email":"a@b.c"}"#);

    storage.put_all("site-v1", &[]).unwrap();
    let id = storage.enqueue(&submission).unwrap();
    storage.delete_store("site-v1").unwrap();

    let pending = storage.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.method, Method::POST);
    assert_eq!(pending[0].request.body, submission.body);
    assert_eq!(pending[0].request.headers, submission.headers);

    assert_eq!(pending[0].id, id);
    assert!(storage.dequeue(id).unwrap());
    assert!(!storage.dequeue(id).unwrap());
    assert!(storage.pending().unwrap().is_empty());
  }

  #[test]
  fn test_identical_submissions_are_queued_separately() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let alice = request("/api/newsletter")
      .with_method(Method::POST)
      .with_body("email=alice@x");
    let bob = request("/api/newsletter")
      .with_method(Method::POST)
      .with_body("email=bob@x");
    assert_eq!(alice.key(), bob.key());

    let first = storage.enqueue(&alice).unwrap();
    let second = storage.enqueue(&bob).unwrap();
    assert_ne!(first, second);

    let pending = storage.pending().unwrap();
    let bodies: Vec<_> = pending.iter().map(|p| p.request.body.clone()).collect();
    assert_eq!(bodies, vec![alice.body, bob.body]);

    storage.dequeue(first).unwrap();
    assert_eq!(storage.pending().unwrap()[0].id, second);
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-05-01 12:30:45.123").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-05-01T12:30:45.123+00:00");
    assert!(parse_datetime("2024-05-01 12:30:45").is_ok());
    assert!(parse_datetime("yesterday").is_err());
  }
}
