//! SQLite-backed cache storage and outbox.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::{request_key, CacheStorage, OutboxStore, PendingSubmission};
use crate::http::{Request, Response, ResponseType};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database. Contents vanish on drop.
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

    Ok(data_dir.join("wbs-sw").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named cache
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by request hash within a cache
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    response_type TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key),
    FOREIGN KEY (cache_name) REFERENCES caches(name) ON DELETE CASCADE
);

-- Offline submissions waiting for background sync
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    queued_at TEXT NOT NULL DEFAULT (datetime('now')),
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,
    last_error TEXT
);
"#;

impl CacheStorage for SqliteStorage {
  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    let conn = self.conn()?;
    let found: Option<i64> = conn
      .query_row("SELECT 1 FROM caches WHERE name = ?", params![name], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn open(&self, name: &str) -> Result<()> {
    self
      .conn()?
      .execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    Ok(())
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;
    let deleted = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn match_request(&self, name: &str, request: &Request) -> Result<Option<Response>> {
    let conn = self.conn()?;
    let key = request_key(request);

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, response_type FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![name, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", name, e))?;

    match row {
      Some((status, status_text, headers, body, response_type)) => Ok(Some(Response {
        status,
        status_text,
        headers: parse_headers(&headers)?,
        body,
        kind: ResponseType::parse(&response_type)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    if !request.is_get() {
      return Err(eyre!(
        "Only GET requests can be cached, got {} {}",
        request.method,
        request.url
      ));
    }

    let mut conn = self.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, method, url, status, status_text, headers, body, response_type, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        request_key(request),
        request.method.as_str(),
        request.url.as_str(),
        response.status,
        response.status_text,
        headers,
        response.body,
        response.kind.as_str(),
      ],
    )
    .map_err(|e| eyre!("Failed to store response for {}: {}", request.url, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete_entry(&self, name: &str, request: &Request) -> Result<bool> {
    let deleted = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ? AND request_key = ?",
        params![name, request_key(request)],
      )
      .map_err(|e| eyre!("Failed to delete entry for {}: {}", request.url, e))?;

    Ok(deleted > 0)
  }

  fn keys(&self, name: &str) -> Result<Vec<Request>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE cache_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list entries of cache {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<(String, String)>>>()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url)| Ok(Request::new(parse_method(&method)?, parse_url(&url)?)))
      .collect()
  }
}

impl OutboxStore for SqliteStorage {
  fn enqueue(&self, request: &Request) -> Result<i64> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO outbox (method, url, headers, body, queued_at) VALUES (?, ?, ?, ?, datetime('now'))",
        params![request.method.as_str(), request.url.as_str(), headers, request.body],
      )
      .map_err(|e| eyre!("Failed to queue submission for {}: {}", request.url, e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<PendingSubmission>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, headers, body, queued_at, attempts, last_attempt_at, last_error
         FROM outbox ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare outbox query: {}", e))?;

    type Row = (
      i64,
      String,
      String,
      String,
      Option<Vec<u8>>,
      String,
      u32,
      Option<String>,
      Option<String>,
    );

    let rows: Vec<Row> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
          row.get(7)?,
          row.get(8)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query outbox: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read outbox row: {}", e))?;

    rows
      .into_iter()
      .map(
        |(id, method, url, headers, body, queued_at, attempts, last_attempt_at, last_error)| {
          let mut request = Request::new(parse_method(&method)?, parse_url(&url)?);
          request.headers = parse_headers(&headers)?;
          request.body = body;

          Ok(PendingSubmission {
            id,
            request,
            queued_at: parse_datetime(&queued_at)?,
            attempts,
            last_attempt_at: last_attempt_at.as_deref().map(parse_datetime).transpose()?,
            last_error,
          })
        },
      )
      .collect()
  }

  fn record_attempt(&self, id: i64, error: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE outbox SET attempts = attempts + 1, last_attempt_at = datetime('now'), last_error = ?
         WHERE id = ?",
        params![error, id],
      )
      .map_err(|e| eyre!("Failed to record attempt for submission {}: {}", id, e))?;

    Ok(())
  }

  fn remove(&self, id: i64) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM outbox WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove submission {}: {}", id, e))?;

    Ok(())
  }
}

fn parse_headers(s: &str) -> Result<Vec<(String, String)>> {
  serde_json::from_str(s).map_err(|e| eyre!("Failed to parse stored headers: {}", e))
}

fn parse_method(s: &str) -> Result<Method> {
  Method::from_bytes(s.as_bytes()).map_err(|e| eyre!("Invalid stored method '{}': {}", s, e))
}

fn parse_url(s: &str) -> Result<Url> {
  Url::parse(s).map_err(|e| eyre!("Invalid stored url '{}': {}", s, e))
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn get(path: &str) -> Request {
    Request::get(Url::parse("http://localhost:8080").unwrap().join(path).unwrap())
  }

  fn page(body: &str) -> Response {
    let mut response = Response::new(200, body).with_header("Content-Type", "text/html");
    response.kind = ResponseType::Basic;
    response
  }

  #[test]
  fn test_put_then_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = get("/index.html");
    storage.put("v1", &request, &page("<html>")).unwrap();

    let cached = storage.match_request("v1", &request).unwrap().unwrap();
    assert_eq!(cached, page("<html>"));
    assert!(storage.has_cache("v1").unwrap());
    assert!(storage.match_request("v2", &request).unwrap().is_none());
  }

  #[test]
  fn test_put_replaces_existing_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = get("/app.js");
    storage.put("v1", &request, &page("old")).unwrap();
    storage.put("v1", &request, &page("new")).unwrap();

    let cached = storage.match_request("v1", &request).unwrap().unwrap();
    assert_eq!(cached.text(), "new");
    assert_eq!(storage.keys("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_put_rejects_non_get() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = Request::new(Method::POST, get("/wbs-submit").url);
    assert!(storage.put("v1", &request, &page("x")).is_err());
  }

  #[test]
  fn test_delete_cache_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = get("/");
    storage.put("old", &request, &page("a")).unwrap();
    storage.open("current").unwrap();

    assert!(storage.delete_cache("old").unwrap());
    assert!(!storage.delete_cache("old").unwrap());
    assert_eq!(storage.cache_names().unwrap(), vec!["current".to_string()]);
    assert!(storage.match_request("old", &request).unwrap().is_none());
  }

  #[test]
  fn test_keys_and_delete_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &get("/"), &page("root")).unwrap();
    storage.put("v1", &get("/manifest.json"), &page("{}")).unwrap();

    let urls: Vec<String> = storage
      .keys("v1")
      .unwrap()
      .into_iter()
      .map(|r| r.url.path().to_string())
      .collect();
    assert_eq!(urls, vec!["/", "/manifest.json"]);

    assert!(storage.delete_entry("v1", &get("/")).unwrap());
    assert_eq!(storage.keys("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_outbox_lifecycle() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = Request::new(Method::POST, get("/wbs-submit").url)
      .with_header("Content-Type", "application/json")
      .with_body(r#"{"title":"report"}"#);

    let id = storage.enqueue(&request).unwrap();
    storage.record_attempt(id, "connection refused").unwrap();

    let pending = storage.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request, request);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_attempt_at.is_some());
    assert_eq!(pending[0].last_error.as_deref(), Some("connection refused"));

    storage.remove(id).unwrap();
    assert!(storage.pending().unwrap().is_empty());
  }

  #[test]
  fn test_persists_across_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.put("v1", &get("/index.html"), &page("saved")).unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    let cached = storage.match_request("v1", &get("/index.html")).unwrap().unwrap();
    assert_eq!(cached.text(), "saved");
  }
}
