//! Core traits and types for named caches and the submission outbox.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};

use crate::http::{Request, Response};

/// Stable lookup key for a request: SHA256 over method and URL.
///
/// Headers do not take part in matching; two requests for the same URL with
/// different `Accept` headers share an entry.
pub fn request_key(request: &Request) -> String {
  let input = format!("{} {}", request.method.as_str(), request.url.as_str());

  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Trait for named-cache backends.
///
/// A backend holds any number of caches, each mapping requests to responses.
/// Writes are last-write-wins.
pub trait CacheStorage: Send + Sync {
  /// Names of all existing caches.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Whether a cache with this name exists.
  fn has_cache(&self, name: &str) -> Result<bool>;

  /// Create the cache if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Delete a cache and all its entries. Returns whether it existed.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Look up the stored response for a request.
  fn match_request(&self, name: &str, request: &Request) -> Result<Option<Response>>;

  /// Store a response, replacing any previous entry. Only GET requests are accepted.
  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn delete_entry(&self, name: &str, request: &Request) -> Result<bool>;

  /// Requests with an entry in the cache, oldest write first.
  fn keys(&self, name: &str) -> Result<Vec<Request>>;
}

/// A request waiting in the outbox for background sync.
#[derive(Debug, Clone)]
pub struct PendingSubmission {
  pub id: i64,
  pub request: Request,
  pub queued_at: DateTime<Utc>,
  /// Number of replays attempted so far
  pub attempts: u32,
  pub last_attempt_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

/// Trait for the durable queue of offline submissions.
pub trait OutboxStore: Send + Sync {
  /// Append a request. Returns the new entry id.
  fn enqueue(&self, request: &Request) -> Result<i64>;

  /// All pending entries in queue order.
  fn pending(&self) -> Result<Vec<PendingSubmission>>;

  /// Record a failed delivery attempt.
  fn record_attempt(&self, id: i64, error: &str) -> Result<()>;

  /// Drop an entry after successful delivery.
  fn remove(&self, id: i64) -> Result<()>;
}

/// Everything the worker needs from its storage backend.
pub trait Store: CacheStorage + OutboxStore {}

impl<T: CacheStorage + OutboxStore> Store for T {}

/// A response chosen by the router, with where it came from.
#[derive(Debug, Clone)]
pub struct Routed {
  pub response: Response,
  pub source: ResponseSource,
}

impl Routed {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
    }
  }

  pub fn offline_stub(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::OfflineStub,
    }
  }
}

/// Indicates where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Stored entry from the current cache
  Cache,
  /// Synthesized by the worker while offline
  OfflineStub,
}

impl std::fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ResponseSource::Network => write!(f, "network"),
      ResponseSource::Cache => write!(f, "cache"),
      ResponseSource::OfflineStub => write!(f, "offline-stub"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  #[test]
  fn test_request_key_depends_on_method_and_url() {
    let url = Url::parse("http://localhost:8080/index.html").unwrap();
    let get = Request::get(url.clone());
    let post = Request::new(Method::POST, url);

    assert_eq!(request_key(&get), request_key(&get.clone()));
    assert_ne!(request_key(&get), request_key(&post));
    assert_eq!(request_key(&get).len(), 64);
  }

  #[test]
  fn test_request_key_ignores_headers() {
    let url = Url::parse("http://localhost:8080/app.js").unwrap();
    let plain = Request::get(url.clone());
    let with_header = Request::get(url).with_header("Accept", "*/*");
    assert_eq!(request_key(&plain), request_key(&with_header));
  }
}
