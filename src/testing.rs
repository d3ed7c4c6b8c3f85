//! Test doubles shared by the module tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::cache::{CacheStorage, MemoryStorage, OutboxStore, PendingSubmission};
use crate::host::{Host, Notification};
use crate::http::{Request, Response, ResponseType};
use crate::net::Fetcher;

/// A 200 same-origin response.
pub fn basic(body: &str) -> Response {
  let mut response = Response::new(200, body);
  response.kind = ResponseType::Basic;
  response
}

/// Fetcher answering from a fixed table. Unknown URLs fail like an
/// unreachable network.
#[derive(Default)]
pub struct FakeFetcher {
  routes: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<Request>>,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn go_offline(&self) {
    self.routes.lock().unwrap().clear();
  }

  pub fn calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }
}

impl Fetcher for FakeFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.clone());
    let found = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
    found.ok_or_else(|| eyre!("network unreachable: {}", request.url))
  }
}

/// Host that records every effect it is asked to perform.
#[derive(Default)]
pub struct RecordingHost {
  pub notifications: Mutex<Vec<Notification>>,
  pub opened: Mutex<Vec<Url>>,
  pub closed: AtomicUsize,
}

impl RecordingHost {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn notifications(&self) -> Vec<Notification> {
    self.notifications.lock().unwrap().clone()
  }

  pub fn opened(&self) -> Vec<Url> {
    self.opened.lock().unwrap().clone()
  }

  pub fn closed(&self) -> usize {
    self.closed.load(Ordering::SeqCst)
  }
}

impl Host for RecordingHost {
  fn show_notification(&self, notification: &Notification) -> Result<()> {
    self
      .notifications
      .lock()
      .unwrap()
      .push(notification.clone());
    Ok(())
  }

  fn close_notification(&self) -> Result<()> {
    self.closed.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    self.opened.lock().unwrap().push(url.clone());
    Ok(())
  }
}

/// Storage over `MemoryStorage` whose cache reads and writes can be made to fail.
pub struct FlakyStorage {
  pub inner: MemoryStorage,
  reads_fail: bool,
  puts_left: AtomicUsize,
}

impl FlakyStorage {
  /// Every `match_request` and `put` fails.
  pub fn broken() -> Self {
    Self {
      inner: MemoryStorage::new(),
      reads_fail: true,
      puts_left: AtomicUsize::new(0),
    }
  }

  /// Reads work; `put` succeeds `count` times, then fails.
  pub fn puts_before_failing(count: usize) -> Self {
    Self {
      inner: MemoryStorage::new(),
      reads_fail: false,
      puts_left: AtomicUsize::new(count),
    }
  }
}

impl CacheStorage for FlakyStorage {
  fn cache_names(&self) -> Result<Vec<String>> {
    self.inner.cache_names()
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    self.inner.has_cache(name)
  }

  fn open(&self, name: &str) -> Result<()> {
    self.inner.open(name)
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    self.inner.delete_cache(name)
  }

  fn match_request(&self, name: &str, request: &Request) -> Result<Option<Response>> {
    if self.reads_fail {
      return Err(eyre!("disk I/O error"));
    }
    self.inner.match_request(name, request)
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    let allowed = self
      .puts_left
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
      .is_ok();
    if !allowed {
      return Err(eyre!("database is full"));
    }
    self.inner.put(name, request, response)
  }

  fn delete_entry(&self, name: &str, request: &Request) -> Result<bool> {
    self.inner.delete_entry(name, request)
  }

  fn keys(&self, name: &str) -> Result<Vec<Request>> {
    self.inner.keys(name)
  }
}

impl OutboxStore for FlakyStorage {
  fn enqueue(&self, request: &Request) -> Result<i64> {
    self.inner.enqueue(request)
  }

  fn pending(&self) -> Result<Vec<PendingSubmission>> {
    self.inner.pending()
  }

  fn record_attempt(&self, id: i64, error: &str) -> Result<()> {
    self.inner.record_attempt(id, error)
  }

  fn remove(&self, id: i64) -> Result<()> {
    self.inner.remove(id)
  }
}
