//! In-memory storage, for tests and `--ephemeral` runs.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::traits::{request_key, CacheStorage, OutboxStore, PendingSubmission};
use crate::http::{Request, Response};

#[derive(Default)]
struct NamedCache {
  /// (key, request, response) in write order
  entries: Vec<(String, Request, Response)>,
}

#[derive(Default)]
struct State {
  /// Cache names in creation order
  caches: Vec<(String, NamedCache)>,
  outbox: Vec<PendingSubmission>,
  next_id: i64,
}

impl State {
  fn cache(&self, name: &str) -> Option<&NamedCache> {
    self.caches.iter().find(|(n, _)| n == name).map(|(_, c)| c)
  }

  fn cache_mut(&mut self, name: &str) -> &mut NamedCache {
    let index = match self.caches.iter().position(|(n, _)| n == name) {
      Some(index) => index,
      None => {
        self.caches.push((name.to_string(), NamedCache::default()));
        self.caches.len() - 1
      }
    };
    &mut self.caches[index].1
  }
}

/// Storage kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStorage {
  state: RwLock<State>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
    self.state.read().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
    self.state.write().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(self.read()?.caches.iter().map(|(n, _)| n.clone()).collect())
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    Ok(self.read()?.cache(name).is_some())
  }

  fn open(&self, name: &str) -> Result<()> {
    self.write()?.cache_mut(name);
    Ok(())
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut state = self.write()?;
    let before = state.caches.len();
    state.caches.retain(|(n, _)| n != name);
    Ok(state.caches.len() != before)
  }

  fn match_request(&self, name: &str, request: &Request) -> Result<Option<Response>> {
    let key = request_key(request);
    let state = self.read()?;

    Ok(state.cache(name).and_then(|cache| {
      cache
        .entries
        .iter()
        .find(|(k, _, _)| *k == key)
        .map(|(_, _, response)| response.clone())
    }))
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    if !request.is_get() {
      return Err(eyre!(
        "Only GET requests can be cached, got {} {}",
        request.method,
        request.url
      ));
    }

    let key = request_key(request);
    let mut state = self.write()?;
    let cache = state.cache_mut(name);
    cache.entries.retain(|(k, _, _)| *k != key);
    cache
      .entries
      .push((key, request.clone(), response.clone()));

    Ok(())
  }

  fn delete_entry(&self, name: &str, request: &Request) -> Result<bool> {
    let key = request_key(request);
    let mut state = self.write()?;

    if state.cache(name).is_none() {
      return Ok(false);
    }

    let cache = state.cache_mut(name);
    let before = cache.entries.len();
    cache.entries.retain(|(k, _, _)| *k != key);
    Ok(cache.entries.len() != before)
  }

  fn keys(&self, name: &str) -> Result<Vec<Request>> {
    let state = self.read()?;
    Ok(
      state
        .cache(name)
        .map(|cache| cache.entries.iter().map(|(_, r, _)| r.clone()).collect())
        .unwrap_or_default(),
    )
  }
}

impl OutboxStore for MemoryStorage {
  fn enqueue(&self, request: &Request) -> Result<i64> {
    let mut state = self.write()?;
    state.next_id += 1;
    let id = state.next_id;

    state.outbox.push(PendingSubmission {
      id,
      request: request.clone(),
      queued_at: Utc::now(),
      attempts: 0,
      last_attempt_at: None,
      last_error: None,
    });

    Ok(id)
  }

  fn pending(&self) -> Result<Vec<PendingSubmission>> {
    Ok(self.read()?.outbox.clone())
  }

  fn record_attempt(&self, id: i64, error: &str) -> Result<()> {
    let mut state = self.write()?;
    if let Some(entry) = state.outbox.iter_mut().find(|e| e.id == id) {
      entry.attempts += 1;
      entry.last_attempt_at = Some(Utc::now());
      entry.last_error = Some(error.to_string());
    }
    Ok(())
  }

  fn remove(&self, id: i64) -> Result<()> {
    self.write()?.outbox.retain(|e| e.id != id);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  fn get(path: &str) -> Request {
    Request::get(Url::parse("http://localhost:8080").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_last_write_wins() {
    let storage = MemoryStorage::new();
    storage.put("v1", &get("/a"), &Response::new(200, "first")).unwrap();
    storage.put("v1", &get("/a"), &Response::new(200, "second")).unwrap();

    let cached = storage.match_request("v1", &get("/a")).unwrap().unwrap();
    assert_eq!(cached.text(), "second");
    assert_eq!(storage.keys("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_delete_cache_and_names() {
    let storage = MemoryStorage::new();
    storage.open("a").unwrap();
    storage.open("b").unwrap();
    storage.open("a").unwrap();
    assert_eq!(storage.cache_names().unwrap(), vec!["a", "b"]);

    assert!(storage.delete_cache("a").unwrap());
    assert!(!storage.has_cache("a").unwrap());
    assert!(!storage.delete_cache("a").unwrap());
  }

  #[test]
  fn test_delete_entry_on_missing_cache_does_not_create_it() {
    let storage = MemoryStorage::new();
    assert!(!storage.delete_entry("nope", &get("/")).unwrap());
    assert!(!storage.has_cache("nope").unwrap());
  }

  #[test]
  fn test_outbox_ids_increase() {
    let storage = MemoryStorage::new();
    let request = Request::new(Method::POST, get("/wbs-submit").url);
    let first = storage.enqueue(&request).unwrap();
    let second = storage.enqueue(&request).unwrap();
    assert!(second > first);

    storage.remove(first).unwrap();
    let pending = storage.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second);
  }
}
