//! Per-request routing between the network and the current cache.
//!
//! Every intercepted request is classified by URL and served by one of three
//! strategies:
//! - API calls: network first, then cache, then a synthesized offline payload
//! - Same-origin static assets: cache first, then network (storing good responses)
//! - Everything else: network first, then cache, otherwise nothing
//!
//! No strategy propagates a network failure. Cache writes made on the way
//! are detached: the response never waits for them, and a write may still be
//! pending (or be aborted) when the worker goes away.

use color_eyre::Result;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::{Origin, Url};

use crate::cache::{Routed, Store};
use crate::config::Config;
use crate::http::{Request, Response, ResponseType};
use crate::net::Fetcher;
use crate::offline;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Under the API base: network first with offline stub
  Api,
  /// Same-origin asset under the static prefix: cache first
  Static,
  /// Anything else: network with cache fallback
  Passthrough,
}

/// The parts of the configuration the router consults per request.
#[derive(Debug, Clone)]
pub struct RouterConfig {
  pub cache_name: String,
  pub origin: Origin,
  pub api_base: String,
  pub static_prefix: String,
  pub dashboard_marker: String,
  pub sync_endpoint: String,
}

impl RouterConfig {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      cache_name: config.cache_name.clone(),
      origin: config.origin_url()?.origin(),
      api_base: config.api_base.clone(),
      static_prefix: config.static_prefix.clone(),
      dashboard_marker: config.dashboard_marker.clone(),
      sync_endpoint: config.sync_endpoint.clone(),
    })
  }

  /// Classify a URL. First match wins: API base, then static namespace.
  pub fn classify(&self, url: &Url) -> RequestClass {
    if url.as_str().starts_with(&self.api_base) {
      RequestClass::Api
    } else if url.origin() == self.origin && url.path().starts_with(&self.static_prefix) {
      RequestClass::Static
    } else {
      RequestClass::Passthrough
    }
  }

  fn is_dashboard(&self, url: &Url) -> bool {
    url.path().contains(&self.dashboard_marker)
  }

  /// POSTs to the sync endpoint are queued for background sync when offline.
  pub fn is_sync_submission(&self, request: &Request) -> bool {
    request.method == reqwest::Method::POST && request.url.as_str().contains(&self.sync_endpoint)
  }
}

/// Routes intercepted requests through the network and the current cache.
pub struct Router<S: Store + 'static, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  config: RouterConfig,
  /// Detached cache writes not yet joined
  writes: Mutex<JoinSet<()>>,
}

impl<S: Store + 'static, F: Fetcher> Router<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, config: RouterConfig) -> Self {
    Self {
      storage,
      fetcher,
      config,
      writes: Mutex::new(JoinSet::new()),
    }
  }

  /// Pick a response for the request. `None` means there is nothing to
  /// serve and the requester should see a network error.
  pub async fn route(&self, request: &Request) -> Option<Routed> {
    let class = self.config.classify(&request.url);
    debug!(method = %request.method, url = %request.url, ?class, "Routing request");

    let routed = match class {
      RequestClass::Api => Some(self.network_first(request).await),
      RequestClass::Static => self.cache_first(request).await,
      RequestClass::Passthrough => self.network_with_cache_fallback(request).await,
    };

    match &routed {
      Some(r) => debug!(url = %request.url, source = %r.source, status = r.response.status, "Served"),
      None => warn!(url = %request.url, "Nothing to serve"),
    }

    routed
  }

  /// API strategy.
  ///
  /// 1. Fetch from network; on success store a copy and return it unmodified
  /// 2. On failure queue sync submissions, then try the cache
  /// 3. On a cache miss return the offline stub
  async fn network_first(&self, request: &Request) -> Routed {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.cache_in_background(request, &response);
        Routed::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "API request failed, falling back to cache");

        if self.config.is_sync_submission(request) {
          self.queue_submission(request);
        }

        if let Some(cached) = self.lookup(request) {
          return Routed::from_cache(cached);
        }

        let stub = if self.config.is_dashboard(&request.url) {
          offline::dashboard_stub()
        } else {
          offline::error_stub()
        };
        Routed::offline_stub(stub)
      }
    }
  }

  /// Static strategy. A hit is returned verbatim without touching the network.
  async fn cache_first(&self, request: &Request) -> Option<Routed> {
    if let Some(cached) = self.lookup(request) {
      return Some(Routed::from_cache(cached));
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.status != 200 || response.kind != ResponseType::Basic {
          debug!(
            url = %request.url,
            status = response.status,
            kind = response.kind.as_str(),
            "Not caching response"
          );
        } else {
          self.cache_in_background(request, &response);
        }
        Some(Routed::from_network(response))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Static asset not cached and network failed");
        None
      }
    }
  }

  /// Passthrough strategy. May yield nothing.
  async fn network_with_cache_fallback(&self, request: &Request) -> Option<Routed> {
    match self.fetcher.fetch(request).await {
      Ok(response) => Some(Routed::from_network(response)),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Passthrough fetch failed, trying cache");
        self.lookup(request).map(Routed::from_cache)
      }
    }
  }

  /// Read from the current cache. Read failures count as a miss.
  fn lookup(&self, request: &Request) -> Option<Response> {
    match self.storage.match_request(&self.config.cache_name, request) {
      Ok(found) => found,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache read failed");
        None
      }
    }
  }

  fn queue_submission(&self, request: &Request) {
    match self.storage.enqueue(request) {
      Ok(id) => info!(id, url = %request.url, "Queued submission for background sync"),
      Err(e) => warn!(url = %request.url, error = %e, "Failed to queue submission"),
    }
  }

  /// Store a copy of the response without waiting for it.
  ///
  /// The write runs as a detached blocking task. Its failure is logged and
  /// never reaches the caller. If the worker is dropped first, the write is
  /// aborted.
  fn cache_in_background(&self, request: &Request, response: &Response) {
    if !request.is_get() {
      debug!(method = %request.method, url = %request.url, "Not caching non-GET request");
      return;
    }

    let storage = Arc::clone(&self.storage);
    let cache_name = self.config.cache_name.clone();
    let request = request.clone();
    let response = response.clone();

    let mut writes = match self.writes.lock() {
      Ok(writes) => writes,
      Err(e) => {
        warn!(error = %e, "Write tracker poisoned, skipping cache write");
        return;
      }
    };

    // Reap finished writes so the set does not grow without bound
    while writes.try_join_next().is_some() {}

    writes.spawn_blocking(move || {
      if let Err(e) = storage.put(&cache_name, &request, &response) {
        warn!(url = %request.url, error = %e, "Cache write failed");
      }
    });
  }

  /// Wait for all detached cache writes spawned so far.
  pub async fn settle(&self) {
    let mut pending = match self.writes.lock() {
      Ok(mut writes) => std::mem::take(&mut *writes),
      Err(e) => {
        warn!(error = %e, "Write tracker poisoned");
        return;
      }
    };

    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "Cache write task did not complete");
      }
    }
  }
}
