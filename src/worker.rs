//! The worker: lifecycle state plus one handler per incoming event.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::{Routed, Store};
use crate::config::{Config, PrecacheMode};
use crate::host::{Host, Notification};
use crate::http::{Request, Response};
use crate::message::{ControlMessage, MessageReply, ReplyPort};
use crate::net::Fetcher;
use crate::router::{Router, RouterConfig};
use crate::sync::{self, SyncSummary, SYNC_REPORTS, UPDATE_DASHBOARD};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, no lifecycle event handled yet
  Parsed,
  /// Precaching in progress
  Installing,
  /// Precache complete, waiting to activate
  Installed,
  /// Removing stale caches
  Activating,
  /// Controlling clients and serving requests
  Activated,
  /// Install failed; the host must retry with a fresh registration
  Redundant,
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkerState::Parsed => write!(f, "parsed"),
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Installed => write!(f, "installed"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Activated => write!(f, "activated"),
      WorkerState::Redundant => write!(f, "redundant"),
    }
  }
}

/// Offline worker for the app, generic over its storage, network and host.
pub struct ServiceWorker<S: Store + 'static, F: Fetcher, H: Host> {
  config: Config,
  storage: Arc<S>,
  fetcher: Arc<F>,
  host: H,
  router: Router<S, F>,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
  clients_claimed: AtomicBool,
}

impl<S: Store + 'static, F: Fetcher, H: Host> ServiceWorker<S, F, H> {
  pub fn new(config: Config, storage: Arc<S>, fetcher: Arc<F>, host: H) -> Result<Self> {
    let router = Router::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      RouterConfig::from_config(&config)?,
    );

    Ok(Self {
      config,
      storage,
      fetcher,
      host,
      router,
      state: Mutex::new(WorkerState::Parsed),
      skip_waiting: AtomicBool::new(false),
      clients_claimed: AtomicBool::new(false),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn state(&self) -> WorkerState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  fn set_state(&self, new_state: WorkerState) {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    let from = *state;
    debug!(%from, to = %new_state, "Worker state change");
    *state = new_state;
  }

  /// Whether the worker asked to activate without waiting for old clients.
  pub fn is_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Whether the worker has taken control of open clients.
  pub fn clients_claimed(&self) -> bool {
    self.clients_claimed.load(Ordering::SeqCst)
  }

  /// Install: populate the current cache with the precache list.
  ///
  /// In strict mode any failed URL fails the install and nothing is stored.
  /// In lenient mode failures are logged and the rest is stored.
  pub async fn install(&self) -> Result<()> {
    self.set_state(WorkerState::Installing);

    match self.precache().await {
      Ok(stored) => {
        info!(cache = %self.config.cache_name, stored, "Installed");
        self.set_state(WorkerState::Installed);
        self.skip_waiting.store(true, Ordering::SeqCst);
        Ok(())
      }
      Err(e) => {
        error!(cache = %self.config.cache_name, error = %e, "Install failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let name = &self.config.cache_name;
    let existed = self.storage.has_cache(name)?;
    self.storage.open(name)?;

    let requests = self
      .config
      .precache
      .iter()
      .map(|path| self.config.resolve(path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let results = join_all(requests.iter().map(|r| self.precache_fetch(r))).await;

    match self.config.precache_mode {
      PrecacheMode::Strict => {
        let responses = match results.into_iter().collect::<Result<Vec<_>>>() {
          Ok(responses) => responses,
          Err(e) => {
            self.discard_partial(name, existed, &[]);
            return Err(e.wrap_err("Precache failed"));
          }
        };

        for (written, (request, response)) in requests.iter().zip(&responses).enumerate() {
          if let Err(e) = self.storage.put(name, request, response) {
            self.discard_partial(name, existed, &requests[..written]);
            return Err(e.wrap_err("Precache failed"));
          }
        }
        Ok(responses.len())
      }
      PrecacheMode::Lenient => {
        let mut stored = 0;
        for (request, result) in requests.iter().zip(results) {
          let outcome = result.and_then(|response| self.storage.put(name, request, &response));
          match outcome {
            Ok(()) => stored += 1,
            Err(e) => warn!(url = %request.url, error = %e, "Skipping precache entry"),
          }
        }
        Ok(stored)
      }
    }
  }

  /// Undo a failed strict install: drop a cache this install created, or
  /// remove the entries it already wrote into an existing one.
  fn discard_partial(&self, name: &str, existed: bool, written: &[Request]) {
    let result = if existed {
      written
        .iter()
        .try_for_each(|request| self.storage.delete_entry(name, request).map(|_| ()))
    } else {
      self.storage.delete_cache(name).map(|_| ())
    };

    if let Err(e) = result {
      warn!(cache = %name, error = %e, "Failed to discard partial precache");
    }
  }

  async fn precache_fetch(&self, request: &Request) -> Result<Response> {
    let response = self.fetcher.fetch(request).await?;
    if !response.ok() {
      return Err(eyre!(
        "Precache of {} returned {}",
        request.url,
        response.status
      ));
    }
    Ok(response)
  }

  /// Activate: delete every cache except the current one, then claim clients.
  pub async fn activate(&self) -> Result<()> {
    self.set_state(WorkerState::Activating);

    for name in self.storage.cache_names()? {
      if name != self.config.cache_name {
        info!(cache = %name, "Deleting old cache");
        self.storage.delete_cache(&name)?;
      }
    }

    self.clients_claimed.store(true, Ordering::SeqCst);
    self.set_state(WorkerState::Activated);
    info!(cache = %self.config.cache_name, "Activated");
    Ok(())
  }

  /// Interception: pick the response for a request. `None` surfaces as a
  /// network error to the page.
  pub async fn handle_fetch(&self, request: &Request) -> Option<Routed> {
    self.router.route(request).await
  }

  /// Wait for cache writes the router detached. Hosts that skip this accept
  /// that those writes may be lost on teardown.
  pub async fn settle(&self) {
    self.router.settle().await
  }

  pub async fn handle_message(
    &self,
    message: ControlMessage,
    reply: Option<ReplyPort>,
  ) -> Result<()> {
    match message {
      ControlMessage::SkipWaiting => {
        info!("Skip waiting requested");
        self.skip_waiting.store(true, Ordering::SeqCst);
      }
      ControlMessage::ClearCache => {
        self.storage.delete_cache(&self.config.cache_name)?;
        info!(cache = %self.config.cache_name, "Cache cleared");

        if let Some(port) = reply {
          if port.send(MessageReply { success: true }).is_err() {
            debug!("Clear-cache reply dropped, sender went away");
          }
        }
      }
      ControlMessage::Unknown => debug!("Ignoring unknown control message"),
    }
    Ok(())
  }

  /// Background sync. Only `sync-reports` does anything.
  pub async fn handle_sync(&self, tag: &str) -> Result<Option<SyncSummary>> {
    if tag != SYNC_REPORTS {
      debug!(tag, "Ignoring sync tag");
      return Ok(None);
    }

    let summary = sync::sync_reports(
      self.storage.as_ref(),
      self.fetcher.as_ref(),
      &self.host,
      &self.config.sync_endpoint,
    )
    .await?;

    info!(
      delivered = summary.delivered,
      kept = summary.kept,
      "Sync finished"
    );
    Ok(Some(summary))
  }

  /// Periodic sync. Returns whether the dashboard cache was refreshed;
  /// failures are logged only.
  pub async fn handle_periodic_sync(&self, tag: &str) -> bool {
    if tag != UPDATE_DASHBOARD {
      debug!(tag, "Ignoring periodic sync tag");
      return false;
    }

    let result = match self.config.dashboard_url() {
      Ok(url) => {
        sync::update_dashboard(
          self.storage.as_ref(),
          self.fetcher.as_ref(),
          &self.config.cache_name,
          &url,
        )
        .await
      }
      Err(e) => Err(e),
    };

    match result {
      Ok(()) => true,
      Err(e) => {
        error!(error = %e, "Dashboard update failed");
        false
      }
    }
  }

  pub fn handle_push(&self, text: Option<&str>) -> Result<()> {
    self.host.show_notification(&Notification::push(text))
  }

  /// Notification click. The notification is always closed; the `view`
  /// action also opens the app root.
  pub fn handle_notification_click(&self, action: Option<&str>) -> Result<()> {
    self.host.close_notification()?;

    match action {
      Some("view") => self.host.open_window(&self.config.app_root()?),
      _ => Ok(()),
    }
  }
}
