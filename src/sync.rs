//! Background sync: replaying queued submissions and refreshing the dashboard.

use color_eyre::Result;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, OutboxStore};
use crate::host::{Host, Notification};
use crate::http::{Request, Response};
use crate::net::Fetcher;

/// Sync tag that replays the outbox.
pub const SYNC_REPORTS: &str = "sync-reports";

/// Periodic sync tag that refreshes the cached dashboard.
pub const UPDATE_DASHBOARD: &str = "update-dashboard";

/// Outcome of one outbox replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
  /// Submissions accepted by the server and removed from the outbox
  pub delivered: usize,
  /// Submissions that failed this round and stay queued
  pub kept: usize,
}

/// Replay every queued POST to the sync endpoint.
///
/// Delivered entries are removed and announced with a notification. Failed
/// entries get their attempt recorded and wait for the next sync; there is
/// no backoff.
pub async fn sync_reports<S, F, H>(
  storage: &S,
  fetcher: &F,
  host: &H,
  sync_endpoint: &str,
) -> Result<SyncSummary>
where
  S: OutboxStore + ?Sized,
  F: Fetcher,
  H: Host + ?Sized,
{
  let mut summary = SyncSummary::default();

  let pending = storage
    .pending()?
    .into_iter()
    .filter(|entry| {
      entry.request.method == reqwest::Method::POST
        && entry.request.url.as_str().contains(sync_endpoint)
    });

  for entry in pending {
    let outcome = match fetcher.fetch(&entry.request).await {
      Ok(response) if response.ok() => Ok(()),
      Ok(response) => Err(format!("server returned {}", response.status)),
      Err(e) => Err(e.to_string()),
    };

    match outcome {
      Ok(()) => {
        storage.remove(entry.id)?;
        summary.delivered += 1;
        info!(id = entry.id, url = %entry.request.url, "Delivered queued submission");

        if let Err(e) = host.show_notification(&Notification::report_submitted()) {
          warn!(error = %e, "Failed to show delivery notification");
        }
      }
      Err(reason) => {
        error!(
          id = entry.id,
          attempts = entry.attempts + 1,
          error = %reason,
          "Sync failed"
        );
        storage.record_attempt(entry.id, &reason)?;
        summary.kept += 1;
      }
    }
  }

  Ok(summary)
}

/// Fetch the dashboard and store it as a fresh JSON entry in the current cache.
///
/// Any JSON body is stored, whatever the status. A body that is not JSON
/// fails the refresh and leaves the cache as it was.
pub async fn update_dashboard<S, F>(
  storage: &S,
  fetcher: &F,
  cache_name: &str,
  dashboard_url: &Url,
) -> Result<()>
where
  S: CacheStorage + ?Sized,
  F: Fetcher,
{
  let request = Request::get(dashboard_url.clone());
  let response = fetcher.fetch(&request).await?;
  if !response.ok() {
    warn!(url = %dashboard_url, status = response.status, "Dashboard returned an error status");
  }

  let data = response.json_body()?;
  storage.put(cache_name, &request, &Response::json(&data))?;

  info!(url = %dashboard_url, "Dashboard cache refreshed");
  Ok(())
}
