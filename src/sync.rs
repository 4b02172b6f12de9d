//! Deferred synchronization of work attempted while offline.
//!
//! The host wakes the coordinator with a sync tag once connectivity returns.
//! Each known sync type replays its queued writes and re-fetches a fixed list
//! of endpoints. A failed routine returns an error so the host retries it;
//! unknown types are dropped.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::agent::AgentContext;
use crate::http::Request;
use crate::strategy::stored_copy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncType {
  Requests,
  Estimates,
  Analytics,
  Other(String),
}

impl SyncType {
  pub fn parse(raw: &str) -> Self {
    match raw {
      "requests" => Self::Requests,
      "estimates" => Self::Estimates,
      "analytics" => Self::Analytics,
      other => Self::Other(other.to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      Self::Requests => "requests",
      Self::Estimates => "estimates",
      Self::Analytics => "analytics",
      Self::Other(other) => other,
    }
  }
}

/// A wake-up addressed to this application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
  pub tag: String,
  pub sync_type: SyncType,
}

impl SyncTask {
  /// Parse `"{prefix}-sync-{type}"`. Tags of other applications yield `None`.
  pub fn from_tag(prefix: &str, tag: &str) -> Option<Self> {
    let sync_type = tag.strip_prefix(prefix)?.strip_prefix("-sync-")?;
    Some(Self {
      tag: tag.to_string(),
      sync_type: SyncType::parse(sync_type),
    })
  }
}

/// Best-effort counters, kept in memory only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetrics {
  pub successful: u64,
  pub failed: u64,
  pub pending: u64,
}

/// A write that failed for lack of network, waiting to be replayed.
#[derive(Debug, Clone)]
pub struct QueuedMutation {
  pub request: Request,
  pub queued_at: DateTime<Utc>,
}

#[derive(Default)]
struct SyncState {
  successful: u64,
  failed: u64,
  queue: VecDeque<QueuedMutation>,
  registered: Vec<String>,
}

#[derive(Default)]
pub struct SyncCoordinator {
  state: Mutex<SyncState>,
}

impl SyncCoordinator {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, SyncState> {
    // Counters and queue stay usable even if a holder panicked.
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Hold a write for the next `requests` sync. Returns the queue length.
  pub fn enqueue(&self, request: Request) -> usize {
    let mut state = self.state();
    state.queue.push_back(QueuedMutation {
      request,
      queued_at: Utc::now(),
    });
    state.queue.len()
  }

  /// Ask the host for a wake-up with `tag`. Duplicate registrations collapse.
  pub fn register(&self, tag: String) {
    let mut state = self.state();
    if !state.registered.contains(&tag) {
      state.registered.push(tag);
    }
  }

  pub fn take_registered(&self) -> Vec<String> {
    std::mem::take(&mut self.state().registered)
  }

  pub fn metrics(&self) -> SyncMetrics {
    let state = self.state();
    SyncMetrics {
      successful: state.successful,
      failed: state.failed,
      pending: state.queue.len() as u64,
    }
  }

  /// Zero the success and failure counters. Queued writes are kept.
  pub fn reset_metrics(&self) {
    let mut state = self.state();
    state.successful = 0;
    state.failed = 0;
  }

  fn record(&self, ok: bool) {
    let mut state = self.state();
    if ok {
      state.successful += 1;
    } else {
      state.failed += 1;
    }
  }

  pub async fn on_sync_wake(&self, ctx: &AgentContext, tag: &str) -> Result<()> {
    let Some(task) = SyncTask::from_tag(ctx.config.sync_prefix(), tag) else {
      debug!(tag, "Ignoring sync tag of another application");
      return Ok(());
    };

    info!(tag = %task.tag, "Background sync started");
    let result = match &task.sync_type {
      SyncType::Requests => {
        let replayed = self.replay_mutations(ctx).await;
        let refreshed = self.refresh_endpoints(ctx, &task.sync_type).await;
        replayed.and(refreshed)
      }
      SyncType::Estimates | SyncType::Analytics => {
        self.refresh_endpoints(ctx, &task.sync_type).await
      }
      SyncType::Other(unknown) => {
        warn!(tag, sync_type = %unknown, "Unknown sync type, not retrying");
        return Ok(());
      }
    };

    match &result {
      Ok(()) => info!(tag, "Background sync finished"),
      Err(e) => warn!(tag, "Background sync failed, will be retried: {}", e),
    }
    result
  }

  /// Resend queued writes in order. Writes that fail for network or server
  /// reasons go back on the queue; writes rejected with a 4xx are dropped.
  async fn replay_mutations(&self, ctx: &AgentContext) -> Result<()> {
    let batch: Vec<QueuedMutation> = self.state().queue.drain(..).collect();
    if batch.is_empty() {
      return Ok(());
    }

    let mut retry = Vec::new();
    for mutation in batch {
      let request = &mutation.request;
      let route = ctx.route(&request.url);
      match ctx.fetch(request, route.timeout).await {
        Ok(response) if response.is_success() => {
          self.record(true);
          info!(
            url = %request.url,
            method = %request.method,
            queued_at = %mutation.queued_at,
            "Replayed queued write"
          );
          let data = response.json_body().unwrap_or(Value::Null);
          ctx.clients.notify(&request.url, data);
        }
        Ok(response) if (400..500).contains(&response.status) => {
          self.record(false);
          warn!(url = %request.url, status = response.status, "Queued write rejected, dropping it");
        }
        Ok(response) => {
          self.record(false);
          debug!(url = %request.url, status = response.status, "Queued write failed, keeping it");
          retry.push(mutation);
        }
        Err(e) => {
          self.record(false);
          debug!(url = %request.url, "Queued write failed, keeping it: {}", e);
          retry.push(mutation);
        }
      }
    }

    if retry.is_empty() {
      return Ok(());
    }

    let remaining = retry.len();
    let mut state = self.state();
    for mutation in retry.into_iter().rev() {
      state.queue.push_front(mutation);
    }
    Err(eyre!("{} queued writes could not be replayed", remaining))
  }

  /// Re-fetch and re-store the endpoints configured for a sync type.
  async fn refresh_endpoints(&self, ctx: &AgentContext, sync_type: &SyncType) -> Result<()> {
    let endpoints = ctx
      .config
      .sync
      .routines
      .get(sync_type.as_str())
      .cloned()
      .unwrap_or_default();

    let mut failures = Vec::new();
    for path in endpoints {
      let url = match ctx.config.resolve_url(&path) {
        Ok(url) => url,
        Err(e) => {
          self.record(false);
          failures.push(format!("{}: {}", path, e));
          continue;
        }
      };
      let request = Request::get(url);
      let route = ctx.route(&request.url);

      match ctx.fetch(&request, route.timeout).await {
        Ok(response) if response.is_success() => {
          self.record(true);
          ctx.write_through(&route, &request.key(), &stored_copy(&route, &response));
          let data = response.json_body().unwrap_or(Value::Null);
          ctx.clients.notify(&request.url, data);
        }
        Ok(response) => {
          self.record(false);
          failures.push(format!("{} answered {}", request.url, response.status));
        }
        Err(e) => {
          self.record(false);
          failures.push(e.to_string());
        }
      }
    }

    if failures.is_empty() {
      Ok(())
    } else {
      Err(eyre!("Sync of {} failed: {}", sync_type.as_str(), failures.join("; ")))
    }
  }
}
