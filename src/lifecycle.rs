//! Install and activate steps.
//!
//! Install pre-caches the manifest; activate retires partitions written by
//! other versions and seeds the business data document.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::AgentContext;
use crate::cache::{eviction, CacheEntry};
use crate::http::{Request, RequestKey, Response};
use crate::strategy::{stored_copy, Route};

/// Synthetic key of the seeded business data document.
pub const BUSINESS_DATA_PATH: &str = "/__agent/business-data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
  /// Constructed, install not started
  #[default]
  Parsed,
  Installing,
  /// Installed and waiting for activation
  Installed,
  Activating,
  Active,
}

/// Outcome of the install step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub static_assets: usize,
  /// Static assets went in as one all-or-nothing write
  pub bulk: bool,
  pub offline_pages: usize,
  pub critical_endpoints: usize,
  /// URLs that could not be pre-cached
  pub misses: Vec<String>,
}

/// Outcome of the activate step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted_partitions: Vec<String>,
  /// The business data document was written (it was absent)
  pub seeded: bool,
  pub claimed_clients: usize,
}

pub struct LifecycleManager {
  state: Mutex<LifecycleState>,
}

impl Default for LifecycleManager {
  fn default() -> Self {
    Self::new()
  }
}

impl LifecycleManager {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(LifecycleState::Parsed),
    }
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Parsed)
  }

  fn transition(&self, next: LifecycleState) {
    if let Ok(mut state) = self.state.lock() {
      debug!(from = ?*state, to = ?next, "Lifecycle transition");
      *state = next;
    }
  }

  /// Pre-cache static assets, offline pages and critical endpoints concurrently.
  ///
  /// Individual misses are logged and reported, never fatal.
  pub async fn install(&self, ctx: &AgentContext) -> InstallReport {
    self.transition(LifecycleState::Installing);

    let (assets, pages, critical) = tokio::join!(
      precache_static(ctx),
      precache_offline_pages(ctx),
      seed_critical_endpoints(ctx)
    );

    let mut report = InstallReport {
      static_assets: assets.stored,
      bulk: assets.bulk,
      offline_pages: pages.stored,
      critical_endpoints: critical.stored,
      misses: Vec::new(),
    };
    report.misses.extend(assets.misses);
    report.misses.extend(pages.misses);
    report.misses.extend(critical.misses);

    self.transition(LifecycleState::Installed);
    info!(
      assets = report.static_assets,
      pages = report.offline_pages,
      critical = report.critical_endpoints,
      misses = report.misses.len(),
      "Install complete"
    );
    report
  }

  /// Delete partitions from other versions, seed business data and claim tabs.
  pub fn activate(&self, ctx: &AgentContext) -> Result<ActivationReport> {
    self.transition(LifecycleState::Activating);

    let mut report = ActivationReport::default();
    for name in ctx.storage.partitions()? {
      if ctx.namespace.is_stale(&name) && ctx.storage.delete_partition(&name)? {
        info!(partition = %name, "Deleted stale partition");
        report.deleted_partitions.push(name);
      }
    }

    report.seeded = seed_business_data(ctx)?;
    if ctx.config.app.clients_claim {
      report.claimed_clients = ctx.clients.claim();
    }

    self.transition(LifecycleState::Active);
    info!(
      version = ctx.namespace.version(),
      deleted = report.deleted_partitions.len(),
      "Activated"
    );
    Ok(report)
  }

  /// Activate a waiting instance right away. Outside `Installed` this is a no-op.
  pub fn skip_waiting(&self, ctx: &AgentContext) -> Result<Option<ActivationReport>> {
    match self.state() {
      LifecycleState::Installed => self.activate(ctx).map(Some),
      state => {
        debug!(?state, "Skip waiting ignored, nothing is waiting");
        Ok(None)
      }
    }
  }
}

#[derive(Default)]
struct Precache {
  stored: usize,
  bulk: bool,
  misses: Vec<String>,
}

/// Fetch one manifest URL, requiring a success status.
async fn fetch_for_cache(ctx: &AgentContext, path: &str) -> Result<(Request, Response)> {
  let url = ctx.config.resolve_url(path)?;
  let request = Request::get(url);
  let response = ctx.fetch(&request, ctx.config.network_timeout()).await?;
  if !response.is_success() {
    return Err(eyre!("{} answered with status {}", request.url, response.status));
  }
  Ok((request, response))
}

/// Static assets go into the partition their route reads from, so a cache-first
/// `/static/` strategy serves them offline. Unmatched assets land in the main
/// partition.
async fn precache_static(ctx: &AgentContext) -> Precache {
  let assets = &ctx.config.manifest.static_assets;
  let results = join_all(assets.iter().map(|path| fetch_for_cache(ctx, path))).await;

  if results.iter().all(|r| r.is_ok()) {
    let mut batches: BTreeMap<String, (Route, Vec<CacheEntry>)> = BTreeMap::new();
    for (request, response) in results.iter().flatten() {
      let route = ctx.route(&request.url);
      batches
        .entry(route.partition.clone())
        .or_insert_with(|| (route, Vec::new()))
        .1
        .push(CacheEntry::from_response(request.key(), response));
    }

    match store_batches(ctx, &batches) {
      Ok(stored) => {
        return Precache {
          stored,
          bulk: true,
          misses: Vec::new(),
        }
      }
      Err(e) => warn!("Bulk pre-cache failed, caching assets individually: {}", e),
    }
  } else {
    warn!("Bulk pre-cache failed, caching assets individually");
  }

  let mut outcome = Precache::default();
  let mut touched: BTreeMap<String, Route> = BTreeMap::new();
  for (path, result) in assets.iter().zip(results) {
    let stored = result.and_then(|(request, response)| {
      let route = ctx.route(&request.url);
      ctx
        .storage
        .put(&route.partition, &CacheEntry::from_response(request.key(), &response))?;
      touched.insert(route.partition.clone(), route);
      Ok(())
    });
    match stored {
      Ok(()) => outcome.stored += 1,
      Err(e) => {
        warn!(asset = %path, "Failed to cache asset: {}", e);
        outcome.misses.push(path.clone());
      }
    }
  }
  for route in touched.values() {
    trim(ctx, route);
  }
  outcome
}

/// Write each partition's assets in one all-or-nothing batch.
fn store_batches(
  ctx: &AgentContext,
  batches: &BTreeMap<String, (Route, Vec<CacheEntry>)>,
) -> Result<usize> {
  let mut stored = 0;
  for (partition, (route, entries)) in batches {
    ctx.storage.put_all(partition, entries)?;
    trim(ctx, route);
    stored += entries.len();
  }
  Ok(stored)
}

fn trim(ctx: &AgentContext, route: &Route) {
  if let Err(e) = eviction::enforce(ctx.storage.as_ref(), &route.partition, route.max_entries) {
    warn!(partition = %route.partition, "Eviction failed: {}", e);
  }
}

async fn precache_offline_pages(ctx: &AgentContext) -> Precache {
  let partition = ctx.namespace.offline();
  let pages = &ctx.config.manifest.offline_pages;
  let results = join_all(pages.iter().map(|path| fetch_for_cache(ctx, path))).await;

  let mut outcome = Precache::default();
  for (path, result) in pages.iter().zip(results) {
    let stored = result.and_then(|(request, response)| {
      ctx
        .storage
        .put(&partition, &CacheEntry::from_response(request.key(), &response))
    });
    match stored {
      Ok(()) => outcome.stored += 1,
      Err(e) => {
        warn!(page = %path, "Failed to cache offline page: {}", e);
        outcome.misses.push(path.clone());
      }
    }
  }
  outcome
}

async fn seed_critical_endpoints(ctx: &AgentContext) -> Precache {
  let endpoints = &ctx.config.manifest.critical_endpoints;
  let results = join_all(endpoints.iter().map(|path| fetch_for_cache(ctx, path))).await;

  let mut outcome = Precache::default();
  for (path, result) in endpoints.iter().zip(results) {
    match result {
      Ok((request, response)) => {
        let route = ctx.route(&request.url);
        ctx.write_through(&route, &request.key(), &stored_copy(&route, &response));
        outcome.stored += 1;
      }
      Err(e) => {
        warn!(endpoint = %path, "Failed to seed critical data: {}", e);
        outcome.misses.push(path.clone());
      }
    }
  }
  outcome
}

fn seed_business_data(ctx: &AgentContext) -> Result<bool> {
  let partition = ctx.namespace.business_data();
  let key = RequestKey::get(ctx.config.resolve_url(BUSINESS_DATA_PATH)?);
  if ctx.storage.get(&partition, &key)?.is_some() {
    return Ok(false);
  }

  let document = json!({
    "templates": [],
    "drafts": [],
    "recentItems": [],
    "lastSync": null
  });
  let entry = CacheEntry::from_response(key, &Response::json(200, &document));
  ctx.storage.put(&partition, &entry)?;
  Ok(true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::Agent;
  use crate::http::ResponseSource;
  use crate::testing::{test_config, test_context, test_context_with, ScriptedFetcher, ORIGIN};
  use serde_json::Value;
  use std::sync::Arc;

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn urls(ctx: &AgentContext, partition: &str) -> Vec<String> {
    let mut urls: Vec<String> = ctx
      .storage
      .keys(partition)
      .unwrap()
      .into_iter()
      .map(|k| k.url)
      .collect();
    urls.sort();
    urls
  }

  fn online_fetcher() -> Arc<ScriptedFetcher> {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond(&url("/a.js"), 200, "a");
    fetcher.respond(&url("/b.js"), 200, "b");
    fetcher.respond(&url("/offline.html"), 200, "<p>offline</p>");
    fetcher.respond(&url("/api/business/profile"), 200, "{\"id\":1}");
    fetcher
  }

  #[tokio::test]
  async fn test_install_populates_partitions() {
    let ctx = test_context(online_fetcher());
    let lifecycle = LifecycleManager::new();

    let report = lifecycle.install(&ctx).await;

    assert_eq!(lifecycle.state(), LifecycleState::Installed);
    assert!(report.bulk);
    assert!(report.misses.is_empty());
    assert_eq!(urls(&ctx, "courier-v2"), vec![url("/a.js"), url("/b.js")]);
    assert_eq!(urls(&ctx, "courier-offline-v2"), vec![url("/offline.html")]);

    let profile = ctx
      .storage
      .get(
        "courier-business-v2",
        &RequestKey::get(url("/api/business/profile")),
      )
      .unwrap()
      .unwrap();
    let body: Value = serde_json::from_slice(&profile.body).unwrap();
    assert_eq!(body["_strategy"], "business");
  }

  #[tokio::test]
  async fn test_install_falls_back_to_individual_assets() {
    let fetcher = online_fetcher();
    fetcher.fail(&url("/b.js"));
    let ctx = test_context(fetcher);
    let lifecycle = LifecycleManager::new();

    let report = lifecycle.install(&ctx).await;

    assert!(!report.bulk);
    assert_eq!(report.static_assets, 1);
    assert_eq!(report.misses, vec!["/b.js".to_string()]);
    assert_eq!(urls(&ctx, "courier-v2"), vec![url("/a.js")]);
    assert_eq!(lifecycle.state(), LifecycleState::Installed);
  }

  #[tokio::test]
  async fn test_precached_static_asset_is_served_offline() {
    let fetcher = online_fetcher();
    fetcher.respond(&url("/static/app.js"), 200, "console.log(1)");
    let mut config = test_config();
    config.manifest.static_assets = vec!["/static/app.js".to_string(), "/a.js".to_string()];
    let agent = Agent::with_context(test_context_with(config, fetcher.clone()));

    let report = agent.install().await.unwrap();
    assert!(report.bulk);
    assert_eq!(report.static_assets, 2);
    assert_eq!(urls(agent.context(), "courier-assets-v2"), vec![url("/static/app.js")]);
    assert_eq!(urls(agent.context(), "courier-v2"), vec![url("/a.js")]);

    fetcher.fail(&url("/static/app.js"));
    let response = agent
      .handle_fetch(Request::get(url("/static/app.js")))
      .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"console.log(1)");
    assert_eq!(response.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_individual_fallback_uses_route_partition() {
    let fetcher = online_fetcher();
    fetcher.respond(&url("/static/app.js"), 200, "console.log(1)");
    fetcher.fail(&url("/a.js"));
    let mut config = test_config();
    config.manifest.static_assets = vec!["/static/app.js".to_string(), "/a.js".to_string()];
    let ctx = test_context_with(config, fetcher);

    let report = LifecycleManager::new().install(&ctx).await;
    assert!(!report.bulk);
    assert_eq!(report.misses, vec!["/a.js".to_string()]);
    assert_eq!(urls(&ctx, "courier-assets-v2"), vec![url("/static/app.js")]);
    assert!(urls(&ctx, "courier-v2").is_empty());
  }

  #[tokio::test]
  async fn test_error_status_is_a_miss() {
    let fetcher = online_fetcher();
    fetcher.respond(&url("/offline.html"), 404, "missing");
    let ctx = test_context(fetcher);

    let report = LifecycleManager::new().install(&ctx).await;
    assert_eq!(report.offline_pages, 0);
    assert_eq!(report.misses, vec!["/offline.html".to_string()]);
  }

  #[test]
  fn test_activate_deletes_other_versions_only() {
    let ctx = test_context(Arc::new(ScriptedFetcher::new()));
    let entry = CacheEntry::from_response(RequestKey::get(url("/a.js")), &Response::new(200, "a"));
    for partition in [
      "courier-v1",
      "courier-admin-v1",
      "courier-business-v1",
      "courier-v2",
      "courier-business-v2",
      "dispatch-v1",
    ] {
      ctx.storage.put(partition, &entry).unwrap();
    }

    let lifecycle = LifecycleManager::new();
    let report = lifecycle.activate(&ctx).unwrap();

    assert_eq!(
      report.deleted_partitions,
      vec!["courier-business-v1", "courier-v1"]
    );
    assert_eq!(
      ctx.storage.partitions().unwrap(),
      vec![
        "courier-admin-v1",
        "courier-business-data-v2",
        "courier-business-v2",
        "courier-v2",
        "dispatch-v1"
      ]
    );
    assert_eq!(lifecycle.state(), LifecycleState::Active);
  }

  #[test]
  fn test_activate_seeds_business_data_once() {
    let ctx = test_context(Arc::new(ScriptedFetcher::new()));
    let lifecycle = LifecycleManager::new();

    assert!(lifecycle.activate(&ctx).unwrap().seeded);
    assert!(!lifecycle.activate(&ctx).unwrap().seeded);

    let doc = ctx
      .storage
      .get(
        "courier-business-data-v2",
        &RequestKey::get(url(BUSINESS_DATA_PATH)),
      )
      .unwrap()
      .unwrap();
    let body: Value = serde_json::from_slice(&doc.body).unwrap();
    assert_eq!(body["drafts"], json!([]));
    assert_eq!(body["lastSync"], Value::Null);
  }

  #[test]
  fn test_activate_claims_open_tabs() {
    let ctx = test_context(Arc::new(ScriptedFetcher::new()));
    let (id, _rx) = ctx.clients.connect(url("/"));

    let report = LifecycleManager::new().activate(&ctx).unwrap();
    assert_eq!(report.claimed_clients, 1);
    assert!(ctx.clients.is_controlled(id));
  }

  #[tokio::test]
  async fn test_skip_waiting_only_from_installed() {
    let ctx = test_context(online_fetcher());
    let lifecycle = LifecycleManager::new();

    assert!(lifecycle.skip_waiting(&ctx).unwrap().is_none());
    assert_eq!(lifecycle.state(), LifecycleState::Parsed);

    lifecycle.install(&ctx).await;
    assert!(lifecycle.skip_waiting(&ctx).unwrap().is_some());
    assert_eq!(lifecycle.state(), LifecycleState::Active);
    assert!(lifecycle.skip_waiting(&ctx).unwrap().is_none());
  }
}
