//! The agent entry point and the context shared by its components.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{eviction, CacheEntry, CacheNamespace, CacheStorage};
use crate::clients::{ClientId, ClientMessage, ClientRegistry};
use crate::config::{Algorithm, Config};
use crate::http::{Request, RequestKey, Response};
use crate::lifecycle::{ActivationReport, InstallReport, LifecycleManager, LifecycleState};
use crate::network::{self, Fetcher};
use crate::offline;
use crate::strategy::{self, Route, StrategyMatcher, DEFAULT_STRATEGY};
use crate::sync::{SyncCoordinator, SyncMetrics, SyncType};

/// Everything a strategy, lifecycle step or sync routine needs.
///
/// Built once at startup and shared behind an `Arc`.
pub struct AgentContext {
  pub config: Config,
  pub namespace: CacheNamespace,
  pub storage: Arc<dyn CacheStorage>,
  pub fetcher: Arc<dyn Fetcher>,
  pub matcher: StrategyMatcher,
  pub clients: ClientRegistry,
}

impl AgentContext {
  pub fn new(
    config: Config,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let matcher = StrategyMatcher::new(&config.strategies)?;
    let namespace = CacheNamespace::new(&config.app.name, &config.app.version)
      .with_labels(config.strategies.iter().map(|s| s.name.as_str()));

    Ok(Self {
      config,
      namespace,
      storage,
      fetcher,
      matcher,
      clients: ClientRegistry::new(),
    })
  }

  /// Resolve the strategy, partition and limits for `url`.
  ///
  /// Unmatched URLs go network-first into the main partition.
  pub fn route(&self, url: &str) -> Route {
    match self.matcher.find(url) {
      Some(strategy) => Route {
        name: strategy.name.clone(),
        algorithm: strategy.algorithm,
        partition: self.namespace.partition(&strategy.name),
        max_entries: strategy.max_entries,
        max_age: strategy.max_age(),
        timeout: self.config.strategy_timeout(strategy),
      },
      None => Route {
        name: DEFAULT_STRATEGY.to_string(),
        algorithm: Algorithm::NetworkFirst,
        partition: self.namespace.main(),
        max_entries: None,
        max_age: None,
        timeout: self.config.network_timeout(),
      },
    }
  }

  pub async fn fetch(&self, request: &Request, timeout: Duration) -> Result<Response> {
    network::fetch_with_timeout(self.fetcher.as_ref(), request, timeout).await
  }

  /// Cache lookup that treats storage failures as a miss.
  pub fn lookup(&self, partition: &str, key: &RequestKey) -> Option<CacheEntry> {
    match self.storage.get(partition, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(partition, %key, "Cache read failed: {}", e);
        None
      }
    }
  }

  /// Store a response in the route's partition, then trim the partition.
  ///
  /// Storage failures are logged and swallowed.
  pub fn write_through(&self, route: &Route, key: &RequestKey, response: &Response) {
    let entry = CacheEntry::from_response(key.clone(), response);
    if let Err(e) = self.storage.put(&route.partition, &entry) {
      warn!(partition = %route.partition, %key, "Cache write skipped: {}", e);
      return;
    }

    match eviction::enforce(self.storage.as_ref(), &route.partition, route.max_entries) {
      Ok(0) => {}
      Ok(removed) => debug!(partition = %route.partition, removed, "Trimmed partition"),
      Err(e) => warn!(partition = %route.partition, "Eviction failed: {}", e),
    }
  }

  pub fn sync_tag(&self, sync_type: &SyncType) -> String {
    format!("{}-sync-{}", self.config.sync_prefix(), sync_type.as_str())
  }
}

/// Inbound control messages from open tabs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate a waiting agent now
  SkipWaiting,
  /// Zero the sync counters
  ResetSyncMetrics,
  /// The real-time channel reported a change; drop the cached copy
  DataChanged { url: String },
}

/// A running agent instance.
pub struct Agent {
  ctx: Arc<AgentContext>,
  lifecycle: LifecycleManager,
  sync: SyncCoordinator,
}

impl Agent {
  pub fn new(
    config: Config,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    Ok(Self::with_context(Arc::new(AgentContext::new(
      config, storage, fetcher,
    )?)))
  }

  pub fn with_context(ctx: Arc<AgentContext>) -> Self {
    Self {
      ctx,
      lifecycle: LifecycleManager::new(),
      sync: SyncCoordinator::new(),
    }
  }

  pub fn context(&self) -> &Arc<AgentContext> {
    &self.ctx
  }

  pub fn state(&self) -> LifecycleState {
    self.lifecycle.state()
  }

  /// Run the install step, activating immediately when `skip_waiting` is set.
  pub async fn install(&self) -> Result<InstallReport> {
    let report = self.lifecycle.install(&self.ctx).await;
    if self.ctx.config.app.skip_waiting {
      self.lifecycle.skip_waiting(&self.ctx)?;
    }
    Ok(report)
  }

  pub fn activate(&self) -> Result<ActivationReport> {
    self.lifecycle.activate(&self.ctx)
  }

  /// Answer an intercepted request. Never fails.
  pub async fn handle_fetch(&self, request: Request) -> Response {
    let route = self.ctx.route(&request.url);
    debug!(url = %request.url, method = %request.method, strategy = %route.name, "Intercepted request");

    if !request.is_cacheable() {
      return self.send_mutation(&route, request).await;
    }
    strategy::handle(&self.ctx, &route, &request).await
  }

  /// Non-GET requests bypass the cache. When the network is down, writes to
  /// queueable endpoints are held for the next `requests` sync.
  async fn send_mutation(&self, route: &Route, request: Request) -> Response {
    match self.ctx.fetch(&request, route.timeout).await {
      Ok(response) => response,
      Err(e) => {
        warn!(url = %request.url, method = %request.method, "Write failed: {}", e);
        if request.is_write() && offline::can_queue(&request.path()) {
          let pending = self.sync.enqueue(request.clone());
          let tag = self.ctx.sync_tag(&SyncType::Requests);
          info!(url = %request.url, pending, tag = %tag, "Queued write for deferred sync");
          self.sync.register(tag);
        }
        offline::respond(&self.ctx, route, &request)
      }
    }
  }

  pub fn handle_message(&self, message: ControlMessage) -> Result<()> {
    match message {
      ControlMessage::SkipWaiting => {
        self.lifecycle.skip_waiting(&self.ctx)?;
      }
      ControlMessage::ResetSyncMetrics => self.sync.reset_metrics(),
      ControlMessage::DataChanged { url } => {
        let url = self.ctx.config.resolve_url(&url)?;
        let route = self.ctx.route(&url);
        let removed = self
          .ctx
          .storage
          .delete(&route.partition, &RequestKey::get(url.as_str()))?;
        debug!(url = %url, removed, "Invalidated cached entry");
      }
    }
    Ok(())
  }

  /// Parse a raw control message as posted by a tab.
  pub fn handle_raw_message(&self, raw: &str) -> Result<()> {
    let message: ControlMessage =
      serde_json::from_str(raw).map_err(|e| eyre!("Unrecognised control message {}: {}", raw, e))?;
    self.handle_message(message)
  }

  /// Deferred sync wake-up. An `Err` asks the host to retry later.
  pub async fn on_sync_wake(&self, tag: &str) -> Result<()> {
    self.sync.on_sync_wake(&self.ctx, tag).await
  }

  /// Tags registered since the last call, oldest first.
  pub fn take_sync_tags(&self) -> Vec<String> {
    self.sync.take_registered()
  }

  pub fn register_sync_tag(&self, tag: impl Into<String>) {
    self.sync.register(tag.into());
  }

  pub fn sync_metrics(&self) -> SyncMetrics {
    self.sync.metrics()
  }

  pub fn connect_client(
    &self,
    url: impl Into<String>,
  ) -> (ClientId, mpsc::UnboundedReceiver<ClientMessage>) {
    self.ctx.clients.connect(url)
  }

  pub fn disconnect_client(&self, id: ClientId) -> bool {
    self.ctx.clients.disconnect(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::ResponseSource;
  use crate::testing::{test_agent, ScriptedFetcher, ORIGIN};
  use reqwest::Method;
  use serde_json::{json, Value};

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  #[test]
  fn test_unmatched_route_defaults_to_network_first_main() {
    let agent = test_agent(Arc::new(ScriptedFetcher::new()));
    let route = agent.context().route(&url("/api/unknown"));
    assert_eq!(route.name, "default");
    assert_eq!(route.algorithm, Algorithm::NetworkFirst);
    assert_eq!(route.partition, "courier-v2");
    assert_eq!(route.timeout, Duration::from_secs(8));
  }

  #[tokio::test]
  async fn test_scenario_network_first_stores_enriched_copy() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond_json(&url("/api/business/profile"), json!({"id": 1}));
    let agent = test_agent(fetcher.clone());

    let response = agent
      .handle_fetch(Request::get(url("/api/business/profile")))
      .await;
    assert_eq!(response.json_body().unwrap(), json!({"id": 1}));

    let stored = agent
      .context()
      .storage
      .get(
        "courier-business-v2",
        &RequestKey::get(url("/api/business/profile")),
      )
      .unwrap()
      .unwrap();
    let mut body: Value = serde_json::from_slice(&stored.body).unwrap();
    let cached_at = body["_cached"].as_i64().unwrap();
    assert!(cached_at > 0);
    body.as_object_mut().unwrap().remove("_cached");
    assert_eq!(body, json!({"id": 1, "_strategy": "business"}));
  }

  #[tokio::test]
  async fn test_scenario_network_failure_serves_prior_copy() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond_json(&url("/api/business/profile"), json!({"id": 1}));
    let agent = test_agent(fetcher.clone());
    agent
      .handle_fetch(Request::get(url("/api/business/profile")))
      .await;

    fetcher.fail(&url("/api/business/profile"));
    let response = agent
      .handle_fetch(Request::get(url("/api/business/profile")))
      .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.source, ResponseSource::CacheStale);
    assert_eq!(response.json_body().unwrap()["id"], json!(1));
  }

  #[tokio::test]
  async fn test_scenario_delivery_request_offline_without_cache() {
    let agent = test_agent(Arc::new(ScriptedFetcher::new()));

    let response = agent
      .handle_fetch(Request::get(url("/api/delivery-requests")))
      .await;
    assert_eq!(response.status, 503);
    assert_eq!(response.json_body().unwrap()["canQueue"], json!(true));
  }

  #[tokio::test]
  async fn test_offline_write_is_queued_and_tag_registered() {
    let agent = test_agent(Arc::new(ScriptedFetcher::new()));

    let request = Request::new(Method::POST, url("/api/delivery-requests"))
      .with_header("content-type", "application/json")
      .with_body(r#"{"pickup":"A"}"#);
    let response = agent.handle_fetch(request).await;

    assert_eq!(response.status, 503);
    assert_eq!(agent.sync_metrics().pending, 1);
    assert_eq!(agent.take_sync_tags(), vec!["courier-sync-requests"]);
    assert!(agent.take_sync_tags().is_empty());
  }

  #[tokio::test]
  async fn test_offline_write_to_non_queueable_endpoint_is_not_queued() {
    let agent = test_agent(Arc::new(ScriptedFetcher::new()));

    let request = Request::new(Method::PUT, url("/api/business/profile")).with_body("{}");
    let response = agent.handle_fetch(request).await;

    assert_eq!(response.status, 503);
    assert_eq!(agent.sync_metrics().pending, 0);
    assert!(agent.take_sync_tags().is_empty());
  }

  #[tokio::test]
  async fn test_offline_head_is_not_queued() {
    let agent = test_agent(Arc::new(ScriptedFetcher::new()));

    for method in [Method::HEAD, Method::OPTIONS] {
      let response = agent
        .handle_fetch(Request::new(method, url("/api/delivery-requests")))
        .await;
      assert_eq!(response.status, 503);
    }
    assert_eq!(agent.sync_metrics().pending, 0);
    assert!(agent.take_sync_tags().is_empty());
  }

  #[tokio::test]
  async fn test_online_write_passes_through_uncached() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond(&url("/api/delivery-requests"), 201, "{\"id\":9}");
    let agent = test_agent(fetcher.clone());

    let request = Request::new(Method::POST, url("/api/delivery-requests")).with_body("{}");
    let response = agent.handle_fetch(request).await;

    assert_eq!(response.status, 201);
    assert!(agent
      .context()
      .storage
      .keys("courier-requests-v2")
      .unwrap()
      .is_empty());
  }

  #[tokio::test]
  async fn test_data_changed_drops_cached_entry() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond_json(&url("/api/business/profile"), json!({"id": 1}));
    let agent = test_agent(fetcher.clone());
    agent
      .handle_fetch(Request::get(url("/api/business/profile")))
      .await;

    agent
      .handle_raw_message(r#"{"type":"DATA_CHANGED","url":"/api/business/profile"}"#)
      .unwrap();
    assert!(agent
      .context()
      .storage
      .keys("courier-business-v2")
      .unwrap()
      .is_empty());
  }

  #[test]
  fn test_raw_message_parsing() {
    let agent = test_agent(Arc::new(ScriptedFetcher::new()));
    assert!(agent.handle_raw_message(r#"{"type":"RESET_SYNC_METRICS"}"#).is_ok());
    assert!(agent.handle_raw_message(r#"{"type":"REBOOT"}"#).is_err());
    assert!(agent.handle_raw_message("not json").is_err());
  }
}
