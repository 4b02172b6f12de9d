//! Request and response values passed between the host, the network and the cache.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Header stamped on every cached copy, holding the RFC 3339 write time.
pub const CACHED_AT_HEADER: &str = "x-agent-cached-at";

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Script-initiated data request
  #[default]
  Cors,
}

/// An outgoing request intercepted by the agent.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  /// Absolute URL, query string included
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
      mode: RequestMode::default(),
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Mark this request as a page navigation.
  pub fn navigate(mut self) -> Self {
    self.mode = RequestMode::Navigate;
    self
  }

  /// Cache identity of this request.
  pub fn key(&self) -> RequestKey {
    RequestKey {
      method: self.method.as_str().to_string(),
      url: self.url.clone(),
    }
  }

  /// Only GET requests are ever cached.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET
  }

  /// Methods that change server state and may be replayed after an outage.
  pub fn is_write(&self) -> bool {
    matches!(
      self.method,
      Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
      || self
        .headers
        .get("accept")
        .is_some_and(|accept| accept.contains("text/html"))
  }

  /// Path component of the URL, without query or fragment.
  pub fn path(&self) -> String {
    match url::Url::parse(&self.url) {
      Ok(parsed) => parsed.path().to_string(),
      Err(_) => self
        .url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string(),
    }
  }
}

/// Canonical request identity: method plus URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: Method::GET.as_str().to_string(),
      url: url.into(),
    }
  }

  /// Stable hash used as the storage primary key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  Cache,
  /// Data from cache, stale or served because the network failed
  CacheStale,
  /// Synthetic response built while offline
  Offline,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::CacheStale => "cache-stale",
      Self::Offline => "offline",
    };
    f.write_str(label)
  }
}

/// A response handed back to the page.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
      source: ResponseSource::Network,
    }
  }

  pub fn json(status: u16, value: &Value) -> Self {
    Self::new(status, value.to_string()).with_header("content-type", "application/json")
  }

  pub fn html(status: u16, page: impl Into<String>) -> Self {
    Self::new(status, page.into()).with_header("content-type", "text/html; charset=utf-8")
  }

  /// Equivalent of a rejected fetch: no status, no body.
  pub fn network_error() -> Self {
    Self::new(0, Vec::new())
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_network_error(&self) -> bool {
    self.status == 0
  }

  pub fn json_body(&self) -> Result<Value> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Response body is not JSON: {}", e))
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Write time recorded on a cached copy, if any.
  pub fn cached_at(&self) -> Option<DateTime<Utc>> {
    self
      .header(CACHED_AT_HEADER)
      .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
      .map(|dt| dt.with_timezone(&Utc))
  }
}
