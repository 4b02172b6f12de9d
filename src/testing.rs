//! Fixtures shared by the unit tests.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::{Agent, AgentContext};
use crate::cache::MemoryStorage;
use crate::config::Config;
use crate::http::{Request, Response};
use crate::network::{BoxFuture, Fetcher};

pub const ORIGIN: &str = "https://app.test";

const TEST_CONFIG: &str = r#"
app:
  name: courier
  version: "2"
  origin: https://app.test
manifest:
  static_assets: ["/a.js", "/b.js"]
  offline_pages: ["/offline.html"]
  critical_endpoints: ["/api/business/profile"]
strategies:
  - name: business
    algorithm: network-first
    url_patterns: ["/api/business/"]
    max_entries: 3
  - name: assets
    algorithm: cache-first
    url_patterns: ["/static/*.js"]
    max_entries: 2
    max_age_seconds: 60
  - name: dashboard
    algorithm: stale-while-revalidate
    url_patterns: ["/api/dashboard"]
    network_timeout_seconds: 1
  - name: live
    algorithm: network-only
    url_patterns: ["/api/live"]
  - name: archive
    algorithm: cache-only
    url_patterns: ["/api/archive"]
  - name: requests
    algorithm: network-first
    url_patterns: ["/api/delivery-requests"]
"#;

#[derive(Clone)]
enum Script {
  Respond { status: u16, body: Vec<u8> },
  Slow { delay: Duration, body: Vec<u8> },
  Fail,
}

/// Fetcher answering from a per-URL script. Unscripted URLs behave as if
/// the network were down.
#[derive(Default)]
pub struct ScriptedFetcher {
  scripts: Mutex<HashMap<String, Script>>,
  calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  fn script(&self, url: &str, script: Script) {
    self.scripts.lock().unwrap().insert(url.to_string(), script);
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self.script(
      url,
      Script::Respond {
        status,
        body: body.as_bytes().to_vec(),
      },
    );
  }

  pub fn respond_json(&self, url: &str, value: Value) {
    self.respond(url, 200, &value.to_string());
  }

  pub fn respond_slowly(&self, url: &str, delay: Duration, value: Value) {
    self.script(
      url,
      Script::Slow {
        delay,
        body: value.to_string().into_bytes(),
      },
    );
  }

  pub fn fail(&self, url: &str) {
    self.script(url, Script::Fail);
  }

  pub fn calls(&self, url: &str) -> usize {
    self.methods(url).len()
  }

  /// Methods of the requests made to `url`, in order.
  pub fn methods(&self, url: &str) -> Vec<String> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, called)| called == url)
      .map(|(method, _)| method.clone())
      .collect()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

fn json_response(status: u16, body: Vec<u8>) -> Response {
  let response = Response::new(status, body);
  if serde_json::from_slice::<Value>(&response.body).is_ok() {
    response.with_header("content-type", "application/json")
  } else {
    response
  }
}

impl Fetcher for ScriptedFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    self
      .calls
      .lock()
      .unwrap()
      .push((request.method.to_string(), request.url.clone()));
    let script = self.scripts.lock().unwrap().get(&request.url).cloned();

    Box::pin(async move {
      match script {
        Some(Script::Respond { status, body }) => Ok(json_response(status, body)),
        Some(Script::Slow { delay, body }) => {
          tokio::time::sleep(delay).await;
          Ok(json_response(200, body))
        }
        Some(Script::Fail) | None => Err(eyre!("Connection refused: {}", request.url)),
      }
    })
  }
}

pub fn test_config() -> Config {
  Config::from_yaml(TEST_CONFIG).unwrap()
}

pub fn test_context(fetcher: Arc<ScriptedFetcher>) -> Arc<AgentContext> {
  test_context_with(test_config(), fetcher)
}

pub fn test_context_with(config: Config, fetcher: Arc<ScriptedFetcher>) -> Arc<AgentContext> {
  Arc::new(AgentContext::new(config, Arc::new(MemoryStorage::new()), fetcher).unwrap())
}

pub fn test_agent(fetcher: Arc<ScriptedFetcher>) -> Agent {
  Agent::with_context(test_context(fetcher))
}
