//! The five caching algorithms.
//!
//! Every path resolves to a `Response`. Network failures fall back to the
//! cache or to a synthetic offline response; storage failures only skip the
//! cache write.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::Route;
use crate::agent::AgentContext;
use crate::cache::CacheEntry;
use crate::config::Algorithm;
use crate::http::{Request, Response, ResponseSource};
use crate::offline;

/// Serve a GET request according to its route.
pub async fn handle(ctx: &Arc<AgentContext>, route: &Route, request: &Request) -> Response {
  match route.algorithm {
    Algorithm::CacheFirst => cache_first(ctx, route, request).await,
    Algorithm::NetworkFirst => network_first(ctx, route, request).await,
    Algorithm::StaleWhileRevalidate => stale_while_revalidate(ctx, route, request).await,
    Algorithm::NetworkOnly => network_only(ctx, route, request).await,
    Algorithm::CacheOnly => cache_only(ctx, route, request),
  }
}

/// The copy of a network response that goes into the cache.
///
/// Network-first and stale-while-revalidate store JSON objects with
/// `_cached` (epoch milliseconds) and `_strategy` added; anything else is
/// stored as received.
pub fn stored_copy(route: &Route, response: &Response) -> Response {
  match route.algorithm {
    Algorithm::NetworkFirst | Algorithm::StaleWhileRevalidate => enrich(response, &route.name),
    Algorithm::CacheFirst | Algorithm::NetworkOnly | Algorithm::CacheOnly => response.clone(),
  }
}

fn enrich(response: &Response, strategy: &str) -> Response {
  let mut copy = response.clone();
  match serde_json::from_slice::<Value>(&response.body) {
    Ok(Value::Object(mut fields)) => {
      fields.insert("_cached".into(), Value::from(Utc::now().timestamp_millis()));
      fields.insert("_strategy".into(), Value::from(strategy));
      copy.body = Value::Object(fields).to_string().into_bytes();
    }
    _ => debug!(strategy, "Response body is not a JSON object, storing as received"),
  }
  copy
}

fn is_fresh(entry: &CacheEntry, route: &Route) -> bool {
  let Some(max_age) = route.max_age else {
    return true;
  };
  match entry.age(Utc::now()) {
    Some(age) => age.to_std().map(|age| age <= max_age).unwrap_or(true),
    None => false,
  }
}

async fn cache_first(ctx: &Arc<AgentContext>, route: &Route, request: &Request) -> Response {
  let key = request.key();

  if let Some(entry) = ctx.lookup(&route.partition, &key) {
    if is_fresh(&entry, route) {
      return entry.to_response(ResponseSource::Cache);
    }

    debug!(url = %request.url, strategy = %route.name, "Cached entry is stale, refreshing in background");
    spawn_refresh(ctx.clone(), route.clone(), request.clone(), false);
    return entry.to_response(ResponseSource::CacheStale);
  }

  match ctx.fetch(request, route.timeout).await {
    Ok(response) => {
      if response.is_success() {
        ctx.write_through(route, &key, &stored_copy(route, &response));
      }
      response
    }
    Err(e) => {
      warn!(url = %request.url, strategy = %route.name, "Network unavailable: {}", e);
      offline::respond(ctx, route, request)
    }
  }
}

async fn network_first(ctx: &Arc<AgentContext>, route: &Route, request: &Request) -> Response {
  let key = request.key();

  match ctx.fetch(request, route.timeout).await {
    Ok(response) if response.is_success() => {
      ctx.write_through(route, &key, &stored_copy(route, &response));
      return response;
    }
    Ok(response) => {
      debug!(url = %request.url, status = response.status, "Network returned an error status, trying cache");
    }
    Err(e) => {
      debug!(url = %request.url, "Network failed, trying cache: {}", e);
    }
  }

  match ctx.lookup(&route.partition, &key) {
    Some(entry) => entry.to_response(ResponseSource::CacheStale),
    None => offline::respond(ctx, route, request),
  }
}

async fn stale_while_revalidate(
  ctx: &Arc<AgentContext>,
  route: &Route,
  request: &Request,
) -> Response {
  let key = request.key();

  if let Some(entry) = ctx.lookup(&route.partition, &key) {
    spawn_refresh(ctx.clone(), route.clone(), request.clone(), true);
    return entry.to_response(ResponseSource::Cache);
  }

  match ctx.fetch(request, route.timeout).await {
    Ok(response) => {
      if response.is_success() {
        ctx.write_through(route, &key, &stored_copy(route, &response));
      }
      response
    }
    Err(e) => {
      warn!(url = %request.url, strategy = %route.name, "Network unavailable: {}", e);
      offline::respond(ctx, route, request)
    }
  }
}

async fn network_only(ctx: &Arc<AgentContext>, route: &Route, request: &Request) -> Response {
  match ctx.fetch(request, route.timeout).await {
    Ok(response) => response,
    Err(e) => {
      warn!(url = %request.url, "Network-only request failed: {}", e);
      Response::network_error()
    }
  }
}

fn cache_only(ctx: &Arc<AgentContext>, route: &Route, request: &Request) -> Response {
  match ctx.lookup(&route.partition, &request.key()) {
    Some(entry) => entry.to_response(ResponseSource::Cache),
    None => offline::respond(ctx, route, request),
  }
}

/// Refresh a cached entry without holding up the caller.
///
/// Failures are logged and dropped; a failed refresh is never retried.
fn spawn_refresh(
  ctx: Arc<AgentContext>,
  route: Route,
  request: Request,
  notify_clients: bool,
) {
  tokio::spawn(async move {
    match ctx.fetch(&request, route.timeout).await {
      Ok(response) if response.is_success() => {
        ctx.write_through(&route, &request.key(), &stored_copy(&route, &response));
        if notify_clients {
          let data = response.json_body().unwrap_or(Value::Null);
          ctx.clients.notify(&request.url, data);
        }
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "Background refresh got an error status, keeping cached copy");
      }
      Err(e) => {
        debug!(url = %request.url, "Background refresh dropped: {}", e);
      }
    }
  });
}
