//! Synthetic responses for when neither the network nor the cache can answer.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::agent::AgentContext;
use crate::http::{Request, RequestKey, Response, ResponseSource};
use crate::strategy::Route;

/// Pre-cached pricing table consulted by estimate envelopes.
pub const FALLBACK_RATES_PATH: &str = "/api/pricing/fallback-rates";

/// Known data endpoints and what to tell the page about each.
struct OfflineNotice {
  prefix: &'static str,
  error: &'static str,
  message: &'static str,
  can_queue: bool,
  estimated_sync: Option<&'static str>,
  fallback_rates: bool,
}

const NOTICES: &[OfflineNotice] = &[
  OfflineNotice {
    prefix: "/api/delivery-requests",
    error: "Offline",
    message: "Cannot submit delivery requests while offline. Your request will be queued and sent when the connection is restored.",
    can_queue: true,
    estimated_sync: Some("When connection is restored"),
    fallback_rates: false,
  },
  OfflineNotice {
    prefix: "/api/estimates",
    error: "Pricing unavailable",
    message: "Live pricing requires a connection. Showing fallback rates.",
    can_queue: false,
    estimated_sync: None,
    fallback_rates: true,
  },
  OfflineNotice {
    prefix: "/api/pricing",
    error: "Pricing unavailable",
    message: "Live pricing requires a connection. Showing fallback rates.",
    can_queue: false,
    estimated_sync: None,
    fallback_rates: true,
  },
  OfflineNotice {
    prefix: "/api/business",
    error: "Business data unavailable",
    message: "Business data requires a connection.",
    can_queue: false,
    estimated_sync: None,
    fallback_rates: false,
  },
  OfflineNotice {
    prefix: "/api/analytics",
    error: "Analytics unavailable",
    message: "Analytics will be updated when the connection is restored.",
    can_queue: true,
    estimated_sync: Some("When connection is restored"),
    fallback_rates: false,
  },
];

fn notice_for(path: &str) -> Option<&'static OfflineNotice> {
  NOTICES.iter().find(|n| path.starts_with(n.prefix))
}

/// Whether a write to `path` may be queued for deferred sync.
pub fn can_queue(path: &str) -> bool {
  notice_for(path).is_some_and(|n| n.can_queue)
}

fn default_fallback_rates() -> Value {
  json!({
    "currency": "USD",
    "baseFare": 8.5,
    "perKm": 1.25,
    "perMinute": 0.35,
    "minimumFare": 12.0
  })
}

/// Build the best offline answer for `request`. Never fails.
pub fn respond(ctx: &AgentContext, route: &Route, request: &Request) -> Response {
  let response = if request.is_navigation() {
    offline_page(ctx)
  } else {
    data_envelope(ctx, route, request)
  };
  response.with_source(ResponseSource::Offline)
}

fn data_envelope(ctx: &AgentContext, route: &Route, request: &Request) -> Response {
  let path = request.path();
  let mut envelope = Map::new();

  match notice_for(&path) {
    Some(notice) => {
      envelope.insert("error".into(), notice.error.into());
      envelope.insert("message".into(), notice.message.into());
      if notice.can_queue {
        envelope.insert("canQueue".into(), true.into());
      }
      if let Some(eta) = notice.estimated_sync {
        envelope.insert("estimatedSync".into(), eta.into());
      }
      if notice.fallback_rates {
        envelope.insert("fallbackRates".into(), fallback_rates(ctx));
      }
    }
    None => {
      envelope.insert("error".into(), "Offline".into());
      envelope.insert(
        "message".into(),
        "This feature requires an internet connection.".into(),
      );
      envelope.insert("path".into(), path.clone().into());
    }
  }
  envelope.insert("offline".into(), true.into());

  if request.is_cacheable() {
    if let Some(entry) = ctx.lookup(&route.partition, &request.key()) {
      match serde_json::from_slice::<Value>(&entry.body) {
        Ok(cached) => {
          if let Some(Value::String(message)) = envelope.get_mut("message") {
            message.push_str(" Cached data is available.");
          }
          if let Some(at) = entry.stored_at() {
            envelope.insert("cachedAt".into(), at.to_rfc3339().into());
          }
          envelope.insert("cachedData".into(), cached);
        }
        Err(e) => debug!(url = %request.url, "Ignoring malformed cached payload: {}", e),
      }
    }
  }

  Response::json(503, &Value::Object(envelope))
}

fn fallback_rates(ctx: &AgentContext) -> Value {
  let cached = ctx
    .config
    .resolve_url(FALLBACK_RATES_PATH)
    .ok()
    .and_then(|url| ctx.storage.match_any(&RequestKey::get(url)).ok().flatten())
    .and_then(|entry| serde_json::from_slice::<Value>(&entry.body).ok());

  match cached {
    Some(Value::Object(mut rates)) => {
      rates.remove("_cached");
      rates.remove("_strategy");
      Value::Object(rates)
    }
    Some(other) => other,
    None => default_fallback_rates(),
  }
}

fn offline_page(ctx: &AgentContext) -> Response {
  let cached = ctx
    .config
    .manifest
    .offline_pages
    .first()
    .and_then(|page| ctx.config.resolve_url(page).ok())
    .and_then(|url| ctx.lookup(&ctx.namespace.offline(), &RequestKey::get(url)));

  match cached {
    Some(entry) => entry.to_response(ResponseSource::Offline),
    None => Response::html(503, OFFLINE_PAGE),
  }
}

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; min-height: 100vh; align-items: center; justify-content: center; margin: 0; background: #f5f5f5; color: #222; }
    main { text-align: center; padding: 2rem; max-width: 28rem; }
    button { margin-top: 1rem; padding: 0.6rem 1.4rem; border: 0; border-radius: 6px; background: #2563eb; color: #fff; font-size: 1rem; cursor: pointer; }
    #status { margin-top: 0.75rem; font-size: 0.9rem; color: #666; }
  </style>
</head>
<body>
  <main>
    <h1>You are offline</h1>
    <p>This page is not available without a connection. Anything you submit will be sent once you are back online.</p>
    <button onclick="location.reload()">Try again</button>
    <p id="status">Waiting for connection&hellip;</p>
  </main>
  <script>
    window.addEventListener('online', function () {
      document.getElementById('status').textContent = 'Back online, reloading...';
      location.reload();
    });
    if (navigator.onLine) {
      document.getElementById('status').textContent = 'Connection detected. Try again.';
    }
  </script>
</body>
</html>
"#;
