//! Network access with per-request timeouts.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::http::{Request, Response, ResponseSource};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something that can put a request on the wire.
///
/// An `Err` means the request never produced a response (connection refused,
/// DNS failure, aborted). Non-2xx statuses are returned as `Ok`.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// Fetch with an upper bound on how long the request may take.
///
/// A timeout is reported as an ordinary network error.
pub async fn fetch_with_timeout(
  fetcher: &dyn Fetcher,
  request: &Request,
  timeout: Duration,
) -> Result<Response> {
  match tokio::time::timeout(timeout, fetcher.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(eyre!(
      "Request to {} timed out after {}s",
      request.url,
      timeout.as_secs_f32()
    )),
  }
}

/// Fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offline-agent/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(async move {
      let mut builder = self.client.request(request.method.clone(), &request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body from {}: {}", request.url, e))?;

      Ok(Response {
        status,
        headers,
        body: body.to_vec(),
        source: ResponseSource::Network,
      })
    })
  }
}
