//! Stored responses.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::http::{RequestKey, Response, ResponseSource, CACHED_AT_HEADER};

/// A response held in a partition, keyed by request identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl CacheEntry {
  /// Copy a response for storage, stamping the write time.
  pub fn from_response(key: RequestKey, response: &Response) -> Self {
    Self::stamped(key, response, Utc::now())
  }

  pub fn stamped(key: RequestKey, response: &Response, at: DateTime<Utc>) -> Self {
    let mut headers = response.headers.clone();
    headers.insert(CACHED_AT_HEADER.to_string(), at.to_rfc3339());
    Self {
      key,
      status: response.status,
      headers,
      body: response.body.clone(),
    }
  }

  /// When this entry was written, if the timestamp header survived.
  pub fn stored_at(&self) -> Option<DateTime<Utc>> {
    self
      .headers
      .get(CACHED_AT_HEADER)
      .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
      .map(|dt| dt.with_timezone(&Utc))
  }

  /// Age at `now`. `None` means unknown, which callers treat as infinitely old.
  pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
    self.stored_at().map(|at| now - at)
  }

  pub fn to_response(&self, source: ResponseSource) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
      source,
    }
  }
}
