//! Size limits for partitions, trimmed by business priority.

use color_eyre::Result;
use tracing::debug;

use super::storage::CacheStorage;
use crate::http::RequestKey;

/// Endpoint categories that must survive eviction longest.
const TRANSACTIONAL_MARKERS: &[&str] = &[
  "/delivery",
  "/requests",
  "/orders",
  "/payments",
  "/transactions",
];

const ANALYTICS_MARKERS: &[&str] = &["/analytics", "/metrics", "/reports"];

/// Eviction rank of a cached URL. Higher ranks are kept longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BusinessPriority {
  Standard,
  Analytics,
  Transactional,
}

impl BusinessPriority {
  pub fn of(url: &str) -> Self {
    if TRANSACTIONAL_MARKERS.iter().any(|m| url.contains(m)) {
      Self::Transactional
    } else if ANALYTICS_MARKERS.iter().any(|m| url.contains(m)) {
      Self::Analytics
    } else {
      Self::Standard
    }
  }
}

/// Pick the keys to drop so that at most `max_entries` remain.
///
/// `keys` must be in write order, oldest first. Entries are ranked by
/// descending priority and, within a priority, newest first; the tail of
/// that ranking is returned.
pub fn select_victims(keys: Vec<RequestKey>, max_entries: usize) -> Vec<RequestKey> {
  if keys.len() <= max_entries {
    return Vec::new();
  }

  let mut ranked: Vec<(usize, BusinessPriority, RequestKey)> = keys
    .into_iter()
    .enumerate()
    .map(|(position, key)| (position, BusinessPriority::of(&key.url), key))
    .collect();
  ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));

  ranked
    .split_off(max_entries)
    .into_iter()
    .map(|(_, _, key)| key)
    .collect()
}

/// Trim `partition` to `max_entries`. Returns how many entries were removed.
pub fn enforce(
  storage: &dyn CacheStorage,
  partition: &str,
  max_entries: Option<usize>,
) -> Result<usize> {
  let Some(max_entries) = max_entries else {
    return Ok(0);
  };

  let victims = select_victims(storage.keys(partition)?, max_entries);
  let mut removed = 0;
  for key in victims {
    if storage.delete(partition, &key)? {
      debug!(partition, url = %key.url, "Evicted cache entry");
      removed += 1;
    }
  }

  Ok(removed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheEntry, MemoryStorage};
  use crate::http::Response;

  fn fill(storage: &MemoryStorage, urls: &[&str]) {
    for url in urls {
      let entry = CacheEntry::from_response(RequestKey::get(*url), &Response::new(200, "{}"));
      storage.put("p", &entry).unwrap();
    }
  }

  fn urls(storage: &MemoryStorage) -> Vec<String> {
    storage
      .keys("p")
      .unwrap()
      .into_iter()
      .map(|k| k.url)
      .collect()
  }

  #[test]
  fn test_priority_tiers() {
    assert_eq!(
      BusinessPriority::of("https://app.test/api/delivery-requests/7"),
      BusinessPriority::Transactional
    );
    assert_eq!(
      BusinessPriority::of("https://app.test/api/analytics/summary"),
      BusinessPriority::Analytics
    );
    assert_eq!(
      BusinessPriority::of("https://app.test/api/business/profile"),
      BusinessPriority::Standard
    );
    assert!(BusinessPriority::Transactional > BusinessPriority::Analytics);
    assert!(BusinessPriority::Analytics > BusinessPriority::Standard);
  }

  #[test]
  fn test_no_limit_is_noop() {
    let storage = MemoryStorage::new();
    fill(&storage, &["https://app.test/a", "https://app.test/b"]);
    assert_eq!(enforce(&storage, "p", None).unwrap(), 0);
    assert_eq!(enforce(&storage, "p", Some(5)).unwrap(), 0);
    assert_eq!(urls(&storage).len(), 2);
  }

  #[test]
  fn test_lowest_priority_goes_first() {
    let storage = MemoryStorage::new();
    fill(
      &storage,
      &[
        "https://app.test/api/orders/1",
        "https://app.test/api/profile",
        "https://app.test/api/analytics/daily",
        "https://app.test/api/settings",
      ],
    );

    assert_eq!(enforce(&storage, "p", Some(2)).unwrap(), 2);
    assert_eq!(
      urls(&storage),
      vec![
        "https://app.test/api/orders/1",
        "https://app.test/api/analytics/daily"
      ]
    );
  }

  #[test]
  fn test_oldest_goes_first_within_a_tier() {
    let storage = MemoryStorage::new();
    fill(
      &storage,
      &[
        "https://app.test/api/one",
        "https://app.test/api/two",
        "https://app.test/api/three",
      ],
    );

    enforce(&storage, "p", Some(2)).unwrap();
    assert_eq!(
      urls(&storage),
      vec!["https://app.test/api/two", "https://app.test/api/three"]
    );
  }

  #[test]
  fn test_highest_priority_survives_while_lower_remain() {
    let storage = MemoryStorage::new();
    fill(
      &storage,
      &[
        "https://app.test/api/payments/9",
        "https://app.test/api/a",
        "https://app.test/api/b",
      ],
    );

    enforce(&storage, "p", Some(1)).unwrap();
    assert_eq!(urls(&storage), vec!["https://app.test/api/payments/9"]);
  }

  #[test]
  fn test_enforce_is_idempotent() {
    let storage = MemoryStorage::new();
    fill(
      &storage,
      &[
        "https://app.test/api/a",
        "https://app.test/api/b",
        "https://app.test/api/c",
        "https://app.test/api/d",
      ],
    );

    enforce(&storage, "p", Some(3)).unwrap();
    let once = urls(&storage);
    assert_eq!(enforce(&storage, "p", Some(3)).unwrap(), 0);
    assert_eq!(urls(&storage), once);
    assert_eq!(once.len(), 3);
  }
}
