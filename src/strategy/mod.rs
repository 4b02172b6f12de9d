//! Caching strategies and the routing table that selects them.

mod handlers;
mod matcher;

pub use handlers::{handle, stored_copy};
pub use matcher::StrategyMatcher;

use std::time::Duration;

use crate::config::Algorithm;

/// Strategy name recorded for requests no configured strategy matched.
pub const DEFAULT_STRATEGY: &str = "default";

/// A resolved decision for one request: algorithm, partition and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  /// Strategy name, also written into enriched cache copies
  pub name: String,
  pub algorithm: Algorithm,
  pub partition: String,
  pub max_entries: Option<usize>,
  pub max_age: Option<Duration>,
  pub timeout: Duration,
}
