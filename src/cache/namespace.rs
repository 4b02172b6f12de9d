//! Versioned partition names.
//!
//! Every partition belongs to one application and one version. The main
//! partition is `{app}-v{version}`; labelled partitions (one per strategy,
//! plus the reserved `offline` and `business-data` labels) are
//! `{app}-{label}-v{version}`.

use std::collections::BTreeSet;

/// Label of the partition holding pre-cached offline pages.
pub const OFFLINE_LABEL: &str = "offline";

/// Label of the partition holding the seeded business data document.
pub const BUSINESS_DATA_LABEL: &str = "business-data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
  app: String,
  version: String,
  /// Labels this application writes: strategy names plus the reserved ones
  labels: BTreeSet<String>,
}

impl CacheNamespace {
  pub fn new(app: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      app: app.into(),
      version: version.into(),
      labels: [OFFLINE_LABEL, BUSINESS_DATA_LABEL]
        .into_iter()
        .map(String::from)
        .collect(),
    }
  }

  /// Register the strategy names whose partitions belong to this application.
  pub fn with_labels<I, S>(mut self, labels: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.labels.extend(labels.into_iter().map(Into::into));
    self
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Unlabelled partition for static assets and unmatched requests.
  ///
  /// Versioned like every other partition, so a version bump retires it
  /// together with the strategy partitions.
  pub fn main(&self) -> String {
    format!("{}-v{}", self.app, self.version)
  }

  pub fn partition(&self, label: &str) -> String {
    format!("{}-{}-v{}", self.app, label, self.version)
  }

  pub fn offline(&self) -> String {
    self.partition(OFFLINE_LABEL)
  }

  pub fn business_data(&self) -> String {
    self.partition(BUSINESS_DATA_LABEL)
  }

  /// Version encoded in `name`, if the partition belongs to this application.
  ///
  /// Only the main partition and partitions with a known label count, so
  /// `courier-admin-v1` of a sibling application `courier-admin` is foreign.
  pub fn version_of<'a>(&self, name: &'a str) -> Option<&'a str> {
    let rest = name.strip_prefix(self.app.as_str())?.strip_prefix('-')?;

    let labelled = self.labels.iter().find_map(|label| {
      rest
        .strip_prefix(label.as_str())
        .and_then(|tail| tail.strip_prefix("-v"))
    });
    if labelled.is_some() {
      return labelled;
    }

    // `{app}-v{version}`, but not `{app}-vendors-v1` of another application
    rest.strip_prefix('v').filter(|version| !version.contains("-v"))
  }

  /// True for partitions of this application written by another version.
  pub fn is_stale(&self, name: &str) -> bool {
    matches!(self.version_of(name), Some(version) if version != self.version)
  }
}
