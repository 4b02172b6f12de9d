//! URL to strategy matching.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;

use crate::config::StrategyConfig;

/// Wildcard marker inside a url pattern.
const WILDCARD: char = '*';

#[derive(Debug)]
enum Pattern {
  /// Plain substring test
  Literal(String),
  /// Unanchored expression, `*` compiled to `.*`
  Wildcard(Regex),
}

impl Pattern {
  fn compile(raw: &str) -> Result<Self> {
    if !raw.contains(WILDCARD) {
      return Ok(Self::Literal(raw.to_string()));
    }

    let expr = raw
      .split(WILDCARD)
      .map(regex::escape)
      .collect::<Vec<_>>()
      .join(".*");
    let regex =
      Regex::new(&expr).map_err(|e| eyre!("Invalid url pattern '{}': {}", raw, e))?;

    Ok(Self::Wildcard(regex))
  }

  fn matches(&self, url: &str) -> bool {
    match self {
      Self::Literal(needle) => url.contains(needle.as_str()),
      Self::Wildcard(regex) => regex.is_match(url),
    }
  }
}

/// Ordered strategy table. The first strategy with any matching pattern wins.
#[derive(Debug)]
pub struct StrategyMatcher {
  strategies: Vec<(StrategyConfig, Vec<Pattern>)>,
}

impl StrategyMatcher {
  pub fn new(configs: &[StrategyConfig]) -> Result<Self> {
    let strategies = configs
      .iter()
      .map(|config| {
        let patterns = config
          .url_patterns
          .iter()
          .map(|raw| Pattern::compile(raw))
          .collect::<Result<Vec<_>>>()?;
        Ok((config.clone(), patterns))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self { strategies })
  }

  /// Strategy for `url`, or `None` when nothing matches.
  pub fn find(&self, url: &str) -> Option<&StrategyConfig> {
    self
      .strategies
      .iter()
      .find(|(_, patterns)| patterns.iter().any(|p| p.matches(url)))
      .map(|(config, _)| config)
  }
}
