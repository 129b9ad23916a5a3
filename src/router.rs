//! Path-based selection of a caching strategy.
//!
//! The table is an ordered list of rules; the first rule with a pattern matching
//! the request path decides the strategy. Paths matching nothing use the default.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Deserialize;

/// The caching algorithms a request can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Serve from cache, fill from network on miss
  CacheFirst,
  /// Prefer the network, fall back to cache when offline
  NetworkFirst,
  /// Serve cached copy immediately, refresh it in the background
  StaleWhileRevalidate,
}

impl std::fmt::Display for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Strategy::CacheFirst => write!(f, "cache-first"),
      Strategy::NetworkFirst => write!(f, "network-first"),
      Strategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
    }
  }
}

/// A rule as written in configuration: a strategy and the path patterns selecting it.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
  pub strategy: Strategy,
  pub patterns: Vec<String>,
}

impl RouteRule {
  fn new(strategy: Strategy, patterns: &[&str]) -> Self {
    Self {
      strategy,
      patterns: patterns.iter().map(|p| p.to_string()).collect(),
    }
  }
}

/// Built-in routing rules for a static site.
///
/// Images are matched before the `/assets/` catch-all so that images under
/// `/assets/` still revalidate in the background.
pub fn default_rules() -> Vec<RouteRule> {
  vec![
    RouteRule::new(Strategy::CacheFirst, &[r"\.(?:css|js|woff2?|ttf|eot)$"]),
    RouteRule::new(Strategy::NetworkFirst, &[r"/api/", r"/blog/"]),
    RouteRule::new(
      Strategy::StaleWhileRevalidate,
      &[r"\.(?:png|jpg|jpeg|gif|svg|webp|ico)$"],
    ),
    RouteRule::new(Strategy::CacheFirst, &[r"/assets/"]),
  ]
}

/// Compiled, immutable routing table.
#[derive(Debug, Clone)]
pub struct StrategyTable {
  rules: Vec<(Strategy, Vec<Regex>)>,
  default: Strategy,
}

impl StrategyTable {
  /// Compile rules; an invalid pattern is a configuration error.
  pub fn compile(rules: &[RouteRule], default: Strategy) -> Result<Self> {
    let rules = rules
      .iter()
      .map(|rule| {
        let patterns = rule
          .patterns
          .iter()
          .map(|p| {
            Regex::new(p).map_err(|e| eyre!("Invalid {} pattern '{}': {}", rule.strategy, p, e))
          })
          .collect::<Result<Vec<_>>>()?;
        Ok((rule.strategy, patterns))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self { rules, default })
  }

  /// First matching rule wins; otherwise the default strategy.
  pub fn select(&self, path: &str) -> Strategy {
    self
      .matching(path)
      .unwrap_or(self.default)
  }

  /// The strategy of the first matching rule, if any.
  pub fn matching(&self, path: &str) -> Option<Strategy> {
    self
      .rules
      .iter()
      .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(path)))
      .map(|(strategy, _)| *strategy)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table() -> StrategyTable {
    StrategyTable::compile(&default_rules(), Strategy::NetworkFirst).unwrap()
  }

  #[test]
  fn test_static_assets_are_cache_first() {
    let table = table();
    assert_eq!(table.select("/assets/css/main.bundle.css"), Strategy::CacheFirst);
    assert_eq!(table.select("/assets/js/main.bundle.js"), Strategy::CacheFirst);
    assert_eq!(table.select("/fonts/inter.woff2"), Strategy::CacheFirst);
    assert_eq!(table.select("/assets/data/search.json"), Strategy::CacheFirst);
  }

  #[test]
  fn test_dynamic_content_is_network_first() {
    let table = table();
    assert_eq!(table.select("/api/newsletter"), Strategy::NetworkFirst);
    assert_eq!(table.select("/blog/2024/hello"), Strategy::NetworkFirst);
  }

  #[test]
  fn test_images_revalidate() {
    let table = table();
    assert_eq!(table.select("/assets/img/logo.png"), Strategy::StaleWhileRevalidate);
    assert_eq!(table.select("/favicon.ico"), Strategy::StaleWhileRevalidate);
  }

  #[test]
  fn test_unmatched_uses_default() {
    let table = table();
    assert_eq!(table.matching("/some/page"), None);
    assert_eq!(table.select("/some/page"), Strategy::NetworkFirst);
    assert_eq!(table.select("/"), Strategy::NetworkFirst);
  }

  #[test]
  fn test_first_match_wins() {
    // Script under /blog/ matches both cache-first and network-first rules
    let table = table();
    assert_eq!(table.select("/blog/widget.js"), Strategy::CacheFirst);

    let reversed: Vec<RouteRule> = default_rules().into_iter().rev().collect();
    let table = StrategyTable::compile(&reversed, Strategy::CacheFirst).unwrap();
    assert_eq!(table.select("/blog/widget.js"), Strategy::NetworkFirst);
    assert_eq!(table.select("/nowhere"), Strategy::CacheFirst);
  }

  #[test]
  fn test_invalid_pattern_is_rejected() {
    let rules = vec![RouteRule::new(Strategy::CacheFirst, &["(unclosed"])];
    let err = StrategyTable::compile(&rules, Strategy::NetworkFirst).unwrap_err();
    assert!(err.to_string().contains("(unclosed"));
  }

  #[test]
  fn test_strategy_names() {
    let parsed: Strategy = serde_yaml::from_str("stale-while-revalidate").unwrap();
    assert_eq!(parsed, Strategy::StaleWhileRevalidate);
    assert_eq!(Strategy::CacheFirst.to_string(), "cache-first");
  }
}
