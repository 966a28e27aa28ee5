//! Rate limit rules configuration and lookup.
//!
//! Rules map a request type (e.g. `api`, `login`) to a fixed window and a
//! request quota. Request types without an explicit rule fall back to the
//! configured defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::KEY_SEPARATOR;
use crate::error::{RatewardenError, Result};

/// Default window length (15 minutes).
pub const DEFAULT_WINDOW_SECONDS: u64 = 900;
/// Default number of requests admitted per window.
pub const DEFAULT_MAX_REQUESTS: u64 = 100;
/// Default namespace for counter keys in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";
/// Longest window a rule may declare (one year).
pub const MAX_WINDOW_SECONDS: u64 = 365 * 24 * 60 * 60;

/// A rate limit rule: at most `max_requests` per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Length of the fixed window in seconds
    pub window_seconds: u64,
    /// Number of requests admitted per window
    pub max_requests: u64,
}

impl RateLimitRule {
    pub fn new(window_seconds: u64, max_requests: u64) -> Self {
        Self {
            window_seconds,
            max_requests,
        }
    }

    /// Get the window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.window_seconds == 0 {
            return Err(RatewardenError::Config(format!(
                "{}: window_seconds must be positive",
                name
            )));
        }
        if self.window_seconds > MAX_WINDOW_SECONDS {
            return Err(RatewardenError::Config(format!(
                "{}: window_seconds must be at most {}",
                name, MAX_WINDOW_SECONDS
            )));
        }
        if self.max_requests == 0 {
            return Err(RatewardenError::Config(format!(
                "{}: max_requests must be positive",
                name
            )));
        }
        Ok(())
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_WINDOW_SECONDS,
            max_requests: DEFAULT_MAX_REQUESTS,
        }
    }
}

/// How the admit decision is sequenced against the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStrategy {
    /// Read the counter, deny at the limit, otherwise increment.
    ///
    /// Two round trips. Concurrent callers racing between the read and the
    /// increment can overshoot `max_requests` by at most the number of
    /// racers.
    #[default]
    CheckThenIncrement,
    /// Increment first and compare the post-increment value; a rejected
    /// increment is undone with a decrement.
    ///
    /// Never admits more than `max_requests` per window. The raw counter can
    /// briefly sit above the limit while rejected callers undo their
    /// increment.
    IncrementThenCompare,
}

/// The complete set of rules consumed by a [`RateLimiter`](super::RateLimiter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Prefix namespacing counter keys from other store consumers
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Decision sequencing
    #[serde(default)]
    pub strategy: WindowStrategy,

    /// Rule applied to request types with no entry in `request_types`
    #[serde(default)]
    pub defaults: RateLimitRule,

    /// Map of request type to its rule
    #[serde(default)]
    pub request_types: HashMap<String, RateLimitRule>,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl Default for RateLimitRules {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            strategy: WindowStrategy::default(),
            defaults: RateLimitRule::default(),
            request_types: HashMap::new(),
        }
    }
}

impl RateLimitRules {
    /// Create rules with only the process-wide defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the rule for a request type.
    pub fn with_rule(mut self, request_type: impl Into<String>, rule: RateLimitRule) -> Self {
        self.request_types.insert(request_type.into(), rule);
        self
    }

    /// Replace the fallback rule.
    pub fn with_defaults(mut self, rule: RateLimitRule) -> Self {
        self.defaults = rule;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_strategy(mut self, strategy: WindowStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml).map_err(|e| {
            RatewardenError::Config(format!("Failed to parse rate limit rules: {}", e))
        })?;
        rules.validate()?;
        Ok(rules)
    }

    /// Reject empty or oversized windows, zero quotas, and request types
    /// whose counter keys could collide with another type's.
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate("defaults")?;
        for (request_type, rule) in &self.request_types {
            if request_type.contains(KEY_SEPARATOR) {
                return Err(RatewardenError::Config(format!(
                    "request type '{}' must not contain '{}'",
                    request_type, KEY_SEPARATOR
                )));
            }
            rule.validate(&format!("request type '{}'", request_type))?;
        }
        Ok(())
    }

    /// Resolve the rule for a request type, falling back to the defaults.
    ///
    /// An unknown request type is never an error.
    pub fn resolve(&self, request_type: &str) -> RateLimitRule {
        self.request_types
            .get(request_type)
            .copied()
            .unwrap_or(self.defaults)
    }

    /// Whether a request type has an explicit rule.
    pub fn is_configured(&self, request_type: &str) -> bool {
        self.request_types.contains_key(request_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let rules = RateLimitRules::default();
        assert_eq!(rules.key_prefix, "ratelimit:");
        assert_eq!(rules.strategy, WindowStrategy::CheckThenIncrement);
        assert_eq!(rules.defaults, RateLimitRule::new(900, 100));
        assert!(rules.request_types.is_empty());
    }

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
key_prefix: "rl:"
strategy: increment_then_compare
request_types:
  api:
    window_seconds: 900
    max_requests: 100
  login:
    window_seconds: 300
    max_requests: 5
  user_profile:
    window_seconds: 3600
    max_requests: 1000
"#;
        let rules = RateLimitRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.key_prefix, "rl:");
        assert_eq!(rules.strategy, WindowStrategy::IncrementThenCompare);
        assert_eq!(rules.request_types.len(), 3);
        assert_eq!(rules.resolve("login"), RateLimitRule::new(300, 5));
        assert_eq!(rules.resolve("user_profile").window(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_overrides_defaults() {
        let yaml = r#"
defaults:
  window_seconds: 60
  max_requests: 10
"#;
        let rules = RateLimitRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(rules.resolve("anything"), RateLimitRule::new(60, 10));
    }

    #[test]
    fn test_unknown_request_type_falls_back() {
        let rules = RateLimitRules::new().with_rule("api", RateLimitRule::new(60, 3));

        assert!(rules.is_configured("api"));
        assert!(!rules.is_configured("unregistered"));
        assert_eq!(rules.resolve("unregistered"), RateLimitRule::new(900, 100));
        assert_eq!(rules.resolve(""), RateLimitRule::new(900, 100));
    }

    #[test]
    fn test_zero_window_rejected() {
        let yaml = r#"
request_types:
  api:
    window_seconds: 0
    max_requests: 5
"#;
        let err = RateLimitRules::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, RatewardenError::Config(_)));
        assert!(err.to_string().contains("api"));
    }

    #[test]
    fn test_zero_quota_rejected() {
        let rules = RateLimitRules::new().with_defaults(RateLimitRule::new(60, 0));
        assert!(rules.validate().is_err());
    }

    #[test]
    fn test_oversized_window_rejected() {
        let rules = RateLimitRules::new().with_rule("api", RateLimitRule::new(u64::MAX, 5));
        let err = rules.validate().unwrap_err();
        assert!(matches!(err, RatewardenError::Config(_)));
        assert!(err.to_string().contains("window_seconds must be at most"));

        let rules = RateLimitRules::new().with_defaults(RateLimitRule::new(MAX_WINDOW_SECONDS + 1, 5));
        assert!(rules.validate().is_err());

        let rules = RateLimitRules::new().with_rule("yearly", RateLimitRule::new(MAX_WINDOW_SECONDS, 5));
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn test_request_type_with_separator_rejected() {
        let yaml = r#"
request_types:
  "a:b":
    window_seconds: 60
    max_requests: 5
"#;
        let err = RateLimitRules::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, RatewardenError::Config(_)));
        assert!(err.to_string().contains("'a:b'"));

        let rules = RateLimitRules::new().with_rule("user_profile", RateLimitRule::new(60, 5));
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn test_negative_values_fail_to_parse() {
        let yaml = r#"
request_types:
  api:
    window_seconds: -5
    max_requests: 5
"#;
        assert!(RateLimitRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_strategy_names() {
        let parsed: WindowStrategy = serde_yaml::from_str("check_then_increment").unwrap();
        assert_eq!(parsed, WindowStrategy::CheckThenIncrement);
        let parsed: WindowStrategy = serde_yaml::from_str("increment_then_compare").unwrap();
        assert_eq!(parsed, WindowStrategy::IncrementThenCompare);
    }
}
