//! Rate limit policy configuration and route matching.
//!
//! A policy names a strategy and its parameters. Routes bind a path prefix
//! to a policy and say how callers are identified, so each call site picks
//! its own strategy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::backend::Strategy;
use super::identifier::KeySource;
use crate::error::{Result, TurnstileError};

/// Time unit for window-based limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Parameters for the fixed- and sliding-window strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowPolicy {
    /// Requests allowed per window
    #[serde(alias = "requests_per_unit")]
    pub limit: u64,
    /// Window as a whole time unit
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    /// Window in milliseconds; takes precedence over `unit`
    #[serde(default)]
    pub window_ms: Option<u64>,
}

impl WindowPolicy {
    /// Resolve the window length in milliseconds.
    pub fn window_ms(&self) -> Result<u64> {
        match (self.window_ms, self.unit) {
            (Some(ms), _) => Ok(ms),
            (None, Some(unit)) => Ok(unit.duration().as_millis() as u64),
            (None, None) => Err(TurnstileError::Config(
                "window policy needs either `window_ms` or `unit`".to_string(),
            )),
        }
    }
}

/// Parameters for the token-bucket strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketPolicy {
    /// Bucket capacity
    pub max_tokens: u64,
    /// Refill rate
    pub tokens_per_second: f64,
}

/// A named rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PolicyConfig {
    FixedWindow(WindowPolicy),
    SlidingWindow(WindowPolicy),
    TokenBucket(BucketPolicy),
}

impl PolicyConfig {
    /// The strategy this policy selects.
    pub fn strategy(&self) -> Strategy {
        match self {
            PolicyConfig::FixedWindow(_) => Strategy::FixedWindow,
            PolicyConfig::SlidingWindow(_) => Strategy::SlidingWindow,
            PolicyConfig::TokenBucket(_) => Strategy::TokenBucket,
        }
    }

    /// Check the parameters describe a usable limiter.
    pub fn validate(&self, name: &str) -> Result<()> {
        let invalid = |msg: &str| Err(TurnstileError::Config(format!("policy `{}`: {}", name, msg)));

        match self {
            PolicyConfig::FixedWindow(w) | PolicyConfig::SlidingWindow(w) => {
                if w.limit == 0 {
                    return invalid("limit must be greater than zero");
                }
                if w.window_ms()? == 0 {
                    return invalid("window must be greater than zero");
                }
            }
            PolicyConfig::TokenBucket(b) => {
                if b.max_tokens == 0 {
                    return invalid("max_tokens must be greater than zero");
                }
                if !(b.tokens_per_second.is_finite() && b.tokens_per_second > 0.0) {
                    return invalid("tokens_per_second must be a positive number");
                }
            }
        }
        Ok(())
    }
}

/// Binds requests under a path prefix to a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix the rule applies to
    pub path_prefix: String,
    /// Name of the policy to apply
    pub policy: String,
    /// How callers are identified
    #[serde(default)]
    pub key: KeySource,
}

impl RouteRule {
    fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some(rest) => {
                rest.is_empty() || rest.starts_with('/') || self.path_prefix.ends_with('/')
            }
            None => false,
        }
    }
}

/// The complete set of policies and routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Policies by name
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyConfig>,
    /// Route bindings; the longest matching prefix wins
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

impl Default for RateLimitRules {
    fn default() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(
            "api".to_string(),
            PolicyConfig::SlidingWindow(WindowPolicy {
                limit: 100,
                unit: Some(TimeUnit::Minute),
                window_ms: None,
            }),
        );
        policies.insert(
            "auth".to_string(),
            PolicyConfig::FixedWindow(WindowPolicy {
                limit: 5,
                unit: None,
                window_ms: Some(15 * 60 * 1000),
            }),
        );
        policies.insert(
            "upload".to_string(),
            PolicyConfig::TokenBucket(BucketPolicy {
                max_tokens: 10,
                tokens_per_second: 0.5,
            }),
        );

        Self {
            policies,
            routes: vec![
                RouteRule {
                    path_prefix: "/api".to_string(),
                    policy: "api".to_string(),
                    key: KeySource::Ip,
                },
                RouteRule {
                    path_prefix: "/api/auth".to_string(),
                    policy: "auth".to_string(),
                    key: KeySource::Ip,
                },
                RouteRule {
                    path_prefix: "/api/upload".to_string(),
                    policy: "upload".to_string(),
                    key: KeySource::Header("authorization".to_string()),
                },
            ],
        }
    }
}

impl RateLimitRules {
    /// Create an empty rule set.
    pub fn empty() -> Self {
        Self {
            policies: BTreeMap::new(),
            routes: Vec::new(),
        }
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
        let rules: RateLimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check every policy and that every route names a known policy.
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in &self.policies {
            policy.validate(name)?;
        }
        for route in &self.routes {
            if !self.policies.contains_key(&route.policy) {
                return Err(TurnstileError::Config(format!(
                    "route `{}` refers to unknown policy `{}`",
                    route.path_prefix, route.policy
                )));
            }
        }
        Ok(())
    }

    /// Find the route rule for a request path.
    ///
    /// A prefix matches whole path segments only, and the most specific
    /// (longest) prefix wins.
    pub fn find_route(&self, path: &str) -> Option<&RouteRule> {
        self.routes
            .iter()
            .filter(|r| r.matches(path))
            .max_by_key(|r| r.path_prefix.len())
    }
}
