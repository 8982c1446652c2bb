//! Named limiters and the registry that owns them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use super::backend::{RateLimiterBackend, Strategy};
use super::fixed_window::FixedWindowLimiter;
use super::identifier::{KeySource, TrustedProxies};
use super::rules::{PolicyConfig, RateLimitRules, RouteRule};
use super::sliding_window::SlidingWindowLimiter;
use super::status::RateLimitStatus;
use super::token_bucket::TokenBucketLimiter;
use crate::clock::Clock;
use crate::error::Result;

/// A rate limit policy bound to its backend.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    name: String,
    backend: Box<dyn RateLimiterBackend>,
}

impl RateLimiter {
    /// Wrap an existing backend under `name`.
    pub fn new(name: impl Into<String>, backend: Box<dyn RateLimiterBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    /// Build the backend a policy describes.
    pub fn from_policy(name: &str, policy: &PolicyConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        policy.validate(name)?;

        let backend: Box<dyn RateLimiterBackend> = match policy {
            PolicyConfig::FixedWindow(w) => {
                Box::new(FixedWindowLimiter::new(w.window_ms()?, w.limit, clock))
            }
            PolicyConfig::SlidingWindow(w) => {
                Box::new(SlidingWindowLimiter::new(w.window_ms()?, w.limit, clock))
            }
            PolicyConfig::TokenBucket(b) => Box::new(TokenBucketLimiter::new(
                b.max_tokens,
                b.tokens_per_second,
                clock,
            )),
        };

        debug!(policy = %name, strategy = %backend.strategy(), "Created rate limiter");
        Ok(Self::new(name, backend))
    }

    /// Policy name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The strategy in use.
    pub fn strategy(&self) -> Strategy {
        self.backend.strategy()
    }

    /// Count one request for `identifier`.
    pub fn check(&self, identifier: &str) -> Result<RateLimitStatus> {
        self.check_cost(identifier, 1)
    }

    /// Count `cost` units for `identifier`.
    pub fn check_cost(&self, identifier: &str, cost: u64) -> Result<RateLimitStatus> {
        trace!(policy = %self.name, identifier = %identifier, cost = cost, "Checking rate limit");
        self.backend.check(identifier, cost)
    }

    /// Current quota for `identifier`, without consuming any.
    pub fn status(&self, identifier: &str) -> RateLimitStatus {
        self.backend.status(identifier)
    }

    /// Forget `identifier`.
    pub fn reset(&self, identifier: &str) {
        self.backend.reset(identifier);
    }

    /// Drop stale state. Returns entries removed.
    pub fn cleanup(&self) -> usize {
        self.backend.cleanup()
    }

    /// Number of identifiers tracked.
    pub fn tracked(&self) -> usize {
        self.backend.tracked()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("strategy", &self.strategy())
            .finish()
    }
}

/// Owns every named limiter and the routes that select them.
pub struct RateLimiterRegistry {
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    rules: RwLock<RateLimitRules>,
    clock: Arc<dyn Clock>,
    proxies: TrustedProxies,
}

impl RateLimiterRegistry {
    /// Build a limiter for every policy in `rules`.
    pub fn from_rules(rules: RateLimitRules, clock: Arc<dyn Clock>) -> Result<Self> {
        let limiters = Self::build(&rules, &clock)?;
        info!(
            policies = limiters.len(),
            routes = rules.routes.len(),
            "Rate limiter registry initialized"
        );

        Ok(Self {
            limiters: RwLock::new(limiters),
            rules: RwLock::new(rules),
            clock,
            proxies: TrustedProxies::none(),
        })
    }

    /// Believe forwarding headers from these proxies when identifying callers.
    pub fn with_trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = proxies;
        self
    }

    /// Proxies whose forwarding headers are believed.
    pub fn trusted_proxies(&self) -> &TrustedProxies {
        &self.proxies
    }

    fn build(
        rules: &RateLimitRules,
        clock: &Arc<dyn Clock>,
    ) -> Result<HashMap<String, Arc<RateLimiter>>> {
        rules.validate()?;
        rules
            .policies
            .iter()
            .map(|(name, policy)| {
                let limiter = RateLimiter::from_policy(name, policy, clock.clone())?;
                Ok((name.clone(), Arc::new(limiter)))
            })
            .collect()
    }

    /// Swap in a new rule set.
    ///
    /// Limiters whose policy is unchanged keep their state; changed or new
    /// policies start empty.
    pub fn replace_rules(&self, rules: RateLimitRules) -> Result<()> {
        let mut fresh = Self::build(&rules, &self.clock)?;

        let mut limiters = self.limiters.write();
        let mut current = self.rules.write();
        for (name, limiter) in fresh.iter_mut() {
            if current.policies.get(name) == rules.policies.get(name) {
                if let Some(existing) = limiters.get(name) {
                    *limiter = existing.clone();
                }
            }
        }

        info!(policies = fresh.len(), routes = rules.routes.len(), "Rate limit rules replaced");
        *limiters = fresh;
        *current = rules;
        Ok(())
    }

    /// Register or replace a limiter under its own name.
    pub fn insert(&self, limiter: RateLimiter) -> Arc<RateLimiter> {
        let limiter = Arc::new(limiter);
        self.limiters
            .write()
            .insert(limiter.name().to_string(), limiter.clone());
        limiter
    }

    /// Look up a limiter by policy name.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.read().get(name).cloned()
    }

    /// Names of all registered policies, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve the limiter and key source that guard `path`.
    pub fn resolve(&self, path: &str) -> Option<(Arc<RateLimiter>, KeySource)> {
        let RouteRule { policy, key, .. } = self.rules.read().find_route(path)?.clone();
        let limiter = self.get(&policy)?;
        Some((limiter, key))
    }

    /// The clock every limiter reads.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run cleanup on every limiter. Returns total entries removed.
    pub fn cleanup_all(&self) -> usize {
        let limiters: Vec<Arc<RateLimiter>> = self.limiters.read().values().cloned().collect();
        limiters.iter().map(|l| l.cleanup()).sum()
    }

    /// Total identifiers tracked across all limiters.
    pub fn tracked(&self) -> usize {
        self.limiters.read().values().map(|l| l.tracked()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TurnstileError;
    use crate::ratelimit::rules::WindowPolicy;

    fn registry() -> (Arc<ManualClock>, RateLimiterRegistry) {
        let clock = Arc::new(ManualClock::new(0));
        let registry =
            RateLimiterRegistry::from_rules(RateLimitRules::default(), clock.clone()).unwrap();
        (clock, registry)
    }

    #[test]
    fn test_registry_builds_every_policy() {
        let (_clock, registry) = registry();
        assert_eq!(registry.names(), vec!["api", "auth", "upload"]);
        assert_eq!(registry.get("api").unwrap().strategy(), Strategy::SlidingWindow);
        assert_eq!(registry.get("auth").unwrap().strategy(), Strategy::FixedWindow);
        assert_eq!(registry.get("upload").unwrap().strategy(), Strategy::TokenBucket);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_resolve_uses_route_rules() {
        let (_clock, registry) = registry();

        let (limiter, key) = registry.resolve("/api/auth/login").unwrap();
        assert_eq!(limiter.name(), "auth");
        assert_eq!(key, KeySource::Ip);

        let (limiter, key) = registry.resolve("/api/upload/file").unwrap();
        assert_eq!(limiter.name(), "upload");
        assert_eq!(key, KeySource::Header("authorization".to_string()));

        assert!(registry.resolve("/health").is_none());
    }

    #[test]
    fn test_auth_policy_rejects_sixth_attempt() {
        let (_clock, registry) = registry();
        let auth = registry.get("auth").unwrap();

        for _ in 0..5 {
            auth.check("ip:10.0.0.1").unwrap();
        }
        let err = auth.check("ip:10.0.0.1").unwrap_err();
        assert!(matches!(err, TurnstileError::RateLimitExceeded { limit: 5, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let (_clock, registry) = registry();
        let registry = Arc::new(registry);

        let tasks = (0..50).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get("auth").unwrap().check("ip:10.0.0.9").is_ok() })
        });
        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|joined| *joined.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_cleanup_all_sweeps_every_limiter() {
        let (clock, registry) = registry();
        registry.get("api").unwrap().check("a").unwrap();
        registry.get("auth").unwrap().check("a").unwrap();
        registry.get("upload").unwrap().check("a").unwrap();
        assert_eq!(registry.tracked(), 3);

        // Longer than the 15 minute auth window and the 2s upload refill.
        clock.advance(16 * 60 * 1000);
        assert_eq!(registry.cleanup_all(), 3);
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn test_replace_rules_keeps_unchanged_state() {
        let (_clock, registry) = registry();
        registry.get("api").unwrap().check("a").unwrap();
        registry.get("auth").unwrap().check("a").unwrap();

        let mut rules = RateLimitRules::default();
        rules.policies.insert(
            "auth".to_string(),
            PolicyConfig::FixedWindow(WindowPolicy {
                limit: 10,
                unit: None,
                window_ms: Some(60_000),
            }),
        );
        registry.replace_rules(rules).unwrap();

        assert_eq!(registry.get("api").unwrap().tracked(), 1);
        assert_eq!(registry.get("auth").unwrap().tracked(), 0);
        assert_eq!(registry.get("auth").unwrap().status("a").limit, 10);
    }

    #[test]
    fn test_replace_rules_rejects_invalid() {
        let (_clock, registry) = registry();
        let mut rules = RateLimitRules::default();
        rules.routes[0].policy = "nope".to_string();

        assert!(registry.replace_rules(rules).is_err());
        assert_eq!(registry.names().len(), 3);
    }

    #[test]
    fn test_insert_custom_limiter() {
        let (clock, registry) = registry();
        let limiter = RateLimiter::new(
            "burst",
            Box::new(TokenBucketLimiter::new(2, 1.0, clock.clone())),
        );
        registry.insert(limiter);

        let burst = registry.get("burst").unwrap();
        assert!(burst.check("x").is_ok());
        assert!(burst.check("x").is_ok());
        assert!(burst.check("x").is_err());
    }
}
