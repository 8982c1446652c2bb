//! Fixed-window counter implementation.

use std::sync::Arc;

use tracing::{debug, trace};

use super::backend::{RateLimiterBackend, Strategy};
use super::status::RateLimitStatus;
use super::store::MemoryStore;
use crate::clock::Clock;
use crate::error::{Result, TurnstileError};

/// Counter state for one identifier's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    /// Units consumed in the current window
    pub count: u64,
    /// Epoch milliseconds at which the window ends
    pub reset_at_ms: u64,
    /// Limit the counter was last checked against
    pub limit: u64,
}

impl WindowCounter {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_at_ms
    }
}

/// A per-identifier counter that resets when its window expires.
///
/// Windows start lazily: the first check after expiry opens a new window of
/// `window_ms` starting at that check.
pub struct FixedWindowLimiter {
    window_ms: u64,
    limit: u64,
    clock: Arc<dyn Clock>,
    store: MemoryStore<WindowCounter>,
}

impl FixedWindowLimiter {
    /// Create a limiter with its own empty store.
    pub fn new(window_ms: u64, limit: u64, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(window_ms, limit, clock, MemoryStore::new())
    }

    /// Create a limiter over an existing store.
    pub fn with_store(
        window_ms: u64,
        limit: u64,
        clock: Arc<dyn Clock>,
        store: MemoryStore<WindowCounter>,
    ) -> Self {
        Self {
            window_ms,
            limit,
            clock,
            store,
        }
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Configured limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{}", identifier, self.window_ms)
    }

    /// Count one request for `identifier` against `limit`.
    pub fn check_with_limit(&self, identifier: &str, limit: u64) -> Result<RateLimitStatus> {
        self.consume(identifier, limit, 1)
    }

    fn consume(&self, identifier: &str, limit: u64, cost: u64) -> Result<RateLimitStatus> {
        if cost > limit {
            return Err(TurnstileError::InvalidCost {
                cost,
                capacity: limit,
            });
        }

        let now = self.clock.now_ms();
        let window_ms = self.window_ms;
        let key = self.key(identifier);

        trace!(key = %key, cost = cost, limit = limit, "Checking fixed window");

        let new_window = || WindowCounter {
            count: 0,
            reset_at_ms: now + window_ms,
            limit,
        };

        let outcome = self.store.update(&key, new_window, |counter| {
            if counter.is_expired(now) {
                *counter = new_window();
            }
            counter.limit = limit;

            if counter.count.saturating_add(cost) > limit {
                return Err(counter.reset_at_ms);
            }

            counter.count += cost;
            Ok(RateLimitStatus {
                limit,
                remaining: limit - counter.count,
                reset_at_ms: counter.reset_at_ms,
            })
        });

        outcome.map_err(|reset_at_ms| {
            debug!(key = %key, limit = limit, reset_at_ms = reset_at_ms, "Rate limit exceeded");
            TurnstileError::RateLimitExceeded {
                identifier: identifier.to_string(),
                limit,
                reset_at_ms,
                retry_after_ms: reset_at_ms.saturating_sub(now),
            }
        })
    }

    /// Get the raw counter for `identifier`, if one exists.
    pub fn counter(&self, identifier: &str) -> Option<WindowCounter> {
        self.store.read(&self.key(identifier), |c| c.copied())
    }
}

impl RateLimiterBackend for FixedWindowLimiter {
    fn strategy(&self) -> Strategy {
        Strategy::FixedWindow
    }

    fn check(&self, identifier: &str, cost: u64) -> Result<RateLimitStatus> {
        self.consume(identifier, self.limit, cost)
    }

    fn status(&self, identifier: &str) -> RateLimitStatus {
        let now = self.clock.now_ms();
        self.store.read(&self.key(identifier), |counter| match counter {
            Some(c) if !c.is_expired(now) => RateLimitStatus {
                limit: c.limit,
                remaining: c.limit.saturating_sub(c.count),
                reset_at_ms: c.reset_at_ms,
            },
            _ => RateLimitStatus {
                limit: self.limit,
                remaining: self.limit,
                reset_at_ms: now + self.window_ms,
            },
        })
    }

    fn reset(&self, identifier: &str) {
        self.store.remove(&self.key(identifier));
    }

    fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        self.store.retain(|_, counter| !counter.is_expired(now))
    }

    fn tracked(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(window_ms: u64, limit: u64) -> (Arc<ManualClock>, FixedWindowLimiter) {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = FixedWindowLimiter::new(window_ms, limit, clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let (_clock, limiter) = limiter(1000, 5);

        for i in 0..5 {
            let status = limiter.check("client", 1).unwrap();
            assert_eq!(status.remaining, 4 - i);
        }

        let err = limiter.check("client", 1).unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_sixty_second_window_scenario() {
        let (clock, limiter) = limiter(60_000, 3);

        for t in 0..3 {
            clock.set(t);
            assert!(limiter.check_with_limit("10.0.0.1", 3).is_ok(), "t={t}");
        }

        clock.set(3);
        match limiter.check_with_limit("10.0.0.1", 3) {
            Err(TurnstileError::RateLimitExceeded {
                reset_at_ms,
                retry_after_ms,
                limit,
                ..
            }) => {
                assert_eq!(reset_at_ms, 60_000);
                assert_eq!(retry_after_ms, 59_997);
                assert_eq!(limit, 3);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        clock.set(60_001);
        let status = limiter.check_with_limit("10.0.0.1", 3).unwrap();
        assert_eq!(status.remaining, 2);
        assert_eq!(status.reset_at_ms, 120_001);
    }

    #[test]
    fn test_rejection_does_not_increment() {
        let (_clock, limiter) = limiter(1000, 2);
        limiter.check("client", 1).unwrap();
        limiter.check("client", 1).unwrap();

        for _ in 0..10 {
            assert!(limiter.check("client", 1).is_err());
        }
        assert_eq!(limiter.counter("client").unwrap().count, 2);
    }

    #[test]
    fn test_new_window_starts_from_zero() {
        let (clock, limiter) = limiter(1000, 2);
        limiter.check("client", 1).unwrap();
        limiter.check("client", 1).unwrap();

        clock.advance(1000);
        let status = limiter.check("client", 1).unwrap();
        assert_eq!(status.remaining, 1);
        assert_eq!(limiter.counter("client").unwrap().count, 1);
    }

    #[test]
    fn test_multi_unit_cost() {
        let (_clock, limiter) = limiter(1000, 10);
        assert_eq!(limiter.check("client", 8).unwrap().remaining, 2);
        assert!(limiter.check("client", 3).is_err());
        assert_eq!(limiter.check("client", 2).unwrap().remaining, 0);
    }

    #[test]
    fn test_cost_above_limit_is_invalid() {
        let (_clock, limiter) = limiter(1000, 10);
        let err = limiter.check("client", 11).unwrap_err();
        assert!(matches!(
            err,
            TurnstileError::InvalidCost {
                cost: 11,
                capacity: 10
            }
        ));
        assert_eq!(limiter.tracked(), 0);
        assert_eq!(limiter.check("client", 10).unwrap().remaining, 0);
    }

    #[test]
    fn test_status_is_read_only() {
        let (clock, limiter) = limiter(1000, 3);
        clock.set(10);
        limiter.check("client", 1).unwrap();

        let first = limiter.status("client");
        for _ in 0..10 {
            assert_eq!(limiter.status("client"), first);
        }
        assert_eq!(first.remaining, 2);
        assert_eq!(first.reset_at_ms, 1010);

        assert_eq!(limiter.check("client", 1).unwrap().remaining, 1);
    }

    #[test]
    fn test_status_for_unknown_identifier() {
        let (clock, limiter) = limiter(1000, 3);
        clock.set(500);

        let status = limiter.status("nobody");
        assert_eq!(status.remaining, 3);
        assert_eq!(status.reset_at_ms, 1500);
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let (_clock, limiter) = limiter(1000, 1);
        assert!(limiter.check("a", 1).is_ok());
        assert!(limiter.check("b", 1).is_ok());
        assert!(limiter.check("a", 1).is_err());
    }

    #[test]
    fn test_cleanup_removes_expired_windows() {
        let (clock, limiter) = limiter(1000, 3);
        limiter.check("old", 1).unwrap();
        clock.set(600);
        limiter.check("new", 1).unwrap();

        clock.set(1000);
        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked(), 1);
        assert!(limiter.counter("new").is_some());
    }

    #[test]
    fn test_reset_forgets_identifier() {
        let (_clock, limiter) = limiter(1000, 1);
        limiter.check("client", 1).unwrap();
        limiter.reset("client");
        assert!(limiter.check("client", 1).is_ok());
    }
}
