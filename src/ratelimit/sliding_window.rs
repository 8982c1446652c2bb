//! Sliding-window log implementation.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};

use super::backend::{RateLimiterBackend, Strategy};
use super::status::RateLimitStatus;
use super::store::MemoryStore;
use crate::clock::Clock;
use crate::error::{Result, TurnstileError};

/// Admission timestamps for one identifier, oldest first.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    timestamps: VecDeque<u64>,
    limit: u64,
}

impl RequestLog {
    fn evict(&mut self, now_ms: u64, window_ms: u64) {
        while self
            .timestamps
            .front()
            .is_some_and(|&t| t + window_ms <= now_ms)
        {
            self.timestamps.pop_front();
        }
    }

    fn in_window(&self, now_ms: u64, window_ms: u64) -> impl Iterator<Item = &u64> {
        self.timestamps
            .iter()
            .filter(move |&&t| t + window_ms > now_ms)
    }

    /// Number of timestamps stored, including any not yet evicted.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the log holds no timestamps.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Counts admissions over the trailing `window_ms` milliseconds.
///
/// Unlike a fixed window, a burst at the end of one period and another at
/// the start of the next are counted together.
pub struct SlidingWindowLimiter {
    window_ms: u64,
    limit: u64,
    clock: Arc<dyn Clock>,
    store: MemoryStore<RequestLog>,
}

impl SlidingWindowLimiter {
    /// Create a limiter with its own empty store.
    pub fn new(window_ms: u64, limit: u64, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(window_ms, limit, clock, MemoryStore::new())
    }

    /// Create a limiter over an existing store.
    pub fn with_store(
        window_ms: u64,
        limit: u64,
        clock: Arc<dyn Clock>,
        store: MemoryStore<RequestLog>,
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

        trace!(identifier = %identifier, cost = cost, limit = limit, "Checking sliding window");

        let outcome = self.store.update(identifier, RequestLog::default, |log| {
            log.evict(now, window_ms);
            log.limit = limit;

            let used = log.len() as u64;
            if used.saturating_add(cost) > limit {
                // A slot frees once the oldest entry leaves the window.
                let reset_at_ms = log
                    .timestamps
                    .front()
                    .map_or(now + window_ms, |&oldest| oldest + window_ms);
                return Err(reset_at_ms);
            }

            log.timestamps.extend(std::iter::repeat(now).take(cost as usize));
            let reset_at_ms = log
                .timestamps
                .front()
                .map_or(now + window_ms, |&oldest| oldest + window_ms);
            Ok(RateLimitStatus {
                limit,
                remaining: limit - log.len() as u64,
                reset_at_ms,
            })
        });

        outcome.map_err(|reset_at_ms| {
            debug!(identifier = %identifier, limit = limit, reset_at_ms = reset_at_ms, "Rate limit exceeded");
            TurnstileError::RateLimitExceeded {
                identifier: identifier.to_string(),
                limit,
                reset_at_ms,
                retry_after_ms: reset_at_ms.saturating_sub(now),
            }
        })
    }

    /// Timestamps inside the window for `identifier`, oldest first.
    pub fn timestamps(&self, identifier: &str) -> Vec<u64> {
        let now = self.clock.now_ms();
        self.store.read(identifier, |log| {
            log.map(|l| l.in_window(now, self.window_ms).copied().collect())
                .unwrap_or_default()
        })
    }
}

impl RateLimiterBackend for SlidingWindowLimiter {
    fn strategy(&self) -> Strategy {
        Strategy::SlidingWindow
    }

    fn check(&self, identifier: &str, cost: u64) -> Result<RateLimitStatus> {
        self.consume(identifier, self.limit, cost)
    }

    fn status(&self, identifier: &str) -> RateLimitStatus {
        let now = self.clock.now_ms();

        self.store.read(identifier, |log| {
            let limit = log.map_or(self.limit, |l| l.limit);
            let mut live = log
                .into_iter()
                .flat_map(|l| l.in_window(now, self.window_ms))
                .peekable();
            let reset_at_ms = live
                .peek()
                .map_or(now + self.window_ms, |&&oldest| oldest + self.window_ms);
            let used = live.count() as u64;

            RateLimitStatus {
                limit,
                remaining: limit.saturating_sub(used),
                reset_at_ms,
            }
        })
    }

    fn reset(&self, identifier: &str) {
        self.store.remove(identifier);
    }

    fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let window_ms = self.window_ms;
        self.store.retain(|_, log| {
            log.timestamps
                .back()
                .is_some_and(|&newest| newest + window_ms > now)
        })
    }

    fn tracked(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::fixed_window::FixedWindowLimiter;

    fn limiter(window_ms: u64, limit: u64) -> (Arc<ManualClock>, SlidingWindowLimiter) {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = SlidingWindowLimiter::new(window_ms, limit, clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let (clock, limiter) = limiter(60_000, 3);

        for t in 0..3 {
            clock.set(t);
            assert!(limiter.check("client", 1).is_ok());
        }

        clock.set(3);
        match limiter.check("client", 1) {
            Err(TurnstileError::RateLimitExceeded { reset_at_ms, .. }) => {
                // The t=0 entry leaves the window at 60000.
                assert_eq!(reset_at_ms, 60_000);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_entries_leave_window_one_by_one() {
        let (clock, limiter) = limiter(1000, 2);
        clock.set(0);
        limiter.check("client", 1).unwrap();
        clock.set(500);
        limiter.check("client", 1).unwrap();

        clock.set(999);
        assert!(limiter.check("client", 1).is_err());

        clock.set(1000);
        let status = limiter.check("client", 1).unwrap();
        assert_eq!(status.remaining, 0);
        assert_eq!(limiter.timestamps("client"), vec![500, 1000]);
    }

    #[test]
    fn test_boundary_straddling_burst_is_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let sliding = SlidingWindowLimiter::new(1000, 4, clock.clone());
        let fixed = FixedWindowLimiter::new(1000, 4, clock.clone());

        // Open both windows at t=0 with one request, then burst at the end.
        assert!(sliding.check("client", 1).is_ok());
        assert!(fixed.check("client", 1).is_ok());
        clock.set(990);
        assert!(sliding.check("client", 3).is_ok());
        assert!(fixed.check("client", 3).is_ok());

        // Just across the fixed boundary, still inside the trailing window.
        clock.set(1010);
        assert!(fixed.check("client", 3).is_ok());
        assert!(sliding.check("client", 3).is_err());
    }

    #[test]
    fn test_cost_above_limit_is_invalid() {
        let (_clock, limiter) = limiter(1000, 5);
        let err = limiter.check("client", 1_000_000).unwrap_err();
        assert!(matches!(
            err,
            TurnstileError::InvalidCost {
                cost: 1_000_000,
                capacity: 5
            }
        ));
        assert!(limiter.timestamps("client").is_empty());
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn test_rejection_records_nothing() {
        let (_clock, limiter) = limiter(1000, 1);
        limiter.check("client", 1).unwrap();
        for _ in 0..5 {
            assert!(limiter.check("client", 1).is_err());
        }
        assert_eq!(limiter.timestamps("client").len(), 1);
    }

    #[test]
    fn test_status_is_read_only_and_counts_window() {
        let (clock, limiter) = limiter(1000, 3);
        clock.set(100);
        limiter.check("client", 1).unwrap();
        clock.set(600);
        limiter.check("client", 1).unwrap();

        clock.set(1200);
        let first = limiter.status("client");
        for _ in 0..5 {
            assert_eq!(limiter.status("client"), first);
        }
        assert_eq!(first.remaining, 2);
        assert_eq!(first.reset_at_ms, 1600);

        // The stale t=100 entry was not evicted by status.
        limiter.store.read("client", |log| assert_eq!(log.unwrap().len(), 2));
        assert_eq!(limiter.check("client", 1).unwrap().remaining, 1);
    }

    #[test]
    fn test_status_for_unknown_identifier() {
        let (clock, limiter) = limiter(1000, 3);
        clock.set(42);
        let status = limiter.status("nobody");
        assert_eq!(status.remaining, 3);
        assert_eq!(status.reset_at_ms, 1042);
    }

    #[test]
    fn test_cleanup_removes_idle_logs() {
        let (clock, limiter) = limiter(1000, 3);
        limiter.check("idle", 1).unwrap();
        clock.set(800);
        limiter.check("busy", 1).unwrap();

        clock.set(1000);
        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.timestamps("busy"), vec![800]);
    }
}
