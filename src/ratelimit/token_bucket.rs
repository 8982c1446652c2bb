//! Token bucket implementation.

use std::sync::Arc;

use tracing::{debug, trace};

use super::backend::{RateLimiterBackend, Strategy};
use super::status::RateLimitStatus;
use super::store::MemoryStore;
use crate::clock::Clock;
use crate::error::{Result, TurnstileError};

/// Token state for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Whole tokens available
    pub tokens: u64,
    /// Epoch milliseconds up to which refill has been credited
    pub last_refill_ms: u64,
}

/// Bucket capacity and refill rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketShape {
    /// Capacity, and the size of the largest burst
    pub max_tokens: u64,
    /// Steady-state refill rate
    pub tokens_per_second: f64,
}

impl BucketShape {
    /// Milliseconds `tokens` take to accrue, rounded up and clamped to `u64::MAX`.
    fn ms_for(&self, tokens: u64) -> u64 {
        let ms = (tokens as f64 * 1000.0 / self.tokens_per_second).ceil();
        if ms.is_finite() && ms < u64::MAX as f64 {
            ms as u64
        } else {
            u64::MAX
        }
    }

    /// Milliseconds consumed by crediting `tokens`, rounded down.
    fn credited_ms(&self, tokens: u64) -> u64 {
        let ms = (tokens as f64 * 1000.0 / self.tokens_per_second).floor();
        if ms.is_finite() && ms < u64::MAX as f64 {
            ms as u64
        } else {
            u64::MAX
        }
    }
}

impl Bucket {
    fn full(shape: &BucketShape, now_ms: u64) -> Self {
        Self {
            tokens: shape.max_tokens,
            last_refill_ms: now_ms,
        }
    }

    /// The bucket as it stands at `now_ms`, without touching `self`.
    ///
    /// Only whole tokens are credited. `last_refill_ms` advances by the time
    /// those tokens took, so the fractional remainder carries into the next
    /// refill. A full bucket pins `last_refill_ms` to `now_ms`.
    fn refilled(&self, shape: &BucketShape, now_ms: u64) -> Self {
        if self.tokens >= shape.max_tokens {
            return Self::full(shape, now_ms.max(self.last_refill_ms));
        }

        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let earned = (elapsed_ms as f64 * shape.tokens_per_second / 1000.0).floor() as u64;
        if earned == 0 {
            return *self;
        }

        let tokens = self.tokens.saturating_add(earned).min(shape.max_tokens);
        if tokens == shape.max_tokens {
            return Self::full(shape, now_ms);
        }

        Self {
            tokens,
            last_refill_ms: self
                .last_refill_ms
                .saturating_add(shape.credited_ms(earned))
                .min(now_ms),
        }
    }

    /// When `needed` more tokens will have accrued.
    fn ready_at(&self, shape: &BucketShape, needed: u64, now_ms: u64) -> u64 {
        let at = self.last_refill_ms.saturating_add(shape.ms_for(needed));
        at.max(now_ms.saturating_add(1))
    }
}

/// Allows bursts up to `max_tokens` while holding a steady refill rate.
///
/// New identifiers start with a full bucket.
pub struct TokenBucketLimiter {
    shape: BucketShape,
    clock: Arc<dyn Clock>,
    store: MemoryStore<Bucket>,
}

impl TokenBucketLimiter {
    /// Create a limiter with its own empty store.
    pub fn new(max_tokens: u64, tokens_per_second: f64, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(max_tokens, tokens_per_second, clock, MemoryStore::new())
    }

    /// Create a limiter over an existing store.
    pub fn with_store(
        max_tokens: u64,
        tokens_per_second: f64,
        clock: Arc<dyn Clock>,
        store: MemoryStore<Bucket>,
    ) -> Self {
        Self {
            shape: BucketShape {
                max_tokens,
                tokens_per_second,
            },
            clock,
            store,
        }
    }

    /// Capacity and refill rate.
    pub fn shape(&self) -> BucketShape {
        self.shape
    }

    /// Take `tokens` from the bucket for `identifier`.
    ///
    /// A rejected request leaves the bucket unchanged.
    pub fn check_tokens(&self, identifier: &str, tokens: u64) -> Result<RateLimitStatus> {
        let shape = self.shape;
        if tokens > shape.max_tokens {
            return Err(TurnstileError::InvalidCost {
                cost: tokens,
                capacity: shape.max_tokens,
            });
        }

        let now = self.clock.now_ms();
        trace!(identifier = %identifier, tokens = tokens, "Checking token bucket");

        let outcome = self.store.update(
            identifier,
            || Bucket::full(&shape, now),
            |bucket| {
                let current = bucket.refilled(&shape, now);
                if current.tokens < tokens {
                    return Err(current.ready_at(&shape, tokens - current.tokens, now));
                }

                *bucket = Bucket {
                    tokens: current.tokens - tokens,
                    ..current
                };
                Ok(Self::describe(&shape, bucket, now))
            },
        );

        outcome.map_err(|reset_at_ms| {
            debug!(identifier = %identifier, tokens = tokens, reset_at_ms = reset_at_ms, "Rate limit exceeded");
            TurnstileError::RateLimitExceeded {
                identifier: identifier.to_string(),
                limit: shape.max_tokens,
                reset_at_ms,
                retry_after_ms: reset_at_ms.saturating_sub(now),
            }
        })
    }

    /// Get the bucket for `identifier` as of now, if one exists.
    pub fn bucket(&self, identifier: &str) -> Option<Bucket> {
        let now = self.clock.now_ms();
        self.store
            .read(identifier, |b| b.map(|b| b.refilled(&self.shape, now)))
    }

    fn describe(shape: &BucketShape, bucket: &Bucket, now_ms: u64) -> RateLimitStatus {
        let reset_at_ms = if bucket.tokens >= shape.max_tokens {
            now_ms
        } else {
            bucket.ready_at(shape, shape.max_tokens - bucket.tokens, now_ms)
        };

        RateLimitStatus {
            limit: shape.max_tokens,
            remaining: bucket.tokens,
            reset_at_ms,
        }
    }
}

impl RateLimiterBackend for TokenBucketLimiter {
    fn strategy(&self) -> Strategy {
        Strategy::TokenBucket
    }

    fn check(&self, identifier: &str, cost: u64) -> Result<RateLimitStatus> {
        self.check_tokens(identifier, cost)
    }

    fn status(&self, identifier: &str) -> RateLimitStatus {
        let now = self.clock.now_ms();
        let bucket = self
            .store
            .read(identifier, |b| b.map(|b| b.refilled(&self.shape, now)))
            .unwrap_or_else(|| Bucket::full(&self.shape, now));
        Self::describe(&self.shape, &bucket, now)
    }

    fn reset(&self, identifier: &str) {
        self.store.remove(identifier);
    }

    fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let shape = self.shape;
        self.store
            .retain(|_, bucket| bucket.refilled(&shape, now).tokens < shape.max_tokens)
    }

    fn tracked(&self) -> usize {
        self.store.len()
    }
}
