//! Strategy trait shared by all limiter implementations.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::status::RateLimitStatus;
use crate::error::Result;

/// The limiting algorithm behind a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Counter reset at the end of each window
    FixedWindow,
    /// Timestamp log over a trailing window
    SlidingWindow,
    /// Continuously refilled token bucket
    TokenBucket,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::TokenBucket => "token_bucket",
        };
        f.write_str(name)
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the three strategies so the registry and the
/// HTTP guard can work with any of them.
pub trait RateLimiterBackend: Send + Sync {
    /// The algorithm this backend implements.
    fn strategy(&self) -> Strategy;

    /// Consume `cost` units for `identifier` using the configured limit.
    ///
    /// Returns the post-check status when admitted and
    /// [`TurnstileError::RateLimitExceeded`](crate::error::TurnstileError::RateLimitExceeded)
    /// when the quota is exhausted. A rejected check leaves the quota untouched.
    fn check(&self, identifier: &str, cost: u64) -> Result<RateLimitStatus>;

    /// Current quota for `identifier`. Never mutates state.
    fn status(&self, identifier: &str) -> RateLimitStatus;

    /// Forget everything known about `identifier`.
    fn reset(&self, identifier: &str);

    /// Drop state that no longer affects any decision. Returns entries removed.
    fn cleanup(&self) -> usize;

    /// Number of identifiers currently tracked.
    fn tracked(&self) -> usize;
}
