//! Rate limiting strategies and state management.

mod backend;
mod cleanup;
mod fixed_window;
mod identifier;
mod limiter;
mod rules;
mod sliding_window;
mod status;
mod store;
mod token_bucket;

pub use backend::{RateLimiterBackend, Strategy};
pub use cleanup::CleanupTask;
pub use fixed_window::{FixedWindowLimiter, WindowCounter};
pub use identifier::{fingerprint, KeySource, TrustedProxies, UNKNOWN_CLIENT};
pub use limiter::{RateLimiter, RateLimiterRegistry};
pub use rules::{BucketPolicy, PolicyConfig, RateLimitRules, RouteRule, TimeUnit, WindowPolicy};
pub use sliding_window::{RequestLog, SlidingWindowLimiter};
pub use status::RateLimitStatus;
pub use store::MemoryStore;
pub use token_bucket::{Bucket, BucketShape, TokenBucketLimiter};
