//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The identifier has exhausted its quota for now.
    ///
    /// This is an expected outcome, not a fault. Callers report it upstream
    /// (HTTP 429) and must not retry internally.
    #[error("Rate limit exceeded for {identifier}: limit {limit}, retry in {retry_after_ms}ms")]
    RateLimitExceeded {
        /// The identifier that was rejected
        identifier: String,
        /// The limit in force for the identifier
        limit: u64,
        /// Epoch milliseconds at which capacity frees up
        reset_at_ms: u64,
        /// Milliseconds from the check until `reset_at_ms`
        retry_after_ms: u64,
    },

    /// A single check asked for more than the strategy can ever grant.
    #[error("Requested cost {cost} exceeds capacity {capacity}")]
    InvalidCost {
        /// Units requested by the check
        cost: u64,
        /// Maximum units the strategy can hold
        capacity: u64,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// HTTP status code equivalent of this error.
    pub fn status_code(&self) -> u16 {
        match self {
            TurnstileError::RateLimitExceeded { .. } => 429,
            TurnstileError::InvalidCost { .. } => 400,
            TurnstileError::Config(_) | TurnstileError::Server(_) | TurnstileError::Io(_) => 500,
        }
    }

    /// Whether this error is a rejection by a limiter.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TurnstileError::RateLimitExceeded { .. })
    }

    /// Milliseconds until the caller may try again, if this is a rejection.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            TurnstileError::RateLimitExceeded { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_exceeded_is_429() {
        let err = TurnstileError::RateLimitExceeded {
            identifier: "10.0.0.1".to_string(),
            limit: 3,
            reset_at_ms: 60_000,
            retry_after_ms: 59_997,
        };

        assert_eq!(err.status_code(), 429);
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after_ms(), Some(59_997));
        assert!(err.to_string().contains("10.0.0.1"));
    }

    #[test]
    fn test_other_errors_are_not_rate_limited() {
        let err = TurnstileError::Config("bad".to_string());
        assert!(!err.is_rate_limited());
        assert_eq!(err.retry_after_ms(), None);
        assert_eq!(err.status_code(), 500);

        let err = TurnstileError::InvalidCost { cost: 11, capacity: 10 };
        assert_eq!(err.status_code(), 400);
    }
}
