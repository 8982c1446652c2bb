//! Quota snapshots returned by checks and status queries.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Snapshot of an identifier's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    /// Limit in force for the identifier
    pub limit: u64,
    /// Units still available right now
    pub remaining: u64,
    /// Epoch milliseconds at which capacity frees up
    #[serde(rename = "reset")]
    pub reset_at_ms: u64,
}

impl RateLimitStatus {
    /// Milliseconds from `now_ms` until the reset.
    pub fn retry_after_ms(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms)
    }

    /// Reset time as whole seconds since the epoch, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// Reset time as a UTC timestamp.
    pub fn reset_at(&self) -> DateTime<Utc> {
        i64::try_from(self.reset_at_ms)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_saturates() {
        let status = RateLimitStatus {
            limit: 3,
            remaining: 0,
            reset_at_ms: 60_000,
        };
        assert_eq!(status.retry_after_ms(3), 59_997);
        assert_eq!(status.retry_after_ms(70_000), 0);
    }

    #[test]
    fn test_reset_conversions() {
        let status = RateLimitStatus {
            limit: 3,
            remaining: 1,
            reset_at_ms: 1_500,
        };
        assert_eq!(status.reset_at_secs(), 2);
        assert_eq!(status.reset_at().timestamp_millis(), 1_500);
    }

    #[test]
    fn test_serializes_camel_case() {
        let status = RateLimitStatus {
            limit: 10,
            remaining: 4,
            reset_at_ms: 42,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["limit"], 10);
        assert_eq!(json["remaining"], 4);
        assert_eq!(json["reset"], 42);
    }
}
