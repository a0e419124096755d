//! Limiter contract shared by the distributed and local implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Outcome of a single `allow` call.
#[derive(Debug)]
pub enum Decision {
    /// A slot was consumed; the request may proceed.
    Allowed,
    /// The identifier is over its limit; nothing was recorded.
    Denied,
    /// The limiter could not reach a decision. Callers fail open and let the
    /// request through.
    Indeterminate(TollgateError),
}

impl Decision {
    /// Whether the request should be forwarded.
    pub fn is_permitted(&self) -> bool {
        !matches!(self, Decision::Denied)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Denied)
    }
}

/// Usage of an identifier's budget, computed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitInfo {
    /// Requests allowed per window
    pub limit: u64,
    /// Requests still available in the trailing window
    pub remaining: u64,
    /// When the next slot frees up
    pub reset_at: DateTime<Utc>,
}

impl LimitInfo {
    /// Seconds until `reset_at`, rounded up and never below one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds();
        let secs = (millis + 999).div_euclid(1000);
        secs.max(1) as u64
    }
}

/// A request budget: `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub limit: u64,
    pub window: Duration,
}

impl RatePolicy {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// `limit` requests per minute.
    pub fn per_minute(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

/// Which limiter implementation is serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterKind {
    /// Sliding window shared through the coordination backend
    Distributed,
    /// Per-process token buckets
    Local,
}

impl LimiterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::Distributed => "distributed",
            LimiterKind::Local => "local",
        }
    }
}

impl std::fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the `SlidingWindowLimiter` and the
/// `LocalRateLimiter` so the HTTP adapter can work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    fn kind(&self) -> LimiterKind;

    /// Try to consume one request from `identifier`'s budget.
    async fn allow(&self, identifier: &str, limit: u64, window: Duration) -> Decision;

    /// Current usage without consuming anything. `None` when the
    /// implementation does not track per-window usage.
    async fn limit_info(
        &self,
        _identifier: &str,
        _limit: u64,
        _window: Duration,
    ) -> Result<Option<LimitInfo>> {
        Ok(None)
    }

    /// Forget everything recorded for `identifier`.
    async fn reset(&self, identifier: &str) -> Result<()>;

    /// Liveness of whatever the limiter depends on.
    async fn health(&self) -> Result<()> {
        Ok(())
    }

    /// Stop background work owned by the limiter.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indeterminate_is_permitted() {
        assert!(Decision::Allowed.is_permitted());
        assert!(!Decision::Denied.is_permitted());
        let degraded = Decision::Indeterminate(TollgateError::Unavailable("down".to_string()));
        assert!(degraded.is_permitted());
        assert!(!degraded.is_denied());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let info = LimitInfo {
            limit: 3,
            remaining: 0,
            reset_at: now + chrono::Duration::milliseconds(12_300),
        };
        assert_eq!(info.retry_after_secs(now), 13);
    }

    #[test]
    fn test_retry_after_floor_is_one_second() {
        let now = Utc::now();
        let past = LimitInfo {
            limit: 3,
            remaining: 0,
            reset_at: now - chrono::Duration::seconds(5),
        };
        assert_eq!(past.retry_after_secs(now), 1);

        let exact = LimitInfo { reset_at: now, ..past };
        assert_eq!(exact.retry_after_secs(now), 1);
    }

    #[test]
    fn test_policy_per_minute() {
        let policy = RatePolicy::per_minute(3);
        assert_eq!(policy.limit, 3);
        assert_eq!(policy.window, Duration::from_secs(60));
    }
}
