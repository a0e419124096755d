//! Token bucket used by the local limiter.

use std::time::Duration;
use tokio::time::Instant;

/// A continuously refilling token bucket.
///
/// The bucket starts full. Capacity is fixed at creation; the refill rate
/// follows whatever `limit / window` the caller passes on each acquire.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens currently available
    tokens: f64,
    /// Maximum tokens the bucket can hold
    capacity: f64,
    /// Last time tokens were added
    last_refill: Instant,
    /// Last time the bucket was used
    last_seen: Instant,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens.
    pub fn new(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Refill at `limit / window` and try to take one token.
    ///
    /// Returns `true` if a token was available.
    pub fn try_acquire(&mut self, limit: u64, window: Duration, now: Instant) -> bool {
        self.last_seen = now;
        self.refill(refill_rate(limit, window), now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u32 {
        self.tokens.floor() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Time since the bucket was last used.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    fn refill(&mut self, rate_per_sec: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Tokens per second for `limit` requests per `window`.
fn refill_rate(limit: u64, window: Duration) -> f64 {
    let secs = window.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    limit as f64 / secs
}
