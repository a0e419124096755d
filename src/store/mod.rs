//! Coordination backend for the distributed limiter.
//!
//! A [`WindowStore`] keeps one time-ordered set of request entries per key
//! and runs the purge/count/insert sequence atomically, so any number of
//! service instances sharing the store see the same counts.

mod memory;
mod redis;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use self::memory::MemoryWindowStore;
pub use self::redis::RedisWindowStore;

/// Longest window a store will track. Scores are unix milliseconds in an
/// `i64`, and Redis rejects expirations that overflow once added to the
/// server clock, so windows and TTLs are clamped to this.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Key expiration in milliseconds, clamped to `1..=MAX_WINDOW`.
pub(crate) fn ttl_millis(ttl: Duration) -> i64 {
    let max = MAX_WINDOW.as_millis() as i64;
    i64::try_from(ttl.as_millis()).unwrap_or(max).clamp(1, max)
}

/// Outcome of an atomic admit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the entry was recorded
    pub allowed: bool,
    /// Entries in the window after the attempt
    pub count: u64,
}

/// Snapshot of a key's entries inside the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    /// Entries with a score at or after the window start
    pub count: u64,
    /// Score (unix milliseconds) of the oldest surviving entry
    pub oldest_ms: Option<i64>,
}

/// Shared store of per-key sliding windows.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically drop entries scored before `window_start_ms`, count the
    /// rest, and record `member` at `now_ms` if the count is below `limit`.
    /// A recorded entry refreshes the key's expiration to `ttl`.
    async fn admit(
        &self,
        key: &str,
        limit: u64,
        window_start_ms: i64,
        now_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<Admission>;

    /// Drop entries scored before `window_start_ms` and report what is left
    /// without recording anything.
    async fn usage(&self, key: &str, window_start_ms: i64, now_ms: i64) -> Result<Usage>;

    /// Remove the key and all of its entries.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lightweight liveness check.
    async fn ping(&self) -> Result<()>;
}
