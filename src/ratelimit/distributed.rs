//! Distributed sliding-window rate limiter.
//!
//! Every accepted request becomes one entry in a time-ordered set shared by
//! all service instances through a [`WindowStore`]. The count of entries in
//! the trailing window is the number of requests accepted in it, so old
//! entries age out one at a time instead of all at once at a boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::backend::{Decision, LimitInfo, LimiterKind, RateLimiterBackend};
use super::key::UsageKey;
use crate::error::{Result, TollgateError};
use crate::store::{WindowStore, MAX_WINDOW};

/// Default bound on a single backend round-trip.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// A rate limiter whose counts live in a shared [`WindowStore`].
pub struct SlidingWindowLimiter {
    /// Shared store holding every identifier's window
    store: Arc<dyn WindowStore>,
    /// Hard timeout around each store call
    call_timeout: Duration,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl SlidingWindowLimiter {
    /// Create a new limiter over `store`.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self::with_timeout(store, DEFAULT_CALL_TIMEOUT)
    }

    /// Create a new limiter with a custom per-call timeout.
    pub fn with_timeout(store: Arc<dyn WindowStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Check and consume one slot of `identifier`'s budget.
    ///
    /// Backend failures and timeouts come back as
    /// [`Decision::Indeterminate`], never as a denial.
    pub async fn allow(&self, identifier: &str, limit: u64, window: Duration) -> Decision {
        if limit == 0 {
            debug!(identifier = %identifier, "Zero limit, denying");
            return Decision::Denied;
        }

        let key = UsageKey::new(identifier);
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = window_millis(window);
        let window_start_ms = now_ms - window_ms;
        // Score is coarse (ms); the member must stay unique within it.
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        let ttl = Duration::from_millis(window_ms as u64);

        trace!(
            key = %key,
            limit = limit,
            window_ms = window_ms,
            "Checking sliding window"
        );

        let admitted = self
            .call(
                self.store
                    .admit(key.as_str(), limit, window_start_ms, now_ms, &member, ttl),
            )
            .await;

        match admitted {
            Ok(admission) if admission.allowed => {
                trace!(key = %key, count = admission.count, "Request admitted");
                Decision::Allowed
            }
            Ok(admission) => {
                debug!(
                    identifier = %identifier,
                    count = admission.count,
                    limit = limit,
                    "Rate limit exceeded"
                );
                Decision::Denied
            }
            Err(e) if e.is_transient() => {
                warn!(
                    identifier = %identifier,
                    error = %e,
                    "Rate limiter backend failed, failing open"
                );
                Decision::Indeterminate(e)
            }
            Err(e) => {
                error!(
                    identifier = %identifier,
                    error = %e,
                    "Rate limiter misconfigured, failing open"
                );
                Decision::Indeterminate(e)
            }
        }
    }

    /// Report `identifier`'s usage without recording a request.
    pub async fn limit_info(
        &self,
        identifier: &str,
        limit: u64,
        window: Duration,
    ) -> Result<LimitInfo> {
        let key = UsageKey::new(identifier);
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let window_ms = window_millis(window);

        let usage = self
            .call(self.store.usage(key.as_str(), now_ms - window_ms, now_ms))
            .await?;

        let reset_ms = usage
            .oldest_ms
            .map(|oldest| oldest + window_ms)
            .unwrap_or(now_ms + window_ms);

        Ok(LimitInfo {
            limit,
            remaining: limit.saturating_sub(usage.count),
            reset_at: DateTime::<Utc>::from_timestamp_millis(reset_ms).unwrap_or(now),
        })
    }

    /// Delete `identifier`'s usage record.
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        let key = UsageKey::new(identifier);
        self.call(self.store.delete(key.as_str())).await?;
        info!(key = %key, "Usage record reset");
        Ok(())
    }

    /// Check the backend is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.call(self.store.ping()).await
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| TollgateError::Timeout(self.call_timeout))?
    }
}

/// Window length in milliseconds, clamped to [`MAX_WINDOW`].
fn window_millis(window: Duration) -> i64 {
    window.min(MAX_WINDOW).as_millis() as i64
}

#[async_trait]
impl RateLimiterBackend for SlidingWindowLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Distributed
    }

    async fn allow(&self, identifier: &str, limit: u64, window: Duration) -> Decision {
        self.allow(identifier, limit, window).await
    }

    async fn limit_info(
        &self,
        identifier: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Option<LimitInfo>> {
        self.limit_info(identifier, limit, window).await.map(Some)
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        self.reset(identifier).await
    }

    async fn health(&self) -> Result<()> {
        self.ping().await
    }
}
