//! In-process token-bucket rate limiter.
//!
//! Used when no coordination backend is configured. Buckets live in this
//! process only, so every instance of a horizontally scaled service enforces
//! its own budget: the effective fleet-wide limit is multiplied by the
//! instance count.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::backend::{Decision, LimiterKind, RateLimiterBackend};
use super::counter::TokenBucket;
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// Default bucket capacity.
pub const DEFAULT_BURST: u32 = 10;
/// Default interval between idle sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(180);

type Buckets = Arc<Mutex<HashMap<String, TokenBucket>>>;

/// Settings for a [`LocalRateLimiter`].
#[derive(Debug, Clone)]
pub struct LocalLimiterSettings {
    /// Capacity of every bucket, independent of the caller's limit
    pub burst: u32,
    /// Interval of the background sweep; `None` disables it
    pub sweep_interval: Option<Duration>,
    /// Buckets unused for longer than this are evicted by a sweep
    pub idle_timeout: Duration,
}

impl Default for LocalLimiterSettings {
    fn default() -> Self {
        Self {
            burst: DEFAULT_BURST,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
            idle_timeout: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl From<&RateLimitingConfig> for LocalLimiterSettings {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            burst: config.burst,
            sweep_interval: Some(config.sweep_interval()),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Per-process limiter keeping one token bucket per identifier.
///
/// The background sweeper is started on construction and stopped by
/// [`LocalRateLimiter::shutdown`] or when the limiter is dropped.
pub struct LocalRateLimiter {
    /// Token buckets indexed by identifier
    buckets: Buckets,
    settings: LocalLimiterSettings,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRateLimiter")
            .field("settings", &self.settings)
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

impl LocalRateLimiter {
    /// Create a new local limiter.
    ///
    /// Spawns the idle sweeper when `settings.sweep_interval` is set, which
    /// requires a running Tokio runtime.
    pub fn new(settings: LocalLimiterSettings) -> Self {
        let buckets: Buckets = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sweeper = settings.sweep_interval.map(|interval| {
            debug!(
                interval_secs = interval.as_secs(),
                idle_timeout_secs = settings.idle_timeout.as_secs(),
                "Starting idle bucket sweeper"
            );
            tokio::spawn(run_sweeper(
                buckets.clone(),
                interval,
                settings.idle_timeout,
                shutdown_rx,
            ))
        });

        Self {
            buckets,
            settings,
            shutdown_tx,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Try to take one token from `identifier`'s bucket.
    pub fn allow(&self, identifier: &str, limit: u64, window: Duration) -> Decision {
        if limit == 0 {
            return Decision::Denied;
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(identifier.to_string())
            .or_insert_with(|| {
                trace!(identifier = %identifier, burst = self.settings.burst, "Creating bucket");
                TokenBucket::new(self.settings.burst, now)
            });

        if bucket.try_acquire(limit, window, now) {
            Decision::Allowed
        } else {
            debug!(identifier = %identifier, "Local rate limit exceeded");
            Decision::Denied
        }
    }

    /// Evict buckets idle longer than the configured timeout.
    ///
    /// Returns the number of evicted buckets.
    pub fn sweep_idle(&self) -> usize {
        sweep(&self.buckets, self.settings.idle_timeout, Instant::now())
    }

    /// Drop `identifier`'s bucket.
    pub fn remove(&self, identifier: &str) {
        self.buckets.lock().remove(identifier);
    }

    /// Get the number of tracked identifiers.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Stop the background sweeper and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("Idle bucket sweeper stopped");
        }
    }
}

impl Drop for LocalRateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn sweep(buckets: &Buckets, idle_timeout: Duration, now: Instant) -> usize {
    let mut buckets = buckets.lock();
    let before = buckets.len();
    buckets.retain(|_, bucket| bucket.idle_for(now) <= idle_timeout);
    before - buckets.len()
}

async fn run_sweeper(
    buckets: Buckets,
    interval: Duration,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = sweep(&buckets, idle_timeout, Instant::now());
                if evicted > 0 {
                    debug!(evicted = evicted, "Evicted idle rate limit buckets");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl RateLimiterBackend for LocalRateLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Local
    }

    async fn allow(&self, identifier: &str, limit: u64, window: Duration) -> Decision {
        LocalRateLimiter::allow(self, identifier, limit, window)
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        self.remove(identifier);
        Ok(())
    }

    async fn shutdown(&self) {
        LocalRateLimiter::shutdown(self).await
    }
}
