//! Startup selection between the distributed and local limiters.

use std::sync::Arc;
use tracing::{info, warn};

use super::backend::RateLimiterBackend;
use super::distributed::SlidingWindowLimiter;
use super::limiter::{LocalLimiterSettings, LocalRateLimiter};
use crate::config::RateLimitingConfig;
use crate::error::{Result, TollgateError};
use crate::store::{RedisWindowStore, WindowStore};

/// Connect to the configured coordination backend, if any.
///
/// Returns `Ok(None)` when no backend is configured, or when connecting
/// fails and `require_backend` is off. With `require_backend` on, a failed
/// connection is returned as an error so startup can abort.
pub async fn connect_backend(
    config: &RateLimitingConfig,
) -> Result<Option<Arc<dyn WindowStore>>> {
    let Some(url) = config.redis_url.as_deref() else {
        info!("No coordination backend configured");
        return Ok(None);
    };

    match RedisWindowStore::connect(url, config.backend_timeout()).await {
        Ok(store) => {
            let store: Arc<dyn WindowStore> = Arc::new(store);
            Ok(Some(store))
        }
        Err(e) if config.require_backend => Err(e),
        Err(e) => {
            warn!(
                error = %e,
                "Coordination backend unreachable, falling back to local rate limiting"
            );
            Ok(None)
        }
    }
}

/// Pick the limiter serving this process for its whole lifetime.
///
/// A backend handle selects the distributed sliding-window limiter;
/// otherwise the local token-bucket limiter is used. There is no re-probing
/// later on.
pub fn select_limiter(
    store: Option<Arc<dyn WindowStore>>,
    config: &RateLimitingConfig,
) -> Arc<dyn RateLimiterBackend> {
    let limiter: Arc<dyn RateLimiterBackend> = match store {
        Some(store) => {
            info!("Using distributed sliding-window rate limiter");
            Arc::new(SlidingWindowLimiter::with_timeout(
                store,
                config.backend_timeout(),
            ))
        }
        None => {
            warn!("Using local token-bucket rate limiter; limits are enforced per instance only");
            Arc::new(LocalRateLimiter::new(LocalLimiterSettings::from(config)))
        }
    };
    limiter
}

/// Connect (when configured) and select in one step.
pub async fn build_limiter(config: &RateLimitingConfig) -> Result<Arc<dyn RateLimiterBackend>> {
    if config.require_backend && config.redis_url.is_none() {
        return Err(TollgateError::Config(
            "rate_limiting.require_backend is set but no redis_url is configured".to_string(),
        ));
    }
    let store = connect_backend(config).await?;
    Ok(select_limiter(store, config))
}
