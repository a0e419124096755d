//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::store::MAX_WINDOW;

/// Prefix of environment variables that override file settings.
///
/// Nested keys are separated with a double underscore, e.g.
/// `TOLLGATE__RATE_LIMITING__REDIS_URL`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests accepted per identifier within one window
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Connection string of the shared coordination backend. When absent,
    /// every request goes through the in-process limiter.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Abort startup instead of falling back when the backend cannot be reached
    #[serde(default)]
    pub require_backend: bool,

    /// Connect/response timeout for backend calls, in milliseconds
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Token bucket capacity of the local limiter
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// How often the local limiter sweeps idle buckets, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Idle time after which a local bucket is evicted, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            redis_url: None,
            require_backend: false,
            backend_timeout_ms: default_backend_timeout_ms(),
            burst: default_burst(),
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_requests_per_window() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_backend_timeout_ms() -> u64 {
    3000
}

fn default_burst() -> u32 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    180
}

fn default_idle_timeout_secs() -> u64 {
    180
}

impl RateLimitingConfig {
    /// The window every request is counted against.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Timeout applied to each coordination backend call.
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl TollgateConfig {
    /// Load configuration from an optional file, then apply `TOLLGATE__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        let config: TollgateConfig = settings
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiters cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.window_secs == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.window_secs must be greater than zero".to_string(),
            ));
        }
        if rl.window() > MAX_WINDOW {
            return Err(TollgateError::Config(format!(
                "rate_limiting.window_secs must be at most {}",
                MAX_WINDOW.as_secs()
            )));
        }
        if rl.backend_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.backend_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if rl.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
