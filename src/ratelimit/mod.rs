//! Rate limiting logic and state management.

mod backend;
mod counter;
mod distributed;
mod key;
mod limiter;
mod selector;

pub use backend::{Decision, LimitInfo, LimiterKind, RateLimiterBackend, RatePolicy};
pub use counter::TokenBucket;
pub use distributed::{SlidingWindowLimiter, DEFAULT_CALL_TIMEOUT};
pub use key::{UsageKey, KEY_PREFIX};
pub use limiter::{LocalLimiterSettings, LocalRateLimiter, DEFAULT_BURST, DEFAULT_SWEEP_INTERVAL};
pub use selector::{build_limiter, connect_backend, select_limiter};
