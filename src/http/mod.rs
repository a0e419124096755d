//! HTTP surface: rate limiting middleware, admin routes and the server.

mod middleware;
mod server;

pub use middleware::{
    identifier_for, protect, rate_limit, too_many_requests, AuthenticatedUser, RateLimitGuard,
    RATE_LIMIT_MESSAGE, UNKNOWN_CLIENT, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use server::HttpServer;
