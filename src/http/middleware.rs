//! Rate limiting middleware for axum routers.
//!
//! Each request is counted against an identifier: the authenticated user id
//! when the identity layer has attached one, else the client IP. Denied
//! requests get a 429; limiter failures let the request through.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::ratelimit::{Decision, LimitInfo, RateLimiterBackend, RatePolicy};

/// Body message of every 429 response.
pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

/// Identifier used when neither a user nor a client address is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Authenticated caller, inserted into request extensions by the identity
/// layer before this middleware runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Shared state of the middleware: the active limiter and the budget applied
/// to the protected routes.
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: Arc<dyn RateLimiterBackend>,
    policy: RatePolicy,
}

impl std::fmt::Debug for RateLimitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGuard")
            .field("limiter", &self.limiter.kind())
            .field("policy", &self.policy)
            .finish()
    }
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<dyn RateLimiterBackend>, policy: RatePolicy) -> Self {
        Self { limiter, policy }
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiterBackend> {
        &self.limiter
    }

    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    /// Usage info for headers. Failures only cost the headers.
    async fn usage(&self, identifier: &str) -> Option<LimitInfo> {
        match self
            .limiter
            .limit_info(identifier, self.policy.limit, self.policy.window)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                debug!(identifier = %identifier, error = %e, "Skipping rate limit headers");
                None
            }
        }
    }
}

/// Wrap every route of `router` with the rate limiting middleware.
pub fn protect<S>(router: Router<S>, guard: RateLimitGuard) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(guard, rate_limit))
}

/// Pick the identifier a request is counted against.
pub fn identifier_for(request: &Request) -> String {
    if let Some(AuthenticatedUser(user_id)) = request.extensions().get::<AuthenticatedUser>() {
        return user_id.clone();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Middleware entry point; use with `axum::middleware::from_fn_with_state`.
#[instrument(skip_all, fields(identifier = tracing::field::Empty))]
pub async fn rate_limit(
    State(guard): State<RateLimitGuard>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = identifier_for(&request);
    tracing::Span::current().record("identifier", identifier.as_str());

    let RatePolicy { limit, window } = guard.policy;
    match guard.limiter.allow(&identifier, limit, window).await {
        Decision::Allowed => {
            let info = guard.usage(&identifier).await;
            let mut response = next.run(request).await;
            if let Some(info) = info {
                insert_limit_headers(response.headers_mut(), &info);
            }
            response
        }
        Decision::Denied => {
            debug!(limit = limit, "Rejecting request over rate limit");
            let info = guard.usage(&identifier).await;
            too_many_requests(info.as_ref())
        }
        Decision::Indeterminate(e) => {
            warn!(error = %e, "Rate limiter degraded, forwarding request");
            next.run(request).await
        }
    }
}

/// Build the 429 response, with usage headers when they are known.
pub fn too_many_requests(info: Option<&LimitInfo>) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": RATE_LIMIT_MESSAGE })),
    )
        .into_response();

    if let Some(info) = info {
        let headers = response.headers_mut();
        insert_limit_headers(headers, info);
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(info.retry_after_secs(Utc::now())),
        );
    }
    response
}

fn insert_limit_headers(headers: &mut HeaderMap, info: &LimitInfo) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(info.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(info.reset_at.timestamp()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TollgateError};
    use crate::ratelimit::{LimiterKind, LocalLimiterSettings, LocalRateLimiter, SlidingWindowLimiter};
    use crate::store::MemoryWindowStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::routing::get;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Limiter whose backend is always down.
    struct DegradedLimiter;

    #[async_trait]
    impl RateLimiterBackend for DegradedLimiter {
        fn kind(&self) -> LimiterKind {
            LimiterKind::Distributed
        }

        async fn allow(&self, _identifier: &str, _limit: u64, _window: Duration) -> Decision {
            Decision::Indeterminate(TollgateError::Unavailable("connection reset".to_string()))
        }

        async fn limit_info(
            &self,
            _identifier: &str,
            _limit: u64,
            _window: Duration,
        ) -> Result<Option<LimitInfo>> {
            Err(TollgateError::Unavailable("connection reset".to_string()))
        }

        async fn reset(&self, _identifier: &str) -> Result<()> {
            Err(TollgateError::Unavailable("connection reset".to_string()))
        }
    }

    fn distributed_guard(limit: u64) -> RateLimitGuard {
        let limiter = SlidingWindowLimiter::new(Arc::new(MemoryWindowStore::new()));
        RateLimitGuard::new(Arc::new(limiter), RatePolicy::per_minute(limit))
    }

    fn app(guard: RateLimitGuard) -> Router {
        protect(Router::new().route("/tasks", get(|| async { "ok" })), guard)
    }

    fn request_from_user(user: &str) -> Request {
        let mut request = axum::http::Request::builder().uri("/tasks").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(AuthenticatedUser(user.to_string()));
        request
    }

    fn request_from_addr(addr: &str) -> Request {
        let mut request = axum::http::Request::builder().uri("/tasks").body(Body::empty()).unwrap();
        let addr: SocketAddr = addr.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    fn header_u64(response: &Response, name: &str) -> u64 {
        response
            .headers()
            .get(name)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn test_identifier_prefers_user() {
        let mut request = request_from_addr("10.1.2.3:5555");
        assert_eq!(identifier_for(&request), "10.1.2.3");

        request
            .extensions_mut()
            .insert(AuthenticatedUser("u42".to_string()));
        assert_eq!(identifier_for(&request), "u42");
    }

    #[test]
    fn test_identifier_without_address() {
        let request = axum::http::Request::builder().body(Body::empty()).unwrap();
        assert_eq!(identifier_for(&request), UNKNOWN_CLIENT);
    }

    #[tokio::test]
    async fn test_end_to_end_limit_and_reset() {
        let guard = distributed_guard(3);
        let app = app(guard.clone());

        for expected_remaining in [2u64, 1, 0] {
            let response = app.clone().oneshot(request_from_user("u1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header_u64(&response, "x-ratelimit-limit"), 3);
            assert_eq!(header_u64(&response, "x-ratelimit-remaining"), expected_remaining);
        }

        let response = app.clone().oneshot(request_from_user("u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(header_u64(&response, "retry-after") >= 1);
        assert_eq!(header_u64(&response, "x-ratelimit-remaining"), 0);
        let reset = header_u64(&response, "x-ratelimit-reset");
        assert!(reset as i64 >= Utc::now().timestamp());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "error": RATE_LIMIT_MESSAGE }));

        guard.limiter().reset("u1").await.unwrap();
        let response = app.clone().oneshot(request_from_user("u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_users_and_addresses_are_separate() {
        let app = app(distributed_guard(1));

        let response = app.clone().oneshot(request_from_user("u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(request_from_user("u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.clone().oneshot(request_from_addr("192.0.2.7:40000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(request_from_user("u2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_degraded_limiter_fails_open_without_headers() {
        let guard = RateLimitGuard::new(Arc::new(DegradedLimiter), RatePolicy::per_minute(1));
        let app = app(guard);

        for _ in 0..5 {
            let response = app.clone().oneshot(request_from_user("u1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
    }

    #[tokio::test]
    async fn test_local_limiter_rejects_without_headers() {
        let limiter = LocalRateLimiter::new(LocalLimiterSettings {
            burst: 2,
            sweep_interval: None,
            ..LocalLimiterSettings::default()
        });
        let guard = RateLimitGuard::new(Arc::new(limiter), RatePolicy::per_minute(2));
        let app = app(guard);

        for _ in 0..2 {
            let response = app.clone().oneshot(request_from_user("u1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }

        let response = app.clone().oneshot(request_from_user("u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get("retry-after").is_none());
    }

    #[test]
    fn test_rejection_without_info() {
        let response = too_many_requests(None);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get("retry-after").is_none());
    }
}
