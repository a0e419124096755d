//! HTTP server implementation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use tracing::{error, info, warn};

use super::middleware::{protect, RateLimitGuard};
use crate::error::{Result, TollgateError};

/// HTTP server putting a route group behind the rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Limiter and budget for the protected routes
    guard: RateLimitGuard,
    /// Routes subject to rate limiting
    protected: Router,
}

impl HttpServer {
    /// Create a new server protecting `routes`.
    pub fn new(addr: SocketAddr, guard: RateLimitGuard, routes: Router) -> Self {
        Self {
            addr,
            guard,
            protected: routes,
        }
    }

    /// Build the full application router.
    ///
    /// `/health` and `/admin/ratelimit/{identifier}` are not rate limited.
    pub fn router(&self) -> Router {
        let admin = Router::new()
            .route("/health", get(health))
            .route(
                "/admin/ratelimit/{identifier}",
                get(limit_info).delete(reset_identifier),
            )
            .with_state(self.guard.clone());

        admin.merge(protect(self.protected.clone(), self.guard.clone()))
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves, after
    /// which the limiter's background work is stopped.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            limiter = %self.guard.limiter().kind(),
            limit = self.guard.policy().limit,
            window_secs = self.guard.policy().window.as_secs(),
            "Starting HTTP server with graceful shutdown"
        );

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        });

        self.guard.limiter().shutdown().await;
        served
    }
}

/// `GET /health`: liveness plus the state of the coordination backend.
async fn health(State(guard): State<RateLimitGuard>) -> Response {
    let kind = guard.limiter().kind();
    match guard.limiter().health().await {
        Ok(()) => Json(json!({ "status": "ok", "limiter": kind.as_str() })).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check found rate limiter backend degraded");
            Json(json!({
                "status": "degraded",
                "limiter": kind.as_str(),
                "error": e.to_string(),
            }))
            .into_response()
        }
    }
}

/// `GET /admin/ratelimit/{identifier}`: usage without consuming a slot.
async fn limit_info(
    State(guard): State<RateLimitGuard>,
    Path(identifier): Path<String>,
) -> Response {
    let policy = guard.policy();
    match guard
        .limiter()
        .limit_info(&identifier, policy.limit, policy.window)
        .await
    {
        Ok(Some(info)) => Json(json!({
            "identifier": identifier,
            "limit": info.limit,
            "remaining": info.remaining,
            "reset_at": info.reset_at.timestamp(),
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({ "error": "Usage info is not tracked by the local rate limiter." })),
        )
            .into_response(),
        Err(e) => backend_unavailable(e),
    }
}

/// `DELETE /admin/ratelimit/{identifier}`: forget the identifier's usage.
async fn reset_identifier(
    State(guard): State<RateLimitGuard>,
    Path(identifier): Path<String>,
) -> Response {
    match guard.limiter().reset(&identifier).await {
        Ok(()) => {
            info!(identifier = %identifier, "Rate limit reset via admin API");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => backend_unavailable(e),
    }
}

fn backend_unavailable(e: TollgateError) -> Response {
    warn!(error = %e, "Admin request failed on rate limiter backend");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "Rate limiter backend unavailable." })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::AuthenticatedUser;
    use crate::ratelimit::{
        LocalLimiterSettings, LocalRateLimiter, RatePolicy, SlidingWindowLimiter,
    };
    use crate::store::MemoryWindowStore;
    use axum::body::Body;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn server_with(guard: RateLimitGuard) -> HttpServer {
        let routes = Router::new().route("/api/ping", get(|| async { "pong" }));
        HttpServer::new("127.0.0.1:0".parse().unwrap(), guard, routes)
    }

    fn distributed_server(limit: u64) -> HttpServer {
        let limiter = SlidingWindowLimiter::new(Arc::new(MemoryWindowStore::new()));
        server_with(RateLimitGuard::new(
            Arc::new(limiter),
            RatePolicy::per_minute(limit),
        ))
    }

    fn get_request(uri: &str, user: Option<&str>) -> axum::extract::Request {
        let mut request = axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        if let Some(user) = user {
            request
                .extensions_mut()
                .insert(AuthenticatedUser(user.to_string()));
        }
        request
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_limiter_kind() {
        let app = distributed_server(1).router();

        let response = app.oneshot(get_request("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["limiter"], "distributed");
    }

    #[tokio::test]
    async fn test_admin_routes_are_not_limited() {
        let app = distributed_server(1).router();

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(get_request("/health", Some("u1")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(get_request("/api/ping", Some("u1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_info_and_reset() {
        let app = distributed_server(2).router();

        for _ in 0..2 {
            app.clone()
                .oneshot(get_request("/api/ping", Some("u1")))
                .await
                .unwrap();
        }
        let response = app
            .clone()
            .oneshot(get_request("/api/ping", Some("u1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app
            .clone()
            .oneshot(get_request("/admin/ratelimit/u1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["identifier"], "u1");
        assert_eq!(body["limit"], 2);
        assert_eq!(body["remaining"], 0);

        let delete = axum::http::Request::builder()
            .method("DELETE")
            .uri("/admin/ratelimit/u1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(get_request("/api/ping", Some("u1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_local_limiter_has_no_usage_info() {
        let limiter = LocalRateLimiter::new(LocalLimiterSettings {
            sweep_interval: None,
            ..LocalLimiterSettings::default()
        });
        let server = server_with(RateLimitGuard::new(
            Arc::new(limiter),
            RatePolicy::per_minute(5),
        ));

        let response = server
            .router()
            .oneshot(get_request("/admin/ratelimit/u1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown_stops() {
        let server = distributed_server(1);
        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
