//! HTTP server exposing demonstration routes behind the rate limit layer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::layer::RateLimitLayer;
use crate::error::Result;
use crate::ratelimit::{KeyExtractor, RateLimiter};

/// State shared by the route handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub extractor: Arc<dyn KeyExtractor>,
}

/// Quota report returned by `/ratelimit/status`.
#[derive(Debug, Serialize)]
struct QuotaStatus {
    key: String,
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_at: String,
}

/// HTTP server for the rate limited demo routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
    exempt_paths: Vec<String>,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(
        addr: SocketAddr,
        limiter: Arc<RateLimiter>,
        extractor: Arc<dyn KeyExtractor>,
    ) -> Self {
        Self {
            addr,
            state: AppState { limiter, extractor },
            exempt_paths: Vec::new(),
        }
    }

    /// Paths that bypass the limiter.
    pub fn with_exempt_paths(mut self, paths: Vec<String>) -> Self {
        self.exempt_paths = paths;
        self
    }

    /// Build the router with the rate limit layer applied.
    pub fn router(&self) -> Router {
        let layer = RateLimitLayer::with_key_extractor(
            self.state.limiter.clone(),
            self.state.extractor.clone(),
        )
        .exempt(self.exempt_paths.clone());

        Router::new()
            .route("/", get(index))
            .route("/health", get(health))
            .route("/ratelimit/status", get(quota_status))
            .with_state(self.state.clone())
            .layer(layer)
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = self.router();

        info!(
            addr = %self.addr,
            store = self.state.limiter.store().name(),
            max_requests = self.state.limiter.config().max_requests(),
            window_secs = self.state.limiter.config().window_duration().as_secs(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

async fn index() -> &'static str {
    "windgate: request admitted\n"
}

async fn health() -> &'static str {
    "ok"
}

/// The caller's own quota, read without counting.
async fn quota_status(State(state): State<AppState>, request: Request) -> Response {
    let key = state.extractor.extract(&request);

    match state.limiter.peek(&key).await {
        Ok(decision) => Json(QuotaStatus {
            key: key.to_string(),
            allowed: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at.to_rfc3339(),
        })
        .into_response(),
        Err(err) => {
            warn!(key = %key, error = %err, "Quota lookup failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "rate limit store unavailable" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{InMemoryStore, LimiterConfig, PeerIpExtractor};
    use axum::body::Body;
    use axum::http;
    use tower::ServiceExt;

    fn server(max: u64) -> HttpServer {
        let config = LimiterConfig::per_seconds(max, 60).unwrap();
        let limiter = Arc::new(RateLimiter::new(config, Arc::new(InMemoryStore::new())));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        HttpServer::new(addr, limiter, Arc::new(PeerIpExtractor::new()))
            .with_exempt_paths(vec!["/health".to_string()])
    }

    fn get_from(path: &str, ip: &str) -> Request {
        http::Request::builder()
            .uri(path)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_quota() {
        let app = server(3).router();

        app.clone().oneshot(get_from("/", "1.2.3.4")).await.unwrap();
        let response = app.oneshot(get_from("/ratelimit/status", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["key"], "ip:1.2.3.4");
        assert_eq!(json["limit"], 3);
        // The status request itself was counted by the layer before the peek.
        assert_eq!(json["remaining"], 1);
        assert_eq!(json["allowed"], true);
    }

    #[tokio::test]
    async fn test_health_is_not_limited() {
        let app = server(1).router();

        for _ in 0..3 {
            let response = app.clone().oneshot(get_from("/health", "1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(get_from("/", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get_from("/", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_serve_with_immediate_shutdown() {
        let result = server(1).serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
