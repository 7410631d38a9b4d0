//! Tower middleware that puts a [`RateLimiter`] in front of a service.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use crate::ratelimit::{AdmitDecision, FailurePolicy, KeyExtractor, PeerIpExtractor, RateLimiter};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Settings shared by every clone of the layer and its services.
struct Shared {
    limiter: Arc<RateLimiter>,
    extractor: Arc<dyn KeyExtractor>,
    exempt_paths: Vec<String>,
}

impl Shared {
    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| {
            path == exempt
                || path
                    .strip_prefix(exempt.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Rate limiting layer.
///
/// Admitted responses carry `X-RateLimit-*` headers; denied requests get a
/// `429` with `Retry-After` and never reach the inner service.
#[derive(Clone)]
pub struct RateLimitLayer {
    shared: Arc<Shared>,
}

impl RateLimitLayer {
    /// Limit by client address using the default trusted headers.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self::with_key_extractor(limiter, Arc::new(PeerIpExtractor::new()))
    }

    /// Limit by a custom client identity.
    pub fn with_key_extractor(limiter: Arc<RateLimiter>, extractor: Arc<dyn KeyExtractor>) -> Self {
        Self {
            shared: Arc::new(Shared {
                limiter,
                extractor,
                exempt_paths: Vec::new(),
            }),
        }
    }

    /// Paths (and everything below them) that bypass the limiter.
    pub fn exempt<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shared = Shared {
            limiter: self.shared.limiter.clone(),
            extractor: self.shared.extractor.clone(),
            exempt_paths: paths.into_iter().map(Into::into).collect(),
        };
        Self {
            shared: Arc::new(shared),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // The ready service must be the one that handles this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        Box::pin(async move {
            if shared.is_exempt(request.uri().path()) {
                return inner.call(request).await;
            }

            let key = shared.extractor.extract(&request);

            match shared.limiter.allow(&key).await {
                Ok(decision) if decision.allowed => {
                    let mut response = inner.call(request).await?;
                    insert_quota_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                Ok(decision) => {
                    debug!(
                        key = %key,
                        path = %request.uri().path(),
                        retry_after_secs = decision.retry_after_secs(),
                        "Rejecting request over its rate limit"
                    );
                    Ok(too_many_requests(Some(&decision), decision.retry_after_secs()))
                }
                Err(err) => match shared.limiter.config().failure_policy() {
                    FailurePolicy::FailOpen => {
                        warn!(
                            key = %key,
                            error = %err,
                            "Rate limit store unavailable, admitting request"
                        );
                        inner.call(request).await
                    }
                    FailurePolicy::FailClosed => {
                        error!(
                            key = %key,
                            error = %err,
                            "Rate limit store unavailable, rejecting request"
                        );
                        let window = shared.limiter.config().window_duration();
                        Ok(too_many_requests(None, whole_secs(window)))
                    }
                },
            }
        })
    }
}

fn whole_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Attach `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
pub fn insert_quota_headers(headers: &mut HeaderMap, decision: &AdmitDecision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_at_secs()));
}

/// The `429` returned for denied requests.
pub fn too_many_requests(decision: Option<&AdmitDecision>, retry_after_secs: u64) -> Response {
    let body = serde_json::json!({ "error": "too many requests" });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();

    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER_HEADER, HeaderValue::from(retry_after_secs));
    if let Some(decision) = decision {
        insert_quota_headers(headers, decision);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, WindgateError};
    use crate::ratelimit::{
        ClientKey, InMemoryStore, LimiterConfig, ManualClock, Window, WindowState, WindowStore,
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct FailingStore;

    #[async_trait]
    impl WindowStore for FailingStore {
        async fn record(&self, _: &str, _: u64, _: &Window) -> Result<WindowState> {
            Err(WindgateError::StoreUnavailable("connection reset".to_string()))
        }

        async fn peek(&self, _: &str, _: u64, _: &Window) -> Result<WindowState> {
            Err(WindgateError::StoreUnavailable("connection reset".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn memory_limiter(max: u64, clock: Arc<ManualClock>) -> Arc<RateLimiter> {
        let config = LimiterConfig::per_seconds(max, 60).unwrap();
        Arc::new(RateLimiter::with_clock(config, Arc::new(InMemoryStore::new()), clock))
    }

    fn app(layer: RateLimitLayer, hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "hello"
                    }
                }),
            )
            .route("/health", get(|| async { "ok" }))
            .layer(layer)
    }

    fn request_from(path: &str, ip: &str) -> Request {
        http::Request::builder()
            .uri(path)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    fn header(response: &Response, name: &str) -> String {
        response.headers()[name].to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_admitted_requests_carry_quota_headers() {
        let clock = Arc::new(ManualClock::starting_at(1_700_000_000_000));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(RateLimitLayer::new(memory_limiter(5, clock)), hits.clone());

        for expected in ["4", "3", "2", "1", "0"] {
            let response = app.clone().oneshot(request_from("/", "1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header(&response, LIMIT_HEADER), "5");
            assert_eq!(header(&response, REMAINING_HEADER), expected);
            assert_eq!(header(&response, RESET_HEADER), "1700000060");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_reset_header_rounds_up_mid_second() {
        let clock = Arc::new(ManualClock::starting_at(1_700_000_000_400));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(RateLimitLayer::new(memory_limiter(1, clock)), hits);

        let response = app.clone().oneshot(request_from("/", "1.2.3.4")).await.unwrap();
        assert_eq!(header(&response, RESET_HEADER), "1700000061");

        let response = app.oneshot(request_from("/", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, RESET_HEADER), "1700000061");
        assert_eq!(header(&response, RETRY_AFTER_HEADER), "60");
    }

    #[tokio::test]
    async fn test_denied_request_short_circuits() {
        let clock = Arc::new(ManualClock::starting_at(1_700_000_000_000));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(RateLimitLayer::new(memory_limiter(2, clock)), hits.clone());

        for _ in 0..2 {
            app.clone().oneshot(request_from("/", "1.2.3.4")).await.unwrap();
        }
        let response = app.clone().oneshot(request_from("/", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = header(&response, RETRY_AFTER_HEADER).parse().unwrap();
        assert!((1..=60).contains(&retry_after));
        assert_eq!(header(&response, REMAINING_HEADER), "0");
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "too many requests" }));
    }

    #[tokio::test]
    async fn test_clients_limited_independently() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(RateLimitLayer::new(memory_limiter(1, clock)), hits);

        let first = app.clone().oneshot(request_from("/", "1.2.3.4")).await.unwrap();
        let second = app.clone().oneshot(request_from("/", "5.6.7.8")).await.unwrap();
        let again = app.clone().oneshot(request_from("/", "1.2.3.4")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_exempt_paths_skip_accounting() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let limiter = memory_limiter(1, clock);
        let layer = RateLimitLayer::new(limiter.clone()).exempt(["/health"]);
        let app = app(layer, Arc::new(AtomicUsize::new(0)));

        for _ in 0..5 {
            let response = app.clone().oneshot(request_from("/health", "1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(LIMIT_HEADER).is_none());
        }

        let peeked = limiter.peek(&ClientKey::ip("1.2.3.4")).await.unwrap();
        assert_eq!(peeked.remaining, 1);
    }

    #[tokio::test]
    async fn test_fail_open_forwards_request() {
        let config = LimiterConfig::per_seconds(5, 60).unwrap();
        let limiter = Arc::new(RateLimiter::new(config, Arc::new(FailingStore)));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(RateLimitLayer::new(limiter), hits.clone());

        let response = app.oneshot(request_from("/", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(LIMIT_HEADER).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_request() {
        let config = LimiterConfig::per_seconds(5, 60)
            .unwrap()
            .with_failure_policy(FailurePolicy::FailClosed);
        let limiter = Arc::new(RateLimiter::new(config, Arc::new(FailingStore)));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(RateLimitLayer::new(limiter), hits.clone());

        let response = app.oneshot(request_from("/", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, RETRY_AFTER_HEADER), "60");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_custom_key_extractor() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let by_tenant = |req: &Request| {
            req.headers()
                .get("x-tenant")
                .and_then(|v| v.to_str().ok())
                .map(|t| format!("tenant:{}", t))
        };
        let layer =
            RateLimitLayer::with_key_extractor(memory_limiter(1, clock), Arc::new(by_tenant));
        let app = app(layer, Arc::new(AtomicUsize::new(0)));

        let tenant = |ip: &str| {
            http::Request::builder()
                .uri("/")
                .header("x-tenant", "acme")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };

        // Different addresses, same tenant: one shared quota.
        let first = app.clone().oneshot(tenant("1.1.1.1")).await.unwrap();
        let second = app.clone().oneshot(tenant("2.2.2.2")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_exempt_matching() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let layer = RateLimitLayer::new(memory_limiter(1, clock)).exempt(["/health", "/static"]);

        assert!(layer.shared.is_exempt("/health"));
        assert!(layer.shared.is_exempt("/static/app.js"));
        assert!(!layer.shared.is_exempt("/healthz"));
        assert!(!layer.shared.is_exempt("/"));
    }

    #[test]
    fn test_whole_secs_rounds_up() {
        assert_eq!(whole_secs(Duration::from_secs(60)), 60);
        assert_eq!(whole_secs(Duration::from_millis(1_500)), 2);
        assert_eq!(whole_secs(Duration::from_millis(1)), 1);
    }
}
