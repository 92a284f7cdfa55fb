//! HTTP-layer rate limiting, three tiers deep: global, per-client-IP,
//! per-endpoint. Built directly on [`kiss_core::ratelimit::RateLimiter`] (C3),
//! so limits share the same KV-backed counters as the rest of the system
//! instead of keeping their own process-local state.
//!
//! Client IP is read from `X-Forwarded-For` (first entry) then `X-Real-IP`,
//! falling back to `"unknown"`. Each tier has its own key namespace, limit,
//! and window; all three must pass for a request through.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use tower::{Layer, Service};
use tracing::warn;

use kiss_core::ratelimit::RateLimiter;

#[derive(Debug, Clone, Copy)]
pub struct Tier {
    pub limit: i64,
    pub window: Duration,
}

impl Tier {
    pub const fn per_second(n: i64) -> Self {
        Self { limit: n, window: Duration::from_secs(1) }
    }
    pub const fn per_minute(n: i64) -> Self {
        Self { limit: n, window: Duration::from_secs(60) }
    }
    pub const fn per_hour(n: i64) -> Self {
        Self { limit: n, window: Duration::from_secs(3600) }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    global: Tier,
    per_ip: Tier,
    per_endpoint: Tier,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>, global: Tier, per_ip: Tier, per_endpoint: Tier) -> Self {
        Self { limiter, global, per_ip, per_endpoint }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
            global: self.global,
            per_ip: self.per_ip,
            per_endpoint: self.per_endpoint,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    global: Tier,
    per_ip: Tier,
    per_endpoint: Tier,
}

fn client_ip(req: &Request<Body>) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()).map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let (global, per_ip, per_endpoint) = (self.global, self.per_ip, self.per_endpoint);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let ip = client_ip(&req);
            let endpoint = req.uri().path().to_string();

            let checks = [
                ("global", "http:global".to_string(), global),
                ("per_ip", format!("http:ip:{ip}"), per_ip),
                ("per_endpoint", format!("http:endpoint:{endpoint}"), per_endpoint),
            ];

            for (tier_name, key, tier) in checks {
                match limiter.check(&key, tier.limit, tier.window).await {
                    Ok(decision) if decision.allowed => continue,
                    Ok(_) => {
                        warn!(tier = tier_name, %ip, %endpoint, "rate limit exceeded");
                        let retry_after = tier.window.as_secs().max(1);
                        let resp = (
                            StatusCode::TOO_MANY_REQUESTS,
                            [("Retry-After", retry_after.to_string())],
                            axum::Json(serde_json::json!({
                                "ok": false,
                                "error": "rate_limit_exceeded",
                                "message": format!("{tier_name} rate limit exceeded"),
                                "retry_after": retry_after,
                            })),
                        )
                            .into_response();
                        return Ok(resp);
                    }
                    Err(e) => {
                        warn!(tier = tier_name, error = %e, "rate limiter unavailable, failing open");
                    }
                }
            }

            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use kiss_core::kv::{KvStore, SqliteKv};
    use tower::ServiceExt;

    async fn test_router(global: Tier, per_ip: Tier, per_endpoint: Tier) -> Router {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let limiter = Arc::new(RateLimiter::new(kv));
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .route("/health", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(limiter, global, per_ip, per_endpoint))
    }

    #[tokio::test]
    async fn allows_requests_within_limit() {
        let app = test_router(Tier::per_second(100), Tier::per_second(10), Tier::per_second(5)).await;
        for _ in 0..2 {
            let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn rejects_requests_exceeding_limit() {
        let app = test_router(Tier::per_second(100), Tier::per_second(100), Tier::per_second(2)).await;
        for _ in 0..2 {
            let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn different_endpoints_have_separate_limits() {
        let app = test_router(Tier::per_second(100), Tier::per_second(100), Tier::per_second(1)).await;
        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
