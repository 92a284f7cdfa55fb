//! Messaging flow layer: inbound webhooks, routing, conversation state, and
//! the admin/operational HTTP surface.
//!
//! Key modules:
//! - [`webhook`] — inbound messaging and payment webhooks (§6.3)
//! - [`dispatcher`] — routes an inbound event to a handling track (§4.8)
//! - [`flow_state`] — per-conversation multi-turn flow state (§4.9)
//! - [`history_cache`] — bounded LRU of recent conversation history (§4.10)
//! - [`blocklist`] — opt-out/do-not-contact enforcement (§6.4)
//! - [`admin`] — operational endpoints: DLQ, queue pause, blocklist (§6.7)
//! - [`auth`] — API key authentication middleware
//! - [`event_bus`] / [`events`] — internal pub/sub for system signals
//! - [`rate_limit_middleware`] — HTTP-layer rate limiting
//! - [`notifications`] — operator-facing notification feed

pub mod admin;
pub mod api_error;
pub mod auth;
pub mod blocklist;
pub mod dispatcher;
pub mod event_bus;
pub mod events;
pub mod flow_state;
pub mod history_cache;
pub mod notifications;
pub mod rate_limit_middleware;
pub mod webhook;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::Request,
    middleware::{self as axum_middleware, Next},
    response::Response,
    Router,
};

use kiss_telemetry::middleware::metrics_middleware;
use kiss_telemetry::tracing_setup::request_id_middleware;

use crate::admin::AdminState;
use crate::auth::AuthLayer;
use crate::rate_limit_middleware::RateLimitLayer;
use crate::webhook::WebhookState;

/// Baseline security headers for every response. Webhook callers are
/// external services, not browsers, but the admin surface is operated from
/// a browser-based dashboard in some deployments, so both routers carry it.
async fn security_headers_middleware(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", axum::http::HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", axum::http::HeaderValue::from_static("DENY"));
    headers.insert(
        "Strict-Transport-Security",
        axum::http::HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert("Referrer-Policy", axum::http::HeaderValue::from_static("strict-origin-when-cross-origin"));
    response
}

/// Assembles the full HTTP surface: public webhooks (rate-limited, no auth)
/// plus the admin API (auth-gated, not rate-limited beyond the global tier).
pub fn app(
    webhook_state: Arc<WebhookState>,
    admin_state: Arc<AdminState>,
    rate_limit: RateLimitLayer,
    admin_api_key: Option<String>,
) -> Router {
    let public = webhook::router(webhook_state).layer(rate_limit);
    let admin = admin::router(admin_state).layer(AuthLayer::new(admin_api_key));
    Router::new()
        .merge(public)
        .merge(admin)
        .layer(axum_middleware::from_fn(security_headers_middleware))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(axum_middleware::from_fn(metrics_middleware))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiss_core::dedup::Deduplicator;
    use kiss_core::kv::{KvStore, SqliteKv};
    use kiss_core::ratelimit::RateLimiter;
    use kiss_queue::{DeadLetterQueue, JobQueue};
    use tower::ServiceExt;

    use crate::rate_limit_middleware::Tier;
    use crate::webhook::WebhookState;

    async fn test_app() -> Router {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let queue = Arc::new(JobQueue::new(kv.clone()));
        let blocklist = Arc::new(crate::blocklist::Blocklist::new(kv.clone(), vec![]));
        let webhook_state = Arc::new(WebhookState {
            dedup: Deduplicator::new(kv.clone()),
            queue: queue.clone(),
            blocklist: blocklist.clone(),
            payment_providers: Default::default(),
            events: crate::event_bus::EventBus::new(),
        });
        let admin_state = Arc::new(AdminState {
            queue: queue.clone(),
            dlq: DeadLetterQueue::new(kv.clone(), queue),
            blocklist,
            history: Arc::new(crate::history_cache::HistoryCache::new(100, 20, None, "acct")),
            admin_token: None,
            queues: vec!["default".to_string()],
        });
        let rate_limit = RateLimitLayer::new(
            Arc::new(RateLimiter::new(kv)),
            Tier::per_second(200),
            Tier::per_second(20),
            Tier::per_second(50),
        );
        app(webhook_state, admin_state, rate_limit, None)
    }

    #[tokio::test]
    async fn responses_carry_baseline_security_headers() {
        let app = test_app().await;
        let req = axum::http::Request::builder()
            .method("GET")
            .uri("/admin/stats")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.headers().get("X-Content-Type-Options").unwrap(), "nosniff");
        assert_eq!(resp.headers().get("X-Frame-Options").unwrap(), "DENY");
        assert!(resp.headers().contains_key("Strict-Transport-Security"));
    }

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let app = test_app().await;
        let req = axum::http::Request::builder()
            .method("GET")
            .uri("/admin/stats")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key("x-request-id"));
    }
}
