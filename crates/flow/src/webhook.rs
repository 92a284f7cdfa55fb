//! §6.3 Inbound webhook endpoints.
//!
//! Handlers are short and non-blocking: dedupe, enqueue, return. All the
//! actual message handling happens in a worker pulling off the queue — the
//! webhook response must return within seconds regardless of downstream
//! load (§7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;

use kiss_api_types::InboundEvent;
use kiss_collaborators::payments::PaymentProvider;
use kiss_core::dedup::Deduplicator;
use kiss_queue::{AddOptions, JobQueue};

use crate::blocklist::Blocklist;
use crate::event_bus::EventBus;
use crate::events::FlowEvent;

pub const MESSAGING_QUEUE: &str = "messaging";
const DEDUPE_TTL: Duration = Duration::from_secs(300);

pub struct WebhookState {
    pub dedup: Deduplicator,
    pub queue: Arc<JobQueue>,
    pub blocklist: Arc<Blocklist>,
    pub payment_providers: HashMap<String, Arc<dyn PaymentProvider>>,
    pub events: EventBus,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook/messaging", post(messaging_webhook))
        .route("/payments/webhook/{provider}", post(payments_webhook))
        .route("/webhooks/{channel}", post(channel_webhook).get(channel_challenge))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct MessagingWebhookBody {
    idempotency_key: String,
    conversation_id: String,
    channel: String,
    sender: String,
    #[serde(default)]
    body: serde_json::Value,
}

async fn messaging_webhook(
    State(state): State<Arc<WebhookState>>,
    Json(payload): Json<MessagingWebhookBody>,
) -> impl IntoResponse {
    if state.blocklist.is_blocked(&payload.sender).await.unwrap_or(false) {
        return (StatusCode::OK, Json(serde_json::json!({"ok": true, "reason": "blocklisted"})));
    }

    let seen = match state.dedup.seen(&payload.idempotency_key, DEDUPE_TTL).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "dedup check failed");
            return (
                StatusCode::OK,
                Json(serde_json::json!({"ok": true, "reason": "dedup_unavailable"})),
            );
        }
    };

    if seen.was_seen {
        return (StatusCode::OK, Json(serde_json::json!({"ok": true, "reason": "duplicate"})));
    }

    let event = InboundEvent {
        idempotency_key: payload.idempotency_key,
        conversation_id: payload.conversation_id.clone(),
        channel: payload.channel,
        sender: payload.sender,
        body: payload.body,
        received_at: Utc::now(),
    };

    let mut job_data = serde_json::to_value(&event).unwrap();
    job_data["lock_key"] = serde_json::Value::String(format!("conversation:{}", event.conversation_id));

    match state
        .queue
        .add(MESSAGING_QUEUE, "inbound", job_data, AddOptions {
            job_id: Some(event.idempotency_key.clone()),
            ..Default::default()
        })
        .await
    {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))),
        Err(e) => {
            tracing::error!(error = %e, "failed to enqueue inbound message");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"ok": false, "error": "enqueue_failed"})),
            )
        }
    }
}

async fn payments_webhook(
    State(state): State<Arc<WebhookState>>,
    Path(provider): Path<String>,
    headers: axum::http::HeaderMap,
    raw_body: Bytes,
) -> impl IntoResponse {
    let Some(ph) = state.payment_providers.get(&provider) else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"ok": false, "error": "unknown_provider"})));
    };

    let Some(signature) = headers.get("x-signature").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false, "error": "missing_signature"})));
    };

    match ph.verify_webhook_signature(&raw_body, signature, ph.webhook_secret()) {
        Ok(event) => {
            state.events.publish(FlowEvent::OutboundDeferred {
                recipient: event.external_id.clone(),
                reason: format!("payment_status:{:?}", event.status),
            });
            (StatusCode::OK, Json(serde_json::json!({"ok": true})))
        }
        Err(_) => (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false, "error": "invalid_signature"}))),
    }
}

#[derive(Debug, Deserialize)]
struct ChallengeQuery {
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn channel_challenge(Path(_channel): Path<String>, Query(q): Query<ChallengeQuery>) -> impl IntoResponse {
    match q.challenge {
        Some(c) => (StatusCode::OK, c),
        None => (StatusCode::OK, String::new()),
    }
}

async fn channel_webhook(
    State(state): State<Arc<WebhookState>>,
    Path(channel): Path<String>,
    Json(payload): Json<MessagingWebhookBody>,
) -> impl IntoResponse {
    let mut payload = payload;
    payload.channel = channel;
    messaging_webhook(State(state), Json(payload)).await.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiss_core::kv::{KvStore, SqliteKv};
    use tower::ServiceExt;

    async fn state() -> Arc<WebhookState> {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        Arc::new(WebhookState {
            dedup: Deduplicator::new(kv.clone()),
            queue: Arc::new(JobQueue::new(kv.clone())),
            blocklist: Arc::new(Blocklist::new(kv, vec![])),
            payment_providers: HashMap::new(),
            events: EventBus::new(),
        })
    }

    #[tokio::test]
    async fn messaging_webhook_enqueues_once_for_duplicate_key() {
        let st = state().await;
        let app = router(st.clone());
        let body = serde_json::json!({
            "idempotency_key": "X",
            "conversation_id": "c1",
            "channel": "sms",
            "sender": "+1555",
            "body": {"text": "hi"},
        });

        for _ in 0..2 {
            let req = axum::http::Request::builder()
                .method("POST")
                .uri("/webhook/messaging")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string()))
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let stats = st.queue.stats(MESSAGING_QUEUE).await.unwrap();
        assert_eq!(stats.waiting + stats.active, 1);
    }

    #[tokio::test]
    async fn channel_challenge_echoes_token() {
        let st = state().await;
        let app = router(st);
        let req = axum::http::Request::builder()
            .method("GET")
            .uri("/webhooks/whatsapp?hub.challenge=abc123")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abc123");
    }
}
