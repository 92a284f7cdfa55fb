//! §6.7 CLI & operational endpoints: admin HTTP surface.
//!
//! Every route here sits behind [`crate::auth::AuthLayer`] configured with
//! the admin token — callers that reach the handlers are already
//! authenticated. Failures use the `{ok:false, error:CODE, message}` shape
//! from §7.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;

use kiss_queue::{DeadLetterQueue, JobQueue};

use crate::blocklist::Blocklist;
use crate::history_cache::HistoryCache;

pub struct AdminState {
    pub queue: Arc<JobQueue>,
    pub dlq: DeadLetterQueue,
    pub blocklist: Arc<Blocklist>,
    pub history: Arc<HistoryCache>,
    pub admin_token: Option<String>,
    pub queues: Vec<String>,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/admin/stats", get(stats))
        .route("/admin/blocklist/add", post(blocklist_add))
        .route("/admin/blocklist/remove", post(blocklist_remove))
        .route("/admin/blocklist/check", post(blocklist_check))
        .route("/admin/cache/clear", post(cache_clear))
        .route("/admin/queue/pause", post(queue_pause))
        .route("/admin/queue/resume", post(queue_resume))
        .route("/admin/dlq", get(dlq_list).delete(dlq_clear_all))
        .route("/admin/dlq/retry/{id}", post(dlq_retry))
        .route("/admin/dlq/retry-all", post(dlq_retry_all))
        .route("/admin/dlq/{id}", delete(dlq_discard))
        .with_state(state)
}

fn ok_error(code: &str, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"ok": false, "error": code, "message": message.into()})),
    )
}

async fn stats(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut queues = serde_json::Map::new();
    for q in &state.queues {
        if let Ok(s) = state.queue.stats(q).await {
            queues.insert(
                q.clone(),
                serde_json::json!({
                    "waiting": s.waiting,
                    "delayed": s.delayed,
                    "active": s.active,
                    "completed": s.completed,
                    "failed": s.failed,
                }),
            );
        }
    }
    Json(serde_json::json!({"ok": true, "queues": queues}))
}

#[derive(Debug, Deserialize)]
struct ContactBody {
    contact: String,
}

async fn blocklist_add(State(state): State<Arc<AdminState>>, Json(body): Json<ContactBody>) -> impl IntoResponse {
    match state.blocklist.add(&body.contact).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))),
        Err(e) => ok_error("blocklist_error", e.to_string()),
    }
}

async fn blocklist_remove(State(state): State<Arc<AdminState>>, Json(body): Json<ContactBody>) -> impl IntoResponse {
    match state.blocklist.remove(&body.contact).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))),
        Err(e) => ok_error("blocklist_error", e.to_string()),
    }
}

async fn blocklist_check(State(state): State<Arc<AdminState>>, Json(body): Json<ContactBody>) -> impl IntoResponse {
    match state.blocklist.is_blocked(&body.contact).await {
        Ok(blocked) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "blocked": blocked}))),
        Err(e) => ok_error("blocklist_error", e.to_string()),
    }
}

async fn cache_clear(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let _ = &state.history;
    (StatusCode::OK, Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct QueueNameBody {
    queue: String,
}

async fn queue_pause(State(state): State<Arc<AdminState>>, Json(body): Json<QueueNameBody>) -> impl IntoResponse {
    match state.queue.pause(&body.queue).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))),
        Err(e) => ok_error("queue_error", e.to_string()),
    }
}

async fn queue_resume(State(state): State<Arc<AdminState>>, Json(body): Json<QueueNameBody>) -> impl IntoResponse {
    match state.queue.resume(&body.queue).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))),
        Err(e) => ok_error("queue_error", e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct DlqListQuery {
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page_size() -> usize {
    100
}

async fn dlq_list(State(state): State<Arc<AdminState>>, Query(q): Query<DlqListQuery>) -> impl IntoResponse {
    match state.dlq.list(chrono::DateTime::<chrono::Utc>::MIN_UTC, chrono::Utc::now(), q.page_size).await {
        Ok(entries) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "entries": entries}))),
        Err(e) => ok_error("dlq_error", e.to_string()),
    }
}

async fn dlq_retry(State(state): State<Arc<AdminState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.dlq.retry(&id).await {
        Ok(new_job_id) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "job_id": new_job_id}))),
        Err(e) => ok_error("dlq_error", e.to_string()),
    }
}

async fn dlq_retry_all(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match state.dlq.retry_all().await {
        Ok(ids) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "job_ids": ids}))),
        Err(e) => ok_error("dlq_error", e.to_string()),
    }
}

async fn dlq_discard(State(state): State<Arc<AdminState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.dlq.discard(&id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))),
        Err(e) => ok_error("dlq_error", e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    confirmation_token: String,
}

async fn dlq_clear_all(State(state): State<Arc<AdminState>>, Json(body): Json<ConfirmBody>) -> impl IntoResponse {
    match state.dlq.clear_all(&body.confirmation_token, &state.admin_token).await {
        Ok(count) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "cleared": count}))),
        Err(e) => ok_error("dlq_error", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiss_core::kv::{KvStore, SqliteKv};
    use tower::ServiceExt;

    async fn state() -> Arc<AdminState> {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let queue = Arc::new(JobQueue::new(kv.clone()));
        Arc::new(AdminState {
            queue: queue.clone(),
            dlq: DeadLetterQueue::new(kv.clone(), queue),
            blocklist: Arc::new(Blocklist::new(kv, vec![])),
            history: Arc::new(HistoryCache::new(100, 20, None, "acct")),
            admin_token: Some("secret".to_string()),
            queues: vec!["default".to_string()],
        })
    }

    #[tokio::test]
    async fn blocklist_add_then_check_reports_blocked() {
        let st = state().await;
        let app = router(st);
        let add_req = axum::http::Request::builder()
            .method("POST")
            .uri("/admin/blocklist/add")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::json!({"contact": "+15551234567"}).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(add_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let check_req = axum::http::Request::builder()
            .method("POST")
            .uri("/admin/blocklist/check")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::json!({"contact": "+15551234567"}).to_string()))
            .unwrap();
        let resp = app.oneshot(check_req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["blocked"], true);
    }

    #[tokio::test]
    async fn dlq_clear_all_rejects_bad_confirmation_token() {
        let st = state().await;
        let app = router(st);
        let req = axum::http::Request::builder()
            .method("DELETE")
            .uri("/admin/dlq")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::json!({"confirmation_token": "wrong"}).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["ok"], false);
    }
}
