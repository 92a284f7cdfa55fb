//! HTTP surface for the intelligence tier: manual detector triggers, case
//! inspection/transition, and the action governance pipeline (§4.11-§4.14).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use kiss_api_types::CaseEvent;
use kiss_cases::action_bus::ActionBus;
use kiss_cases::state_machine::CaseStateMachine;
use kiss_detect::DetectorScheduler;
use kiss_flow::events::FlowEvent;

use crate::stores::KvCaseStore;

pub struct IntelligenceState {
    pub scheduler: Arc<DetectorScheduler>,
    pub actions: Arc<ActionBus>,
    pub cases: Arc<KvCaseStore>,
    pub events: kiss_flow::event_bus::EventBus,
}

pub fn router(state: Arc<IntelligenceState>) -> Router {
    Router::new()
        .route("/detectors/{id}/trigger", post(trigger_detector))
        .route("/cases/{id}", get(get_case))
        .route("/cases/{id}/transition", post(transition_case))
        .route("/actions/propose", post(propose_action))
        .route("/actions/{id}/confirm", post(confirm_action))
        .route("/actions/{id}/approve", post(approve_action))
        .route("/actions/{id}/reject", post(reject_action))
        .route("/actions/{id}/verify2fa", post(verify2fa_action))
        .with_state(state)
}

fn err(code: &str, message: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({"ok": false, "error": code, "message": message.to_string()})))
}

#[derive(Debug, Deserialize)]
struct TriggerBody {
    #[serde(default)]
    scope: serde_json::Value,
}

async fn trigger_detector(
    State(state): State<Arc<IntelligenceState>>,
    Path(detector_id): Path<String>,
    Json(body): Json<TriggerBody>,
) -> impl IntoResponse {
    match state.scheduler.trigger(&detector_id, body.scope).await {
        Ok(job_id) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "job_id": job_id}))).into_response(),
        Err(e) => err("scheduler_error", e).into_response(),
    }
}

async fn get_case(State(state): State<Arc<IntelligenceState>>, Path(case_id): Path<String>) -> impl IntoResponse {
    match state.cases.get(&case_id).await {
        Ok(Some(case)) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "case": case}))).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(serde_json::json!({"ok": false, "error": "not_found"}))).into_response(),
        Err(e) => err("store_error", e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TransitionBody {
    event: CaseEvent,
    actor: String,
    #[serde(default)]
    context: serde_json::Value,
}

async fn transition_case(
    State(state): State<Arc<IntelligenceState>>,
    Path(case_id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> impl IntoResponse {
    let Ok(Some(mut case)) = state.cases.get(&case_id).await else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"ok": false, "error": "not_found"}))).into_response();
    };

    let mut machine = CaseStateMachine::from_state(case_id.clone(), case.state, vec![]);
    match machine.transition(body.event, body.actor.clone(), body.context) {
        Ok(new_state) => {
            let from = case.state;
            case.state = new_state;
            case.updated_at = chrono::Utc::now();
            if let Err(e) = kiss_detect::CaseStore::save(&*state.cases, &case).await {
                return err("store_error", e).into_response();
            }
            state.events.publish(FlowEvent::CaseTransitioned { case_id, from, to: new_state });
            (StatusCode::OK, Json(serde_json::json!({"ok": true, "state": new_state}))).into_response()
        }
        Err(e) => err("invalid_transition", e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ProposeBody {
    action_type: String,
    case_id: Option<String>,
    payload: serde_json::Value,
    requested_by: String,
    idempotency_key: Option<String>,
}

async fn propose_action(State(state): State<Arc<IntelligenceState>>, Json(body): Json<ProposeBody>) -> impl IntoResponse {
    match state
        .actions
        .propose(&body.action_type, body.case_id, body.payload, &body.requested_by, body.idempotency_key.as_deref())
        .await
    {
        Ok(action) => {
            state.events.publish(FlowEvent::ActionAwaitingApproval {
                action_id: action.action_id.clone(),
                action_type: action.action_type.clone(),
            });
            (StatusCode::OK, Json(serde_json::json!({"ok": true, "action": action}))).into_response()
        }
        Err(e) => err("action_bus_error", e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ActorBody {
    actor: String,
}

async fn confirm_action(State(state): State<Arc<IntelligenceState>>, Path(id): Path<String>, Json(body): Json<ActorBody>) -> impl IntoResponse {
    let result = state.actions.confirm(&id, &body.actor).await;
    respond_action(state, result)
}

async fn approve_action(State(state): State<Arc<IntelligenceState>>, Path(id): Path<String>, Json(body): Json<ActorBody>) -> impl IntoResponse {
    let result = state.actions.approve(&id, &body.actor).await;
    respond_action(state, result)
}

#[derive(Debug, Deserialize)]
struct RejectBody {
    actor: String,
    reason: String,
}

async fn reject_action(State(state): State<Arc<IntelligenceState>>, Path(id): Path<String>, Json(body): Json<RejectBody>) -> impl IntoResponse {
    let result = state.actions.reject(&id, &body.actor, &body.reason).await;
    respond_action(state, result)
}

#[derive(Debug, Deserialize)]
struct Verify2faBody {
    actor: String,
    code: String,
}

async fn verify2fa_action(State(state): State<Arc<IntelligenceState>>, Path(id): Path<String>, Json(body): Json<Verify2faBody>) -> impl IntoResponse {
    let result = state.actions.verify2fa_and_approve(&id, &body.actor, &body.code).await;
    respond_action(state, result)
}

fn respond_action(
    state: Arc<IntelligenceState>,
    result: Result<kiss_api_types::Action, kiss_cases::action_bus::ActionBusError>,
) -> axum::response::Response {
    match result {
        Ok(action) => {
            if action.state == kiss_api_types::ActionState::Executed {
                state.events.publish(FlowEvent::ActionExecuted {
                    action_id: action.action_id.clone(),
                    action_type: action.action_type.clone(),
                });
            }
            (StatusCode::OK, Json(serde_json::json!({"ok": true, "action": action}))).into_response()
        }
        Err(e) => err("action_bus_error", e).into_response(),
    }
}
