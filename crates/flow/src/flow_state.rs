//! C9 — Flow State Service (§4.9).
//!
//! The KV store is the hot cache; [`FlowStateMirror`] is the collaborator
//! seam onto a persistent store (§6.6) consulted only on `hydrate` (cache
//! miss). Each flow `type` defines an allowed step transition graph — `set`
//! rejects a `step` that isn't reachable from the current one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use kiss_api_types::FlowState;
use kiss_core::kv::{KvError, KvStore};

#[derive(Debug, thiserror::Error)]
pub enum FlowStateError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown flow type: {0}")]
    UnknownFlowType(String),
    #[error("step {from} cannot reach {to} for flow {flow_name}")]
    IllegalStep { flow_name: String, from: String, to: String },
}

#[async_trait]
pub trait FlowStateMirror: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<FlowState>, FlowStateError>;
    async fn save(&self, state: &FlowState) -> Result<(), FlowStateError>;
}

/// No-op mirror: every `hydrate` misses. Suitable for deployments that
/// don't need recovery across a full cache loss.
pub struct NullMirror;

#[async_trait]
impl FlowStateMirror for NullMirror {
    async fn load(&self, _conversation_id: &str) -> Result<Option<FlowState>, FlowStateError> {
        Ok(None)
    }
    async fn save(&self, _state: &FlowState) -> Result<(), FlowStateError> {
        Ok(())
    }
}

/// Allowed step transition graph for one flow `type`: `from step -> [allowed next steps]`.
pub struct FlowGraph {
    pub steps: HashMap<String, Vec<String>>,
}

impl FlowGraph {
    pub fn new(edges: &[(&str, &[&str])]) -> Self {
        let mut steps = HashMap::new();
        for (from, tos) in edges {
            steps.insert(from.to_string(), tos.iter().map(|s| s.to_string()).collect());
        }
        Self { steps }
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        from == to || self.steps.get(from).map(|tos| tos.iter().any(|t| t == to)).unwrap_or(false)
    }
}

pub fn order_create_graph() -> FlowGraph {
    FlowGraph::new(&[
        ("collect_items", &["collect_address"]),
        ("collect_address", &["confirm"]),
        ("confirm", &["payment_pending"]),
        ("payment_pending", &["complete"]),
    ])
}

pub fn order_status_graph() -> FlowGraph {
    FlowGraph::new(&[("collect_order_id", &["report_status"])])
}

pub fn order_modify_graph() -> FlowGraph {
    FlowGraph::new(&[("collect_order_id", &["collect_change"]), ("collect_change", &["confirm"])])
}

pub struct FlowStateService {
    kv: Arc<dyn KvStore>,
    mirror: Arc<dyn FlowStateMirror>,
    ttl: Duration,
    graphs: HashMap<String, FlowGraph>,
}

fn key(conversation_id: &str) -> String {
    format!("flowstate:{conversation_id}")
}

impl FlowStateService {
    pub fn new(kv: Arc<dyn KvStore>, mirror: Arc<dyn FlowStateMirror>) -> Self {
        let mut graphs = HashMap::new();
        graphs.insert("order_create".to_string(), order_create_graph());
        graphs.insert("order_status".to_string(), order_status_graph());
        graphs.insert("order_modify".to_string(), order_modify_graph());
        Self {
            kv,
            mirror,
            ttl: Duration::from_secs(3600),
            graphs,
        }
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Option<FlowState>, FlowStateError> {
        match self.kv.get(&key(conversation_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Rebuilds from the persistent mirror on a cache miss, re-populating
    /// the KV cache if found.
    pub async fn hydrate(&self, conversation_id: &str) -> Result<Option<FlowState>, FlowStateError> {
        if let Some(cached) = self.get(conversation_id).await? {
            return Ok(Some(cached));
        }
        match self.mirror.load(conversation_id).await? {
            Some(state) => {
                self.write_cache(&state).await?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn write_cache(&self, state: &FlowState) -> Result<(), FlowStateError> {
        self.kv.set_with_ttl(&key(&state.conversation_id), &serde_json::to_string(state)?, self.ttl).await?;
        Ok(())
    }

    /// Validates that `new_step` is reachable from the current step of the
    /// flow named `new_state.flow_name`, then persists to cache and mirror.
    pub async fn set(&self, new_state: FlowState) -> Result<FlowState, FlowStateError> {
        let graph = self
            .graphs
            .get(&new_state.flow_name)
            .ok_or_else(|| FlowStateError::UnknownFlowType(new_state.flow_name.clone()))?;

        if let Some(existing) = self.get(&new_state.conversation_id).await? {
            if existing.flow_name == new_state.flow_name && !graph.reachable(&existing.step, &new_state.step) {
                return Err(FlowStateError::IllegalStep {
                    flow_name: new_state.flow_name.clone(),
                    from: existing.step,
                    to: new_state.step,
                });
            }
        }

        let mut state = new_state;
        state.updated_at = Utc::now();
        self.write_cache(&state).await?;
        self.mirror.save(&state).await?;
        Ok(state)
    }

    pub async fn clear(&self, conversation_id: &str) -> Result<(), FlowStateError> {
        self.kv.set_with_ttl(&key(conversation_id), "", Duration::from_secs(0)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiss_core::kv::SqliteKv;

    async fn service() -> FlowStateService {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        FlowStateService::new(kv, Arc::new(NullMirror))
    }

    fn state(conv: &str, flow: &str, step: &str) -> FlowState {
        FlowState {
            conversation_id: conv.to_string(),
            flow_name: flow.to_string(),
            step: step.to_string(),
            data: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let svc = service().await;
        svc.set(state("c1", "order_create", "collect_items")).await.unwrap();
        let got = svc.get("c1").await.unwrap().unwrap();
        assert_eq!(got.step, "collect_items");
    }

    #[tokio::test]
    async fn illegal_step_jump_is_rejected() {
        let svc = service().await;
        svc.set(state("c1", "order_create", "collect_items")).await.unwrap();
        let err = svc.set(state("c1", "order_create", "complete")).await.unwrap_err();
        assert!(matches!(err, FlowStateError::IllegalStep { .. }));
    }

    #[tokio::test]
    async fn legal_step_advance_succeeds() {
        let svc = service().await;
        svc.set(state("c1", "order_create", "collect_items")).await.unwrap();
        svc.set(state("c1", "order_create", "collect_address")).await.unwrap();
        let got = svc.get("c1").await.unwrap().unwrap();
        assert_eq!(got.step, "collect_address");
    }

    #[tokio::test]
    async fn clear_removes_state() {
        let svc = service().await;
        svc.set(state("c1", "order_create", "collect_items")).await.unwrap();
        svc.clear("c1").await.unwrap();
        assert!(svc.get("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hydrate_pulls_from_mirror_on_miss() {
        struct OneShotMirror;
        #[async_trait::async_trait]
        impl FlowStateMirror for OneShotMirror {
            async fn load(&self, conversation_id: &str) -> Result<Option<FlowState>, FlowStateError> {
                Ok(Some(state(conversation_id, "order_status", "collect_order_id")))
            }
            async fn save(&self, _state: &FlowState) -> Result<(), FlowStateError> {
                Ok(())
            }
        }
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let svc = FlowStateService::new(kv, Arc::new(OneShotMirror));
        let hydrated = svc.hydrate("c1").await.unwrap().unwrap();
        assert_eq!(hydrated.flow_name, "order_status");
        assert!(svc.get("c1").await.unwrap().is_some());
    }
}
