//! C14 — Action Bus.
//!
//! `propose` → autonomy-gated decision → (maybe) execute, content-addressed
//! so a retried proposal for the same `(action_type, payload, requested_by,
//! idempotency_key)` never creates a second record. Execution itself is
//! wrapped in a second idempotency check keyed by an `execution_fingerprint`,
//! so a retried execution of an already-resolved action short-circuits to
//! the stored result instead of re-invoking the handler.
//!
//! Shaped after [`crate::approval::ToolApprovalSystem`]'s
//! policy-table-plus-pending-request structure, generalized from a single
//! binary approve/deny decision to the four-level autonomy gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use kiss_api_types::{Action, ActionState, AutonomyLevel};
use kiss_core::kv::{KvError, KvStore};
use kiss_core::ratelimit::RateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum ActionBusError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
    #[error("unknown action type: {0}")]
    UnknownActionType(String),
    #[error("action not found: {0}")]
    NotFound(String),
    #[error("action {0} is in a terminal state and cannot be mutated")]
    Terminal(String),
    #[error("action {0} is not awaiting approval")]
    NotAwaitingApproval(String),
    #[error("invalid two-factor code for action {0}")]
    InvalidTwoFactorCode(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// Static configuration for one `action_type`: which autonomy gate applies,
/// which executor handles it, and its per-type rate caps (enforced via C3).
#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub action_type: String,
    pub autonomy_level: AutonomyLevel,
    pub handler: String,
    pub max_per_hour: Option<i64>,
    pub max_per_day: Option<i64>,
    pub ttl: Duration,
}

/// Implemented by whatever owns the side effect behind an action's
/// `handler` dispatch key (CRM update, payment refund, outbound message...).
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> Result<serde_json::Value, String>;
}

/// Verifies a 2FA code for `CRITICAL`-autonomy actions. Left pluggable: the
/// production verifier checks a TOTP or SMS code against an external
/// provider; tests use a fixed-code stub.
pub trait TwoFactorVerifier: Send + Sync {
    fn verify(&self, actor: &str, code: &str) -> bool;
}

pub struct ExecutionPlan {
    pub handler: String,
    pub payload: serde_json::Value,
    pub would_effects: Vec<String>,
}

pub struct ActionBus {
    kv: Arc<dyn KvStore>,
    rate_limiter: RateLimiter,
    configs: HashMap<String, ActionConfig>,
    executors: HashMap<String, Arc<dyn ActionExecutor>>,
    two_factor: Arc<dyn TwoFactorVerifier>,
}

fn canonical(payload: &serde_json::Value) -> String {
    // serde_json's default (non-`preserve_order`) map is BTreeMap-backed, so
    // object keys serialize in sorted order — this is already canonical.
    serde_json::to_string(payload).unwrap_or_default()
}

fn hash_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(p.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

impl ActionBus {
    pub fn new(kv: Arc<dyn KvStore>, two_factor: Arc<dyn TwoFactorVerifier>) -> Self {
        Self {
            rate_limiter: RateLimiter::new(kv.clone()),
            kv,
            configs: HashMap::new(),
            executors: HashMap::new(),
            two_factor,
        }
    }

    pub fn register_type(&mut self, config: ActionConfig) {
        self.configs.insert(config.action_type.clone(), config);
    }

    pub fn register_executor(&mut self, handler: impl Into<String>, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(handler.into(), executor);
    }

    fn key(action_id: &str) -> String {
        format!("action:{action_id}")
    }

    async fn load(&self, action_id: &str) -> Result<Action, ActionBusError> {
        let text = self
            .kv
            .get(&Self::key(action_id))
            .await?
            .ok_or_else(|| ActionBusError::NotFound(action_id.to_string()))?;
        serde_json::from_str(&text).map_err(|e| ActionBusError::Serde(e.to_string()))
    }

    async fn persist(&self, action: &Action) -> Result<(), ActionBusError> {
        let text = serde_json::to_string(action).map_err(|e| ActionBusError::Serde(e.to_string()))?;
        self.kv
            .set_with_ttl(&Self::key(&action.action_id), &text, Duration::from_secs(90 * 24 * 3600))
            .await?;
        Ok(())
    }

    /// `propose(action) → decision`. Content-addressed by
    /// `(action_type, canonical(payload), requested_by, idempotency_key)` —
    /// a retried proposal returns the existing record rather than creating a
    /// duplicate.
    pub async fn propose(
        &self,
        action_type: &str,
        case_id: Option<String>,
        payload: serde_json::Value,
        requested_by: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Action, ActionBusError> {
        let config = self
            .configs
            .get(action_type)
            .ok_or_else(|| ActionBusError::UnknownActionType(action_type.to_string()))?;

        let action_id = hash_hex(&[action_type, &canonical(&payload), requested_by, idempotency_key.unwrap_or("")]);

        if let Some(existing) = self.kv.get(&Self::key(&action_id)).await? {
            return serde_json::from_str(&existing).map_err(|e| ActionBusError::Serde(e.to_string()));
        }

        let mut action = Action {
            action_id: action_id.clone(),
            case_id,
            action_type: action_type.to_string(),
            payload,
            autonomy_level: config.autonomy_level,
            state: ActionState::Pending,
            requested_by: requested_by.to_string(),
            approved_by: None,
            executed_at: None,
            result: None,
            expires_at: Some(Utc::now() + chrono::Duration::from_std(config.ttl).unwrap_or(chrono::Duration::hours(24))),
        };

        let created = self
            .kv
            .set_if_absent(&Self::key(&action_id), &serde_json::to_string(&action).unwrap(), Duration::from_secs(90 * 24 * 3600))
            .await?;
        if !created {
            // Lost the race to a concurrent identical proposal.
            return self.load(&action_id).await;
        }

        if config.autonomy_level == AutonomyLevel::Auto {
            if self.within_caps(config).await? {
                self.execute_and_record(&mut action, config).await?;
            } else {
                tracing::warn!(action_type, "AUTO action deferred: rate cap exceeded");
            }
        }

        Ok(action)
    }

    async fn within_caps(&self, config: &ActionConfig) -> Result<bool, ActionBusError> {
        if let Some(max) = config.max_per_hour {
            let d = self
                .rate_limiter
                .check(&format!("action:{}:hour", config.action_type), max, Duration::from_secs(3600))
                .await?;
            if !d.allowed {
                return Ok(false);
            }
        }
        if let Some(max) = config.max_per_day {
            let d = self
                .rate_limiter
                .check(&format!("action:{}:day", config.action_type), max, Duration::from_secs(86400))
                .await?;
            if !d.allowed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// `confirm(action_id, actor)`: flips a `DRAFT` action from `PENDING` to
    /// `APPROVED` and executes it.
    pub async fn confirm(&self, action_id: &str, actor: &str) -> Result<Action, ActionBusError> {
        let mut action = self.load(action_id).await?;
        if action.state.is_terminal() {
            return Err(ActionBusError::Terminal(action_id.to_string()));
        }
        if action.autonomy_level != AutonomyLevel::Draft || action.state != ActionState::Pending {
            return Err(ActionBusError::NotAwaitingApproval(action_id.to_string()));
        }
        action.approved_by = Some(actor.to_string());
        action.state = ActionState::Approved;
        self.persist(&action).await?;
        let config = self.configs.get(&action.action_type).cloned();
        if let Some(config) = config {
            self.execute_and_record(&mut action, &config).await?;
        }
        Ok(action)
    }

    /// `approve(action_id, actor)`: valid only for `APPROVAL`-autonomy
    /// actions. Calling this on a `CRITICAL` action is a safe no-op — it
    /// stays `PENDING` until `verify2FAAndApprove` succeeds.
    pub async fn approve(&self, action_id: &str, actor: &str) -> Result<Action, ActionBusError> {
        let mut action = self.load(action_id).await?;
        if action.state.is_terminal() {
            return Err(ActionBusError::Terminal(action_id.to_string()));
        }
        if action.autonomy_level == AutonomyLevel::Critical {
            tracing::warn!(action_id, "approve() called on a CRITICAL action without 2FA, ignoring");
            return Ok(action);
        }
        if action.autonomy_level != AutonomyLevel::Approval || action.state != ActionState::Pending {
            return Err(ActionBusError::NotAwaitingApproval(action_id.to_string()));
        }
        action.approved_by = Some(actor.to_string());
        action.state = ActionState::Approved;
        self.persist(&action).await?;
        let config = self.configs.get(&action.action_type).cloned();
        if let Some(config) = config {
            self.execute_and_record(&mut action, &config).await?;
        }
        Ok(action)
    }

    /// `reject(action_id, actor, reason)`: terminal for any non-terminal
    /// pending action regardless of autonomy level.
    pub async fn reject(&self, action_id: &str, actor: &str, reason: &str) -> Result<Action, ActionBusError> {
        let mut action = self.load(action_id).await?;
        if action.state.is_terminal() {
            return Err(ActionBusError::Terminal(action_id.to_string()));
        }
        action.approved_by = Some(actor.to_string());
        action.state = ActionState::Rejected;
        action.result = Some(serde_json::json!({"reason": reason}));
        self.persist(&action).await?;
        Ok(action)
    }

    /// `verify2FAAndApprove(action_id, actor, code)`: the only path that can
    /// move a `CRITICAL` action out of `PENDING`. Idempotent — a repeat call
    /// against an already-resolved action is a no-op returning the prior
    /// result (S6).
    pub async fn verify2fa_and_approve(&self, action_id: &str, actor: &str, code: &str) -> Result<Action, ActionBusError> {
        let mut action = self.load(action_id).await?;
        if action.state != ActionState::Pending {
            return Ok(action);
        }
        if action.autonomy_level != AutonomyLevel::Critical {
            return Err(ActionBusError::NotAwaitingApproval(action_id.to_string()));
        }
        if !self.two_factor.verify(actor, code) {
            return Err(ActionBusError::InvalidTwoFactorCode(action_id.to_string()));
        }
        action.approved_by = Some(actor.to_string());
        action.state = ActionState::Approved;
        self.persist(&action).await?;
        let config = self.configs.get(&action.action_type).cloned();
        if let Some(config) = config {
            self.execute_and_record(&mut action, &config).await?;
        }
        Ok(action)
    }

    /// `dryRun(action)`: computes the execution plan without executing it or
    /// persisting any state change.
    pub fn dry_run(&self, action_type: &str, payload: &serde_json::Value) -> Result<ExecutionPlan, ActionBusError> {
        let config = self
            .configs
            .get(action_type)
            .ok_or_else(|| ActionBusError::UnknownActionType(action_type.to_string()))?;
        Ok(ExecutionPlan {
            handler: config.handler.clone(),
            payload: payload.clone(),
            would_effects: vec![format!("invoke handler '{}' with the given payload", config.handler)],
        })
    }

    /// `processExpired()`: scans `PENDING` actions past `expires_at` and
    /// marks them `EXPIRED`. Returns the count transitioned.
    pub async fn process_expired(&self) -> Result<u32, ActionBusError> {
        let now = Utc::now();
        let scanned = self.kv.scan_by_prefix("action:", 10_000).await?;
        let mut expired = 0u32;
        for entry in scanned {
            if entry.key.starts_with("action:fp:") {
                continue;
            }
            let Ok(mut action) = serde_json::from_str::<Action>(&entry.value) else {
                continue;
            };
            if action.state == ActionState::Pending && action.expires_at.map(|e| e < now).unwrap_or(false) {
                action.state = ActionState::Expired;
                self.persist(&action).await?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn execute_and_record(&self, action: &mut Action, config: &ActionConfig) -> Result<(), ActionBusError> {
        action.state = ActionState::Executing;
        self.persist(action).await?;

        let fingerprint = hash_hex(&[&action.action_id, &canonical(&action.payload)]);
        let fp_key = format!("action:fp:{fingerprint}");

        if let Some(prior) = self.kv.get(&fp_key).await? {
            let result: serde_json::Value = serde_json::from_str(&prior).unwrap_or(serde_json::Value::Null);
            action.state = ActionState::Executed;
            action.result = Some(result);
            action.executed_at = Some(Utc::now());
            self.persist(action).await?;
            return Ok(());
        }

        let Some(executor) = self.executors.get(&config.handler) else {
            action.state = ActionState::Failed;
            action.result = Some(serde_json::json!({"error": format!("no executor registered for handler '{}'", config.handler)}));
            self.persist(action).await?;
            return Ok(());
        };

        match executor.execute(action).await {
            Ok(value) => {
                self.kv
                    .set_with_ttl(&fp_key, &serde_json::to_string(&value).unwrap_or_default(), Duration::from_secs(90 * 24 * 3600))
                    .await?;
                action.state = ActionState::Executed;
                action.result = Some(value);
                action.executed_at = Some(Utc::now());
            }
            Err(e) => {
                action.state = ActionState::Failed;
                action.result = Some(serde_json::json!({"error": e}));
            }
        }
        self.persist(action).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiss_core::kv::SqliteKv;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedTwoFactor(&'static str);
    impl TwoFactorVerifier for FixedTwoFactor {
        fn verify(&self, _actor: &str, code: &str) -> bool {
            code == self.0
        }
    }

    struct CountingExecutor {
        calls: Arc<AtomicU32>,
    }
    #[async_trait]
    impl ActionExecutor for CountingExecutor {
        async fn execute(&self, _action: &Action) -> Result<serde_json::Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"ok": true}))
        }
    }

    async fn bus_with(autonomy: AutonomyLevel) -> (ActionBus, Arc<AtomicU32>) {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let mut bus = ActionBus::new(kv, Arc::new(FixedTwoFactor("123456")));
        let calls = Arc::new(AtomicU32::new(0));
        bus.register_executor("noop", Arc::new(CountingExecutor { calls: calls.clone() }));
        bus.register_type(ActionConfig {
            action_type: "send_refund".to_string(),
            autonomy_level: autonomy,
            handler: "noop".to_string(),
            max_per_hour: None,
            max_per_day: None,
            ttl: Duration::from_secs(3600),
        });
        (bus, calls)
    }

    #[tokio::test]
    async fn auto_action_executes_immediately() {
        let (bus, calls) = bus_with(AutonomyLevel::Auto).await;
        let action = bus.propose("send_refund", None, serde_json::json!({"amount": 10}), "system", None).await.unwrap();
        assert_eq!(action.state, ActionState::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn draft_action_requires_confirm() {
        let (bus, calls) = bus_with(AutonomyLevel::Draft).await;
        let action = bus.propose("send_refund", None, serde_json::json!({"amount": 10}), "system", None).await.unwrap();
        assert_eq!(action.state, ActionState::Pending);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let confirmed = bus.confirm(&action.action_id, "agent").await.unwrap();
        assert_eq!(confirmed.state, ActionState::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn critical_action_ignores_approve_without_2fa() {
        let (bus, calls) = bus_with(AutonomyLevel::Critical).await;
        let action = bus.propose("send_refund", None, serde_json::json!({"amount": 999}), "system", None).await.unwrap();
        let after_approve = bus.approve(&action.action_id, "oncall").await.unwrap();
        assert_eq!(after_approve.state, ActionState::Pending);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let verified = bus.verify2fa_and_approve(&action.action_id, "oncall", "123456").await.unwrap();
        assert_eq!(verified.state, ActionState::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Idempotent repeat call: no-op, no second execution.
        let repeat = bus.verify2fa_and_approve(&action.action_id, "oncall", "wrong-code-does-not-matter-now").await.unwrap();
        assert_eq!(repeat.state, ActionState::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn critical_action_rejects_bad_code() {
        let (bus, calls) = bus_with(AutonomyLevel::Critical).await;
        let action = bus.propose("send_refund", None, serde_json::json!({"amount": 5}), "system", None).await.unwrap();
        let result = bus.verify2fa_and_approve(&action.action_id, "oncall", "000000").await;
        assert!(matches!(result, Err(ActionBusError::InvalidTwoFactorCode(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeat_propose_is_content_addressed_and_idempotent() {
        let (bus, calls) = bus_with(AutonomyLevel::Auto).await;
        let a1 = bus.propose("send_refund", None, serde_json::json!({"amount": 10}), "system", Some("req-1")).await.unwrap();
        let a2 = bus.propose("send_refund", None, serde_json::json!({"amount": 10}), "system", Some("req-1")).await.unwrap();
        assert_eq!(a1.action_id, a2.action_id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_action_rejects_further_mutation() {
        let (bus, _calls) = bus_with(AutonomyLevel::Approval).await;
        let action = bus.propose("send_refund", None, serde_json::json!({"amount": 10}), "system", None).await.unwrap();
        bus.reject(&action.action_id, "oncall", "not needed").await.unwrap();
        let result = bus.approve(&action.action_id, "oncall").await;
        assert!(matches!(result, Err(ActionBusError::Terminal(_))));
    }

    #[tokio::test]
    async fn process_expired_marks_past_deadline_pending_actions() {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let mut bus = ActionBus::new(kv, Arc::new(FixedTwoFactor("1")));
        bus.register_type(ActionConfig {
            action_type: "noop_type".to_string(),
            autonomy_level: AutonomyLevel::Approval,
            handler: "noop".to_string(),
            max_per_hour: None,
            max_per_day: None,
            ttl: Duration::from_millis(1),
        });
        let action = bus.propose("noop_type", None, serde_json::json!({}), "system", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let count = bus.process_expired().await.unwrap();
        assert_eq!(count, 1);
        let reloaded = bus.load(&action.action_id).await.unwrap();
        assert_eq!(reloaded.state, ActionState::Expired);
    }
}
