//! §3.2 Intelligence tier data model: detectors, runs, findings, alerts,
//! cases, actions, and the two append-only logs (transitions, audit).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSpec {
    pub detector_id: String,
    pub category: String,
    pub input_data_products: Vec<String>,
    pub schedule: String,
    pub thresholds: serde_json::Value,
    pub output_type: DetectorOutputType,
    pub cooldown_hours: u32,
    pub max_alerts_per_day: u32,
    pub is_active: bool,
    pub last_run_id: Option<String>,
    pub last_run_status: Option<RunStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorOutputType {
    Alert,
    Case,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub detector_id: String,
    pub scope: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub duration_ms: Option<u64>,
    pub input_row_count: u64,
    pub findings_count: u64,
    pub alerts_created: u64,
    pub cases_created: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    New,
    Labeled,
    Converted,
    Dismissed,
    Acknowledged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub id: String,
    pub value: f64,
    pub baseline: f64,
    pub deviation_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    pub run_id: String,
    pub detector_id: String,
    pub finding_type: String,
    pub severity: Severity,
    pub confidence: f64,
    pub title: String,
    pub description: String,
    pub evidence: serde_json::Value,
    pub scope: serde_json::Value,
    pub metric: Option<MetricSnapshot>,
    pub status: FindingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Active,
    Acknowledged,
    Resolved,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub detector_id: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub scope: serde_json::Value,
    pub state: AlertState,
    /// Deterministic key used for cooldown dedupe: at most one `active`
    /// alert per `(detector_id, fingerprint)` within `cooldown_hours`.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// §4.12's ten case states. Kept here (rather than only in `kiss-cases`) so
/// the HTTP layer and storage layer can speak the wire type without
/// depending on the state-machine crate's transition-table logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Open,
    Investigating,
    Diagnosed,
    Recommended,
    Approved,
    Executing,
    Executed,
    Measuring,
    Measured,
    Closed,
}

impl std::fmt::Display for CaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CaseState::Open => "open",
            CaseState::Investigating => "investigating",
            CaseState::Diagnosed => "diagnosed",
            CaseState::Recommended => "recommended",
            CaseState::Approved => "approved",
            CaseState::Executing => "executing",
            CaseState::Executed => "executed",
            CaseState::Measuring => "measuring",
            CaseState::Measured => "measured",
            CaseState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseEvent {
    StartInvestigation,
    CloseAsNoise,
    AddEvidence,
    NeedMoreInfo,
    Diagnose,
    CloseAsFalsePositive,
    RecommendAction,
    CloseNoActionNeeded,
    ApproveAction,
    RejectAction,
    ModifyRecommendation,
    StartExecution,
    Cancel,
    ExecutionSuccess,
    ExecutionFailed,
    StartMeasurement,
    SkipMeasurement,
    MeasurementComplete,
    CloseWithLearnings,
    Reopen,
}

impl std::fmt::Display for CaseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    pub case_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub scope: serde_json::Value,
    pub state: CaseState,
    pub evidence: Vec<serde_json::Value>,
    pub hypotheses: Vec<String>,
    pub diagnosis: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub detector_id: Option<String>,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    Auto,
    Draft,
    Approval,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Approved,
    Rejected,
    Executing,
    Executed,
    Failed,
    Expired,
    Cancelled,
}

impl ActionState {
    /// An `Action` in one of these states is immutable (invariant 6).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Executed
                | ActionState::Failed
                | ActionState::Rejected
                | ActionState::Expired
                | ActionState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_id: String,
    pub case_id: Option<String>,
    pub action_type: String,
    pub payload: serde_json::Value,
    pub autonomy_level: AutonomyLevel,
    pub state: ActionState,
    pub requested_by: String,
    pub approved_by: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub case_id: String,
    pub from_state: CaseState,
    pub to_state: CaseState,
    pub event: CaseEvent,
    pub actor: String,
    pub context: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub payload: serde_json::Value,
}
