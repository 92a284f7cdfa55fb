//! C12 — Detector Framework.
//!
//! `Detector::analyze` is the only piece a concrete detector implements;
//! [`DetectorRunner::execute`] drives the rest of §4.15's six-step
//! lifecycle around it: create `Run`, persist findings, decide alert/case
//! promotion, finalize `Run`. Never swallows a failure from `analyze` —
//! it is recorded on the `Run` and re-raised.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use kiss_api_types::{
    Alert, AlertState, Case, CaseState, DetectorOutputType, DetectorSpec, Finding, Run, RunStatus, Severity,
};
use kiss_core::ratelimit::RateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("analysis failed: {0}")]
    Analyze(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("rate limit error: {0}")]
    RateLimit(#[from] kiss_core::ratelimit::RateLimitError),
}

/// Implemented by one concrete detection algorithm. `input_data_products`
/// loading is delegated to an `InputLoader` collaborator out of scope here —
/// callers pass already-loaded `inputs` into [`DetectorRunner::execute`].
#[async_trait]
pub trait Detector: Send + Sync {
    fn spec(&self) -> &DetectorSpec;
    async fn analyze(&self, inputs: &serde_json::Value, scope: &serde_json::Value) -> Result<Vec<Finding>, DetectorError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, run: &Run) -> Result<(), DetectorError>;
}

#[async_trait]
pub trait FindingStore: Send + Sync {
    async fn save(&self, finding: &Finding) -> Result<(), DetectorError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn save(&self, alert: &Alert) -> Result<(), DetectorError>;
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    /// A non-closed case exists for the same `scope_key` within the trailing
    /// window (7 days per §4.15 step 5).
    async fn find_open_case(&self, scope_key: &str, within: Duration) -> Result<Option<Case>, DetectorError>;
    async fn save(&self, case: &Case) -> Result<(), DetectorError>;
}

fn canonical(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn fingerprint(detector_id: &str, finding_type: &str, scope: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(detector_id.as_bytes());
    hasher.update(b"|");
    hasher.update(finding_type.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical(scope).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct DetectorRunner {
    runs: Arc<dyn RunStore>,
    findings: Arc<dyn FindingStore>,
    alerts: Arc<dyn AlertStore>,
    cases: Arc<dyn CaseStore>,
    cooldown: RateLimiter,
}

const CASE_DEDUPE_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

impl DetectorRunner {
    pub fn new(
        runs: Arc<dyn RunStore>,
        findings: Arc<dyn FindingStore>,
        alerts: Arc<dyn AlertStore>,
        cases: Arc<dyn CaseStore>,
        cooldown: RateLimiter,
    ) -> Self {
        Self {
            runs,
            findings,
            alerts,
            cases,
            cooldown,
        }
    }

    /// `detector.execute(scope)`.
    pub async fn execute(
        &self,
        detector: &dyn Detector,
        inputs: serde_json::Value,
        scope: serde_json::Value,
    ) -> Result<Run, DetectorError> {
        let spec = detector.spec();
        let started = Instant::now();
        let mut run = Run {
            run_id: Uuid::new_v4().to_string(),
            detector_id: spec.detector_id.clone(),
            scope: scope.clone(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            duration_ms: None,
            input_row_count: inputs.as_array().map(|a| a.len() as u64).unwrap_or(0),
            findings_count: 0,
            alerts_created: 0,
            cases_created: 0,
            error: None,
        };
        self.runs.save(&run).await?;

        let findings = match detector.analyze(&inputs, &scope).await {
            Ok(f) => f,
            Err(e) => {
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
                run.completed_at = Some(Utc::now());
                run.duration_ms = Some(started.elapsed().as_millis() as u64);
                self.runs.save(&run).await?;
                return Err(e);
            }
        };

        run.findings_count = findings.len() as u64;

        for finding in &findings {
            self.findings.save(finding).await?;

            let wants_alert = spec.output_type == DetectorOutputType::Alert
                || matches!(finding.severity, Severity::High | Severity::Critical);
            if wants_alert {
                let fp = fingerprint(&spec.detector_id, &finding.finding_type, &scope);
                let decision = self
                    .cooldown
                    .check(
                        &format!("detector:{}:alert:{}", spec.detector_id, fp),
                        1,
                        Duration::from_secs(spec.cooldown_hours as u64 * 3600),
                    )
                    .await?;
                let daily = self
                    .cooldown
                    .check(
                        &format!("detector:{}:daily_count", spec.detector_id),
                        spec.max_alerts_per_day as i64,
                        Duration::from_secs(24 * 3600),
                    )
                    .await?;
                if decision.allowed && daily.allowed {
                    let alert = Alert {
                        alert_id: Uuid::new_v4().to_string(),
                        detector_id: spec.detector_id.clone(),
                        severity: finding.severity,
                        title: finding.title.clone(),
                        message: finding.description.clone(),
                        scope: scope.clone(),
                        state: AlertState::Active,
                        fingerprint: fp,
                        created_at: Utc::now(),
                        expires_at: None,
                    };
                    self.alerts.save(&alert).await?;
                    run.alerts_created += 1;
                }
            }

            let wants_case = spec.output_type == DetectorOutputType::Case || finding.severity == Severity::Critical;
            if wants_case {
                let scope_key = canonical(&scope);
                let existing = self.cases.find_open_case(&scope_key, CASE_DEDUPE_WINDOW).await?;
                if existing.is_none() {
                    let now = Utc::now();
                    let case = Case {
                        case_id: Uuid::new_v4().to_string(),
                        case_type: finding.finding_type.clone(),
                        severity: finding.severity,
                        title: finding.title.clone(),
                        description: finding.description.clone(),
                        scope: scope.clone(),
                        state: CaseState::Open,
                        evidence: vec![finding.evidence.clone()],
                        hypotheses: Vec::new(),
                        diagnosis: None,
                        created_at: now,
                        updated_at: now,
                        detector_id: Some(spec.detector_id.clone()),
                        run_id: Some(run.run_id.clone()),
                    };
                    self.cases.save(&case).await?;
                    run.cases_created += 1;
                }
            }
        }

        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        run.duration_ms = Some(started.elapsed().as_millis() as u64);
        self.runs.save(&run).await?;
        Ok(run)
    }
}
