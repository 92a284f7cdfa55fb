//! KV-backed persistence for the intelligence tier's write-once records:
//! runs, findings, alerts, and cases. Each collection is a flat prefix scan
//! over [`KvStore`], the same shape [`kiss_queue::dlq`] uses for the DLQ —
//! no range-scan primitive is needed beyond `scan_by_prefix`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kiss_api_types::{Alert, Case, CaseState, Run, Finding};
use kiss_core::kv::KvStore;
use kiss_detect::{AlertStore, CaseStore, DetectorError, FindingStore, RunStore};

const RECORD_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

pub struct KvRunStore(pub Arc<dyn KvStore>);
pub struct KvFindingStore(pub Arc<dyn KvStore>);
pub struct KvAlertStore(pub Arc<dyn KvStore>);
pub struct KvCaseStore(pub Arc<dyn KvStore>);

fn to_store_err(e: impl std::fmt::Display) -> DetectorError {
    DetectorError::Store(e.to_string())
}

#[async_trait]
impl RunStore for KvRunStore {
    async fn save(&self, run: &Run) -> Result<(), DetectorError> {
        let key = format!("run:{}", run.run_id);
        let text = serde_json::to_string(run).map_err(to_store_err)?;
        self.0.set_with_ttl(&key, &text, RECORD_TTL).await.map_err(to_store_err)
    }
}

#[async_trait]
impl FindingStore for KvFindingStore {
    async fn save(&self, finding: &Finding) -> Result<(), DetectorError> {
        let key = format!("finding:{}", finding.finding_id);
        let text = serde_json::to_string(finding).map_err(to_store_err)?;
        self.0.set_with_ttl(&key, &text, RECORD_TTL).await.map_err(to_store_err)
    }
}

#[async_trait]
impl AlertStore for KvAlertStore {
    async fn save(&self, alert: &Alert) -> Result<(), DetectorError> {
        let key = format!("alert:{}", alert.alert_id);
        let text = serde_json::to_string(alert).map_err(to_store_err)?;
        self.0.set_with_ttl(&key, &text, RECORD_TTL).await.map_err(to_store_err)
    }
}

#[async_trait]
impl CaseStore for KvCaseStore {
    async fn find_open_case(&self, scope_key: &str, within: Duration) -> Result<Option<Case>, DetectorError> {
        let scanned = self.0.scan_by_prefix("case:", 10_000).await.map_err(to_store_err)?;
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(within).unwrap_or_default();
        for entry in scanned {
            let Ok(case) = serde_json::from_str::<Case>(&entry.value) else {
                continue;
            };
            let case_scope_key = serde_json::to_string(&case.scope).unwrap_or_default();
            if case_scope_key == scope_key && case.state != CaseState::Closed && case.created_at >= cutoff {
                return Ok(Some(case));
            }
        }
        Ok(None)
    }

    async fn save(&self, case: &Case) -> Result<(), DetectorError> {
        let key = format!("case:{}", case.case_id);
        let text = serde_json::to_string(case).map_err(to_store_err)?;
        self.0.set_with_ttl(&key, &text, RECORD_TTL).await.map_err(to_store_err)
    }
}

impl KvCaseStore {
    pub async fn get(&self, case_id: &str) -> Result<Option<Case>, DetectorError> {
        match self.0.get(&format!("case:{case_id}")).await.map_err(to_store_err)? {
            Some(text) => Ok(Some(serde_json::from_str(&text).map_err(to_store_err)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiss_api_types::Severity;
    use kiss_core::kv::SqliteKv;

    async fn kv() -> Arc<dyn KvStore> {
        Arc::new(SqliteKv::open_in_memory().await.unwrap())
    }

    fn case(id: &str, scope: serde_json::Value, state: CaseState) -> Case {
        let now = chrono::Utc::now();
        Case {
            case_id: id.to_string(),
            case_type: "refund_spike".to_string(),
            severity: Severity::High,
            title: "t".to_string(),
            description: "d".to_string(),
            scope,
            state,
            evidence: vec![],
            hypotheses: vec![],
            diagnosis: None,
            created_at: now,
            updated_at: now,
            detector_id: None,
            run_id: None,
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = KvCaseStore(kv().await);
        let c = case("c1", serde_json::json!({"m": "x"}), CaseState::Open);
        store.save(&c).await.unwrap();
        let got = store.get("c1").await.unwrap().unwrap();
        assert_eq!(got.case_id, "c1");
    }

    #[tokio::test]
    async fn find_open_case_ignores_closed_cases() {
        let store = KvCaseStore(kv().await);
        let scope = serde_json::json!({"m": "x"});
        store.save(&case("c1", scope.clone(), CaseState::Closed)).await.unwrap();
        let scope_key = serde_json::to_string(&scope).unwrap();
        let found = store.find_open_case(&scope_key, Duration::from_secs(3600)).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn find_open_case_matches_same_scope() {
        let store = KvCaseStore(kv().await);
        let scope = serde_json::json!({"m": "x"});
        store.save(&case("c1", scope.clone(), CaseState::Open)).await.unwrap();
        let scope_key = serde_json::to_string(&scope).unwrap();
        let found = store.find_open_case(&scope_key, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(found.unwrap().case_id, "c1");
    }
}
