//! Detectors-queue job handler: the consumer side of C7's worker pool for
//! the `"detectors"` queue the scheduler (C11) enqueues onto. Looks the
//! detector up by id and runs it through [`DetectorRunner::execute`]; a job
//! for a detector with no registered implementation completes as a no-op
//! rather than retrying forever (no concrete detectors ship by default,
//! see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use kiss_detect::{Detector, DetectorRunner};
use kiss_queue::worker::{JobHandler, WorkerError};
use kiss_queue::Job;

pub struct DetectorsJobHandler {
    pub runner: Arc<DetectorRunner>,
    pub detectors: HashMap<String, Arc<dyn Detector>>,
}

#[async_trait]
impl JobHandler for DetectorsJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), WorkerError> {
        let detector_id = job.data["detector_id"].as_str().unwrap_or_default();
        let scope = job.data["scope"].clone();

        let Some(detector) = self.detectors.get(detector_id) else {
            tracing::warn!(detector_id, "no detector registered for this id, skipping run");
            return Ok(());
        };

        self.runner
            .execute(detector.as_ref(), serde_json::json!({}), scope)
            .await
            .map_err(|e| WorkerError::Handler(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use kiss_api_types::{DetectorOutputType, DetectorSpec, Finding};
    use kiss_core::kv::{KvStore, SqliteKv};
    use kiss_core::ratelimit::RateLimiter;
    use kiss_detect::DetectorError;
    use kiss_queue::Job;
    use uuid::Uuid;

    use crate::stores::{KvAlertStore, KvCaseStore, KvFindingStore, KvRunStore};

    struct NoopDetector(DetectorSpec);

    #[async_trait]
    impl Detector for NoopDetector {
        fn spec(&self) -> &DetectorSpec {
            &self.0
        }
        async fn analyze(&self, _inputs: &serde_json::Value, _scope: &serde_json::Value) -> Result<Vec<Finding>, DetectorError> {
            Ok(vec![])
        }
    }

    fn spec(id: &str) -> DetectorSpec {
        DetectorSpec {
            detector_id: id.to_string(),
            category: "refunds".to_string(),
            input_data_products: vec![],
            schedule: "0 * * * * *".to_string(),
            thresholds: serde_json::json!({}),
            output_type: DetectorOutputType::Alert,
            cooldown_hours: 1,
            max_alerts_per_day: 10,
            is_active: true,
            last_run_id: None,
            last_run_status: None,
        }
    }

    fn job_for(detector_id: &str) -> Job {
        Job {
            job_id: Uuid::new_v4().to_string(),
            queue: "detectors".to_string(),
            name: detector_id.to_string(),
            data: serde_json::json!({"detector_id": detector_id, "scope": {}}),
            attempts_made: 0,
            max_attempts: 3,
            backoff_base_ms: 1000,
            next_run_at: Utc::now(),
            enqueued_at: Utc::now(),
            trace_context: None,
        }
    }

    async fn runner() -> Arc<DetectorRunner> {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        Arc::new(DetectorRunner::new(
            Arc::new(KvRunStore(kv.clone())),
            Arc::new(KvFindingStore(kv.clone())),
            Arc::new(KvAlertStore(kv.clone())),
            Arc::new(KvCaseStore(kv.clone())),
            RateLimiter::new(kv),
        ))
    }

    #[tokio::test]
    async fn unregistered_detector_is_a_no_op() {
        let handler = DetectorsJobHandler {
            runner: runner().await,
            detectors: HashMap::new(),
        };
        handler.handle(&job_for("unknown")).await.unwrap();
    }

    #[tokio::test]
    async fn registered_detector_runs_to_completion() {
        let mut detectors: HashMap<String, Arc<dyn Detector>> = HashMap::new();
        detectors.insert("refund_spike".to_string(), Arc::new(NoopDetector(spec("refund_spike"))));
        let handler = DetectorsJobHandler { runner: runner().await, detectors };
        handler.handle(&job_for("refund_spike")).await.unwrap();
    }
}
