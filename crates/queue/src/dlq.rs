//! C6 — Dead Letter Queue.
//!
//! Terminal sink for jobs that exhausted retries. Entries are stored under a
//! zero-padded-timestamp key so `scan_by_prefix` returns them in arrival
//! order without needing a dedicated range-scan primitive on `KvStore`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kiss_core::kv::{KvError, KvStore};

use crate::job::{AddOptions, Job};
use crate::queue::{JobQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("dlq entry not found: {0}")]
    NotFound(String),
    #[error("confirmation token mismatch")]
    BadConfirmation,
    #[error("serialization error: {0}")]
    Serde(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub dlq_job_id: String,
    pub job: Job,
    pub error: String,
    pub meta: serde_json::Value,
    pub moved_at: DateTime<Utc>,
    pub host: String,
}

const ENTRY_PREFIX: &str = "dlq:entry:";

fn entry_key(moved_at: DateTime<Utc>, dlq_job_id: &str) -> String {
    // 13-digit zero-padded millis keeps scan_by_prefix output in arrival order.
    format!("{ENTRY_PREFIX}{:013}:{dlq_job_id}", moved_at.timestamp_millis())
}

fn dlq_job_id(job_id: &str) -> String {
    format!("dlq:{job_id}")
}

pub struct DeadLetterQueue {
    kv: Arc<dyn KvStore>,
    queue: Arc<JobQueue>,
}

impl DeadLetterQueue {
    pub fn new(kv: Arc<dyn KvStore>, queue: Arc<JobQueue>) -> Self {
        Self { kv, queue }
    }

    /// `moveToDLQ(job, error, meta)`. Stores the full job payload plus
    /// failure metadata under a deterministic id derived from the job's own
    /// id, so a re-delivered terminal failure for the same job overwrites
    /// rather than duplicates its DLQ entry.
    pub async fn move_to_dlq(
        &self,
        job: &Job,
        error: &str,
        meta: serde_json::Value,
    ) -> Result<String, DlqError> {
        let dlq_id = dlq_job_id(&job.job_id);
        let moved_at = Utc::now();
        let entry = DlqEntry {
            dlq_job_id: dlq_id.clone(),
            job: job.clone(),
            error: error.to_string(),
            meta,
            moved_at,
            host: hostname(),
        };
        let text = serde_json::to_string(&entry).map_err(|e| DlqError::Serde(e.to_string()))?;
        self.kv
            .set_with_ttl(&entry_key(moved_at, &dlq_id), &text, std::time::Duration::from_secs(90 * 24 * 3600))
            .await?;
        Ok(dlq_id)
    }

    /// `listDLQ({start, end}) -> paged jobs`, oldest first.
    pub async fn list(&self, start: DateTime<Utc>, end: DateTime<Utc>, page_size: usize) -> Result<Vec<DlqEntry>, DlqError> {
        let scanned = self.kv.scan_by_prefix(ENTRY_PREFIX, page_size.max(1) * 4).await?;
        let mut out = Vec::new();
        for entry in scanned {
            let parsed: DlqEntry = match serde_json::from_str(&entry.value) {
                Ok(e) => e,
                Err(_) => continue,
            };
            if parsed.moved_at >= start && parsed.moved_at <= end {
                out.push(parsed);
            }
            if out.len() >= page_size {
                break;
            }
        }
        Ok(out)
    }

    async fn find_key(&self, dlq_id: &str) -> Result<Option<(String, DlqEntry)>, DlqError> {
        let scanned = self.kv.scan_by_prefix(ENTRY_PREFIX, 10_000).await?;
        for entry in scanned {
            if entry.key.ends_with(&format!(":{dlq_id}")) {
                let parsed: DlqEntry =
                    serde_json::from_str(&entry.value).map_err(|e| DlqError::Serde(e.to_string()))?;
                return Ok(Some((entry.key, parsed)));
            }
        }
        Ok(None)
    }

    /// `retry(dlq_job_id) -> new_job_id`. Re-enqueues with fresh attempts=0
    /// under a job id derived deterministically from `dlq_job_id`, then
    /// removes the DLQ entry. If a crash happens between the two, the DLQ
    /// entry survives and a repeat `retry` call is a no-op: `add` finds the
    /// same non-terminal job already present and returns its id unchanged.
    pub async fn retry(&self, dlq_job_id: &str) -> Result<String, DlqError> {
        let new_job_id = format!("retry:{dlq_job_id}");

        let Some((key, entry)) = self.find_key(dlq_job_id).await? else {
            // Entry already gone (e.g. a repeat call after the first retry
            // removed it). `add` is idempotent on job_id, so the re-enqueued
            // job is already in the queue under `new_job_id` — this is a
            // no-op, not an error.
            return Ok(new_job_id);
        };

        let opts = AddOptions {
            max_attempts: entry.job.max_attempts,
            backoff_base_ms: entry.job.backoff_base_ms,
            job_id: Some(new_job_id.clone()),
            trace_context: entry.job.trace_context.clone(),
            delay: None,
        };
        let returned_id = self
            .queue
            .add(&entry.job.queue, &entry.job.name, entry.job.data.clone(), opts)
            .await?;

        if let Some(current) = self.kv.get(&key).await? {
            self.kv.compare_and_delete(&key, &current).await?;
        }
        Ok(returned_id)
    }

    /// `retryAll()`: same, in batch; returns the new job ids.
    pub async fn retry_all(&self) -> Result<Vec<String>, DlqError> {
        let all = self.list(DateTime::<Utc>::MIN_UTC, Utc::now(), 10_000).await?;
        let mut out = Vec::with_capacity(all.len());
        for entry in all {
            out.push(self.retry(&entry.dlq_job_id).await?);
        }
        Ok(out)
    }

    /// `discard(dlq_job_id)`: drop an entry without retrying it.
    pub async fn discard(&self, dlq_job_id: &str) -> Result<(), DlqError> {
        let (key, _) = self
            .find_key(dlq_job_id)
            .await?
            .ok_or_else(|| DlqError::NotFound(dlq_job_id.to_string()))?;
        if let Some(current) = self.kv.get(&key).await? {
            self.kv.compare_and_delete(&key, &current).await?;
        }
        Ok(())
    }

    /// `clearAll(confirmation_token)`: bulk-clear, gated by the operator
    /// admin token so an accidental call can't wipe the sink.
    pub async fn clear_all(&self, confirmation_token: &str, admin_token: &Option<String>) -> Result<u32, DlqError> {
        match admin_token {
            Some(expected) if expected == confirmation_token => {}
            _ => return Err(DlqError::BadConfirmation),
        }
        let all = self.list(DateTime::<Utc>::MIN_UTC, Utc::now(), 10_000).await?;
        let count = all.len() as u32;
        for entry in all {
            self.discard(&entry.dlq_job_id).await?;
        }
        Ok(count)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use kiss_core::kv::SqliteKv;

    async fn setup() -> (Arc<JobQueue>, DeadLetterQueue) {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let queue = Arc::new(JobQueue::new(kv.clone()));
        let dlq = DeadLetterQueue::new(kv, queue.clone());
        (queue, dlq)
    }

    async fn make_terminal_job(queue: &JobQueue) -> Job {
        let opts = AddOptions {
            max_attempts: 1,
            ..Default::default()
        };
        queue
            .add("default", "n", serde_json::json!({"x": 1}), opts)
            .await
            .unwrap();
        let mut job = queue.pop_ready("default", std::time::Duration::from_secs(30)).await.unwrap().unwrap();
        match queue.fail(&mut job, "boom").await.unwrap() {
            crate::queue::FailOutcome::Terminal => {}
            _ => panic!("expected terminal"),
        }
        job
    }

    #[tokio::test]
    async fn move_then_list_then_retry() {
        let (queue, dlq) = setup().await;
        let job = make_terminal_job(&queue).await;
        let dlq_id = dlq.move_to_dlq(&job, "boom", serde_json::json!({})).await.unwrap();

        let listed = dlq.list(DateTime::<Utc>::MIN_UTC, Utc::now(), 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].dlq_job_id, dlq_id);

        let new_job_id = dlq.retry(&dlq_id).await.unwrap();
        assert_eq!(new_job_id, format!("retry:{dlq_id}"));

        let listed = dlq.list(DateTime::<Utc>::MIN_UTC, Utc::now(), 10).await.unwrap();
        assert!(listed.is_empty(), "dlq entry should be removed after retry");
    }

    #[tokio::test]
    async fn retry_is_idempotent_on_repeat_call() {
        let (queue, dlq) = setup().await;
        let job = make_terminal_job(&queue).await;
        let dlq_id = dlq.move_to_dlq(&job, "boom", serde_json::json!({})).await.unwrap();

        let first = dlq.retry(&dlq_id).await.unwrap();

        let second = dlq.retry(&dlq_id).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn discard_removes_without_retry() {
        let (queue, dlq) = setup().await;
        let job = make_terminal_job(&queue).await;
        let dlq_id = dlq.move_to_dlq(&job, "boom", serde_json::json!({})).await.unwrap();
        dlq.discard(&dlq_id).await.unwrap();
        let listed = dlq.list(DateTime::<Utc>::MIN_UTC, Utc::now(), 10).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn clear_all_rejects_bad_token() {
        let (queue, dlq) = setup().await;
        let job = make_terminal_job(&queue).await;
        dlq.move_to_dlq(&job, "boom", serde_json::json!({})).await.unwrap();
        let admin_token = Some("secret".to_string());
        let result = dlq.clear_all("wrong", &admin_token).await;
        assert!(matches!(result, Err(DlqError::BadConfirmation)));
    }

    #[tokio::test]
    async fn clear_all_wipes_with_correct_token() {
        let (queue, dlq) = setup().await;
        let job = make_terminal_job(&queue).await;
        dlq.move_to_dlq(&job, "boom", serde_json::json!({})).await.unwrap();
        let admin_token = Some("secret".to_string());
        let cleared = dlq.clear_all("secret", &admin_token).await.unwrap();
        assert_eq!(cleared, 1);
        let listed = dlq.list(DateTime::<Utc>::MIN_UTC, Utc::now(), 10).await.unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn job_state_round_trips_through_serde() {
        let s = serde_json::to_string(&JobState::Delayed).unwrap();
        assert_eq!(s, "\"delayed\"");
    }
}
