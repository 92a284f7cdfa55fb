//! C5 — Job Queue.
//!
//! Built directly on [`kiss_core::kv::KvStore`]: job bodies live under
//! `job:{queue}:{job_id}`, readiness is tracked in a per-queue delayed zset
//! (`queue:{queue}:scheduled`), and in-flight leases in a second zset
//! (`queue:{queue}:active`). Per-state counts are plain KV counters adjusted
//! on every transition rather than derived by scanning — cheap to read, and
//! correct under the same fallback semantics `KvStore` already provides.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kiss_core::kv::{KvError, KvStore};

use crate::job::{AddOptions, Job, JobState, QueueStats};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// Counters never expire in practice — a ten-year TTL stands in for "forever"
/// without adding a third KvStore method just for this.
const FOREVER: Duration = Duration::from_secs(10 * 365 * 24 * 3600);
/// How long a completed/failed job body stays inspectable before it ages out.
const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job: Job,
    state: JobState,
}

/// Outcome of [`JobQueue::fail`].
#[derive(Debug, Clone)]
pub enum FailOutcome {
    Rescheduled {
        next_run_at: DateTime<Utc>,
        attempts_made: u32,
    },
    Terminal,
}

fn job_key(queue: &str, job_id: &str) -> String {
    format!("job:{queue}:{job_id}")
}

fn scheduled_zset(queue: &str) -> String {
    format!("queue:{queue}:scheduled")
}

fn active_zset(queue: &str) -> String {
    format!("queue:{queue}:active")
}

fn stats_key(queue: &str, state: &str) -> String {
    format!("queue:{queue}:stats:{state}")
}

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub struct JobQueue {
    kv: Arc<dyn KvStore>,
}

impl JobQueue {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn is_fallback(&self) -> bool {
        !self.kv.is_available()
    }

    /// `add(queue, name, data, opts) -> job_id`. A caller-supplied `job_id`
    /// that already names a non-terminal job makes this call a no-op.
    pub async fn add(
        &self,
        queue: &str,
        name: &str,
        data: serde_json::Value,
        opts: AddOptions,
    ) -> Result<String, QueueError> {
        let job_id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = self.kv.get(&job_key(queue, &job_id)).await? {
            if let Ok(record) = serde_json::from_str::<JobRecord>(&existing) {
                if !matches!(record.state, JobState::Completed | JobState::Failed) {
                    return Ok(job_id);
                }
            }
        }

        let now = Utc::now();
        let next_run_at = match opts.delay {
            Some(d) => now + chrono::Duration::from_std(d).unwrap_or_default(),
            None => now,
        };
        let state = if opts.delay.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let job = Job {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            name: name.to_string(),
            data,
            attempts_made: 0,
            max_attempts: opts.max_attempts,
            backoff_base_ms: opts.backoff_base_ms,
            next_run_at,
            enqueued_at: now,
            trace_context: opts.trace_context,
        };

        self.persist(&job, state).await?;
        self.bump(queue, state.as_str(), 1).await?;
        self.kv
            .zadd_delayed(&scheduled_zset(queue), millis(next_run_at), &job_id)
            .await?;
        Ok(job_id)
    }

    async fn persist(&self, job: &Job, state: JobState) -> Result<(), QueueError> {
        let record = JobRecord {
            job: job.clone(),
            state,
        };
        let text = serde_json::to_string(&record).map_err(|e| QueueError::Serde(e.to_string()))?;
        self.kv
            .set_with_ttl(&job_key(&job.queue, &job.job_id), &text, RETENTION)
            .await?;
        Ok(())
    }

    async fn load(&self, queue: &str, job_id: &str) -> Result<JobRecord, QueueError> {
        let text = self
            .kv
            .get(&job_key(queue, job_id))
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        serde_json::from_str(&text).map_err(|e| QueueError::Serde(e.to_string()))
    }

    async fn bump(&self, queue: &str, state: &str, delta: i64) -> Result<(), QueueError> {
        self.kv.increment_by(&stats_key(queue, state), delta, FOREVER).await?;
        Ok(())
    }

    async fn counter(&self, queue: &str, state: &str) -> Result<u64, QueueError> {
        let v = self.kv.increment_by(&stats_key(queue, state), 0, FOREVER).await?;
        Ok(v.max(0) as u64)
    }

    /// Pop the next job whose `next_run_at` has arrived and mark it active
    /// under `lease`. Stalled-job recovery relies on this lease: a job still
    /// `Active` once its lease's score is popped by [`Self::recover_stalled`]
    /// is re-queued with an incremented attempt count.
    fn paused_key(queue: &str) -> String {
        format!("queue:paused:{queue}")
    }

    /// Admin pause: `pop_ready` returns `None` for this queue until resumed.
    /// Does not affect jobs already leased as active.
    pub async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.kv.set_with_ttl(&Self::paused_key(queue), "1", Duration::from_secs(365 * 24 * 3600)).await?;
        Ok(())
    }

    pub async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.kv.set_with_ttl(&Self::paused_key(queue), "", Duration::from_secs(0)).await?;
        Ok(())
    }

    pub async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        Ok(self.kv.get(&Self::paused_key(queue)).await?.is_some_and(|v| v == "1"))
    }

    pub async fn pop_ready(&self, queue: &str, lease: Duration) -> Result<Option<Job>, QueueError> {
        if self.is_paused(queue).await? {
            return Ok(None);
        }
        let now = Utc::now();
        let popped = self.kv.zpop_min(&scheduled_zset(queue), millis(now)).await?;
        let Some((_, job_id)) = popped else {
            return Ok(None);
        };
        let mut record = self.load(queue, &job_id).await?;
        let from = record.state;
        record.state = JobState::Active;
        self.persist(&record.job, JobState::Active).await?;
        self.bump(queue, from.as_str(), -1).await?;
        self.bump(queue, JobState::Active.as_str(), 1).await?;

        let lease_expires_at = now + chrono::Duration::from_std(lease).unwrap_or_default();
        self.kv
            .zadd_delayed(&active_zset(queue), millis(lease_expires_at), &job_id)
            .await?;
        Ok(Some(record.job))
    }

    /// Mark `job` completed.
    pub async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        self.persist(job, JobState::Completed).await?;
        self.bump(&job.queue, JobState::Active.as_str(), -1).await?;
        self.bump(&job.queue, JobState::Completed.as_str(), 1).await?;
        Ok(())
    }

    /// Record a handler failure: either reschedules with exponential backoff
    /// (`now + backoff_base * 2^(attempts_made-1)`) or reports `Terminal` once
    /// `max_attempts` is reached, leaving the caller to move the job to the
    /// DLQ.
    pub async fn fail(&self, job: &mut Job, _error: &str) -> Result<FailOutcome, QueueError> {
        job.attempts_made += 1;
        self.bump(&job.queue, JobState::Active.as_str(), -1).await?;

        if job.attempts_made >= job.max_attempts {
            self.persist(job, JobState::Failed).await?;
            self.bump(&job.queue, JobState::Failed.as_str(), 1).await?;
            return Ok(FailOutcome::Terminal);
        }

        let backoff_ms = job.backoff_base_ms * 2u64.saturating_pow(job.attempts_made.saturating_sub(1));
        job.next_run_at = Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64);
        self.persist(job, JobState::Delayed).await?;
        self.bump(&job.queue, JobState::Delayed.as_str(), 1).await?;
        self.kv
            .zadd_delayed(&scheduled_zset(&job.queue), millis(job.next_run_at), &job.job_id)
            .await?;
        Ok(FailOutcome::Rescheduled {
            next_run_at: job.next_run_at,
            attempts_made: job.attempts_made,
        })
    }

    /// Sweep leases that have expired; any job still `Active` at that point
    /// was pulled by a worker that never completed or failed it within the
    /// lease window — re-queue it with an incremented attempt count. Returns
    /// the number of jobs recovered.
    pub async fn recover_stalled(&self, queue: &str) -> Result<u32, QueueError> {
        let now = Utc::now();
        let mut recovered = 0u32;
        loop {
            let popped = self.kv.zpop_min(&active_zset(queue), millis(now)).await?;
            let Some((_, job_id)) = popped else { break };
            let mut record = match self.load(queue, &job_id).await {
                Ok(r) => r,
                Err(QueueError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if record.state != JobState::Active {
                continue;
            }
            record.job.attempts_made += 1;
            record.job.next_run_at = now;
            self.persist(&record.job, JobState::Waiting).await?;
            self.bump(queue, JobState::Active.as_str(), -1).await?;
            self.bump(queue, JobState::Waiting.as_str(), 1).await?;
            self.kv
                .zadd_delayed(&scheduled_zset(queue), millis(now), &job_id)
                .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            waiting: self.counter(queue, JobState::Waiting.as_str()).await?,
            delayed: self.counter(queue, JobState::Delayed.as_str()).await?,
            active: self.counter(queue, JobState::Active.as_str()).await?,
            completed: self.counter(queue, JobState::Completed.as_str()).await?,
            failed: self.counter(queue, JobState::Failed.as_str()).await?,
            fallback: self.is_fallback(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiss_core::kv::SqliteKv;

    async fn queue() -> JobQueue {
        JobQueue::new(Arc::new(SqliteKv::open_in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn add_then_pop_ready_round_trips() {
        let q = queue().await;
        let id = q
            .add("default", "send", serde_json::json!({"to": "x"}), AddOptions::default())
            .await
            .unwrap();
        let job = q.pop_ready("default", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(job.job_id, id);
        let stats = q.stats("default").await.unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn idempotent_enqueue_with_explicit_job_id() {
        let q = queue().await;
        let opts = AddOptions {
            job_id: Some("fixed-1".into()),
            ..Default::default()
        };
        let a = q.add("default", "n", serde_json::json!({}), opts.clone()).await.unwrap();
        let b = q.add("default", "n", serde_json::json!({}), opts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(q.stats("default").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn delayed_job_is_not_ready_until_due() {
        let q = queue().await;
        let opts = AddOptions {
            delay: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        q.add("default", "n", serde_json::json!({}), opts).await.unwrap();
        assert!(q.pop_ready("default", Duration::from_secs(30)).await.unwrap().is_none());
        assert_eq!(q.stats("default").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn failure_reschedules_with_backoff_then_terminates() {
        let q = queue().await;
        let opts = AddOptions {
            max_attempts: 2,
            backoff_base_ms: 100,
            ..Default::default()
        };
        q.add("default", "n", serde_json::json!({}), opts).await.unwrap();
        let mut job = q.pop_ready("default", Duration::from_secs(30)).await.unwrap().unwrap();

        match q.fail(&mut job, "boom").await.unwrap() {
            FailOutcome::Rescheduled { attempts_made, .. } => assert_eq!(attempts_made, 1),
            FailOutcome::Terminal => panic!("should reschedule on first failure"),
        }
        assert_eq!(q.stats("default").await.unwrap().delayed, 1);

        // second failure exhausts max_attempts=2, once the backoff has elapsed.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut job = q.pop_ready("default", Duration::from_secs(30)).await.unwrap().unwrap();
        match q.fail(&mut job, "boom again").await.unwrap() {
            FailOutcome::Terminal => {}
            other => panic!("expected terminal, got {other:?}"),
        }
        assert_eq!(q.stats("default").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn stalled_job_is_recovered_with_incremented_attempts() {
        let q = queue().await;
        q.add("default", "n", serde_json::json!({}), AddOptions::default()).await.unwrap();
        let job = q.pop_ready("default", Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let recovered = q.recover_stalled("default").await.unwrap();
        assert_eq!(recovered, 1);

        let job = q.pop_ready("default", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
    }

    #[tokio::test]
    async fn completed_job_is_not_recovered_as_stalled() {
        let q = queue().await;
        q.add("default", "n", serde_json::json!({}), AddOptions::default()).await.unwrap();
        let job = q.pop_ready("default", Duration::from_millis(1)).await.unwrap().unwrap();
        q.complete(&job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let recovered = q.recover_stalled("default").await.unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(q.stats("default").await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn paused_queue_yields_no_ready_jobs() {
        let q = queue().await;
        q.add("default", "n", serde_json::json!({}), AddOptions::default()).await.unwrap();
        q.pause("default").await.unwrap();
        assert!(q.pop_ready("default", Duration::from_secs(30)).await.unwrap().is_none());
        q.resume("default").await.unwrap();
        assert!(q.pop_ready("default", Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[test]
    fn millis_roundtrip() {
        let now = Utc::now();
        let ms = millis(now);
        let back = Utc.timestamp_millis_opt(ms).single().unwrap();
        assert!((back - now).num_milliseconds().abs() < 2);
    }
}
