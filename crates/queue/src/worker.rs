//! C7 — Worker Pool.
//!
//! Concurrency-bounded consumers of [`crate::queue::JobQueue`]. Each worker
//! loop follows the same eight steps regardless of which tier (messaging or
//! detectors) it's driving: acquire the per-job lock via
//! [`kiss_core::lock::LockManager::with_lock`] (which already owns
//! renewal-at-2/3-TTL and release-on-every-exit-path), run the handler inside
//! it, then record the outcome back onto the queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, info_span, warn, Instrument};

use kiss_core::lock::{LockError, LockManager};
use kiss_telemetry::metrics::MetricsCollector;

use crate::dlq::DeadLetterQueue;
use crate::job::Job;
use crate::queue::{FailOutcome, JobQueue};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("handler error: {0}")]
    Handler(String),
}

/// Implemented by whatever owns `Route` dispatch (messaging tier) or
/// detector execution (intelligence tier). The worker pool itself knows
/// nothing about routes or detectors — only that a job either succeeds or
/// returns an error for retry/DLQ handling.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), WorkerError>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: u32,
    pub lock_ttl: Duration,
    pub lock_wait_timeout: Duration,
    pub poll_interval: Duration,
    pub stall_lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            lock_ttl: Duration::from_secs(45),
            lock_wait_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(200),
            stall_lease: Duration::from_secs(90),
        }
    }
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    dlq: Arc<DeadLetterQueue>,
    locks: Arc<LockManager>,
    metrics: Arc<MetricsCollector>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        dlq: Arc<DeadLetterQueue>,
        locks: Arc<LockManager>,
        metrics: Arc<MetricsCollector>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            dlq,
            locks,
            metrics,
            config,
        }
    }

    /// Spawn `config.concurrency` consumer loops against `queue_name`. Each
    /// loop runs until `shutdown` fires; returns the join handles so the
    /// caller can await them during a graceful drain.
    pub fn spawn(
        self: &Arc<Self>,
        queue_name: &str,
        handler: Arc<dyn JobHandler>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for worker_index in 0..self.config.concurrency {
            let pool = self.clone();
            let handler = handler.clone();
            let queue_name = queue_name.to_string();
            let mut shutdown_rx = shutdown.resubscribe();
            handles.push(tokio::spawn(async move {
                pool.run_loop(worker_index, &queue_name, handler, &mut shutdown_rx).await;
            }));
        }
        // The caller's receiver isn't needed directly; each loop holds its own.
        let _ = shutdown.try_recv();
        handles
    }

    async fn run_loop(
        &self,
        worker_index: u32,
        queue_name: &str,
        handler: Arc<dyn JobHandler>,
        shutdown: &mut tokio::sync::broadcast::Receiver<()>,
    ) {
        info!(worker_index, queue = queue_name, "worker loop starting");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(worker_index, "worker loop stopping on shutdown signal");
                    return;
                }
                job = self.queue.pop_ready(queue_name, self.config.stall_lease) => {
                    match job {
                        Ok(Some(job)) => self.process(job, handler.clone()).await,
                        Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                        Err(e) => {
                            warn!(error = %e, "queue pop_ready failed");
                            tokio::time::sleep(self.config.poll_interval).await;
                        }
                    }
                }
            }
        }
    }

    /// Steps 1–8 of the worker-pool algorithm.
    async fn process(&self, mut job: Job, handler: Arc<dyn JobHandler>) {
        let span = info_span!(
            "job",
            job_id = %job.job_id,
            queue = %job.queue,
            name = %job.name,
            trace_id = job.trace_context.as_ref().and_then(|v| v.get("trace_id")).and_then(|v| v.as_str()).unwrap_or("")
        );

        async {
            let started = Instant::now();
            let queue_wait_ms = (Utc_now_ms() - job.enqueued_at.timestamp_millis()).max(0) as f64;

            let lock_key = job.lock_key();
            let handler_ref = handler.clone();
            let job_for_handler = job.clone();
            let outcome = self
                .locks
                .with_lock(
                    &lock_key,
                    self.config.lock_ttl,
                    Some(self.config.lock_wait_timeout),
                    move || async move { handler_ref.handle(&job_for_handler).await },
                )
                .await;

            match outcome {
                Err(LockError::Timeout { .. }) => {
                    info!(job_id = %job.job_id, "skipped: lock_timeout");
                    self.metrics.increment_counter("jobs_skipped_lock_timeout", &[]);
                    // Not a failure: another worker owns this conversation. Leave
                    // the job to be re-picked; requeue immediately.
                    job.next_run_at = chrono::Utc::now();
                    let _ = self.queue.complete(&job).await; // job body already consumed by pop_ready's lease
                }
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "lock manager error");
                    self.record_failure(&mut job, &e.to_string()).await;
                }
                Ok(result) => {
                    if result.stale {
                        warn!(job_id = %job.job_id, "handler completed under a stale lock, discarding result");
                    }
                    match result.value {
                        Ok(()) => {
                            let _ = self.queue.complete(&job).await;
                            self.metrics.increment_counter("jobs_completed", &[("queue", &job.queue)]);
                        }
                        Err(e) => {
                            self.record_failure(&mut job, &e.to_string()).await;
                        }
                    }
                }
            }

            self.metrics.record_histogram("queue_wait_ms", queue_wait_ms);
            self.metrics
                .record_histogram("processing_time_ms", started.elapsed().as_millis() as f64);
            self.metrics.record_histogram(
                "end_to_end_ms",
                (Utc_now_ms() - job.enqueued_at.timestamp_millis()) as f64,
            );
        }
        .instrument(span)
        .await;
    }

    async fn record_failure(&self, job: &mut Job, error: &str) {
        match self.queue.fail(job, error).await {
            Ok(FailOutcome::Rescheduled { attempts_made, next_run_at }) => {
                info!(job_id = %job.job_id, attempts_made, %next_run_at, "job rescheduled after failure");
                self.metrics.increment_counter("jobs_retried", &[("queue", &job.queue)]);
            }
            Ok(FailOutcome::Terminal) => {
                warn!(job_id = %job.job_id, error, "job failed terminally, moving to DLQ");
                self.metrics.increment_counter("jobs_failed_terminal", &[("queue", &job.queue)]);
                if let Err(e) = self
                    .dlq
                    .move_to_dlq(job, error, serde_json::json!({"attempts_made": job.attempts_made}))
                    .await
                {
                    warn!(job_id = %job.job_id, error = %e, "failed to move job to DLQ");
                }
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "failed to record job failure");
            }
        }
    }
}

#[allow(non_snake_case)]
fn Utc_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AddOptions;
    use kiss_core::kv::{KvStore, SqliteKv};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    struct CountingHandler {
        calls: StdArc<AtomicU32>,
        fail_first_n: u32,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<(), WorkerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                Err(WorkerError::Handler("transient".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn pool() -> (Arc<JobQueue>, Arc<WorkerPool>) {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let queue = Arc::new(JobQueue::new(kv.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(kv.clone(), queue.clone()));
        let locks = Arc::new(LockManager::new(kv));
        let metrics = Arc::new(MetricsCollector::new());
        let pool = Arc::new(WorkerPool::new(queue.clone(), dlq, locks, metrics, WorkerConfig {
            concurrency: 1,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        }));
        (queue, pool)
    }

    #[tokio::test]
    async fn successful_job_completes_and_clears_active_count() {
        let (queue, pool) = pool().await;
        queue
            .add("default", "n", serde_json::json!({}), AddOptions::default())
            .await
            .unwrap();

        let handler: Arc<dyn JobHandler> = Arc::new(CountingHandler {
            calls: StdArc::new(AtomicU32::new(0)),
            fail_first_n: 0,
        });
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let handles = pool.spawn("default", handler, rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = tx.send(());
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), h).await;
        }

        let stats = queue.stats("default").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn failing_job_moves_to_dlq_after_max_attempts() {
        let (queue, pool) = pool().await;
        queue
            .add(
                "default",
                "n",
                serde_json::json!({}),
                AddOptions {
                    max_attempts: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let handler: Arc<dyn JobHandler> = Arc::new(CountingHandler {
            calls: StdArc::new(AtomicU32::new(0)),
            fail_first_n: 100,
        });
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let handles = pool.spawn("default", handler, rx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = tx.send(());
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), h).await;
        }

        let stats = queue.stats("default").await.unwrap();
        assert_eq!(stats.failed, 1);
    }
}
