//! C11 — Scheduled Runner.
//!
//! On each tick, checks every active detector's cron expression against the
//! window since the last tick; a due detector is enqueued onto the
//! `"detectors"` queue (C5) rather than run inline, so scheduling never
//! blocks on detector execution. `trigger()` bypasses the schedule entirely
//! for manual runs, still subject to the concurrency cap and start-rate
//! limit.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::Mutex;

use kiss_core::ratelimit::RateLimiter;
use kiss_queue::{AddOptions, JobQueue};

use crate::registry::DetectorRegistry;

pub const DETECTORS_QUEUE: &str = "detectors";
const DEFAULT_TIMEZONE: &str = "America/Mexico_City";

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{0}': {1}")]
    InvalidCron(String, String),
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),
    #[error("queue error: {0}")]
    Queue(#[from] kiss_queue::QueueError),
    #[error("rate limit error: {0}")]
    RateLimit(#[from] kiss_core::ratelimit::RateLimitError),
}

pub struct SchedulerConfig {
    pub timezone: String,
    pub tick_interval: Duration,
    pub max_starts_per_minute: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            tick_interval: Duration::from_secs(30),
            max_starts_per_minute: 10,
        }
    }
}

pub struct DetectorScheduler {
    registry: Arc<DetectorRegistry>,
    queue: Arc<JobQueue>,
    start_limiter: RateLimiter,
    timezone: Tz,
    config: SchedulerConfig,
    last_tick: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DetectorScheduler {
    pub fn new(
        registry: Arc<DetectorRegistry>,
        queue: Arc<JobQueue>,
        start_limiter: RateLimiter,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let timezone = Tz::from_str(&config.timezone).map_err(|_| SchedulerError::InvalidTimezone(config.timezone.clone()))?;
        Ok(Self {
            registry,
            queue,
            start_limiter,
            timezone,
            config,
            last_tick: Mutex::new(HashMap::new()),
        })
    }

    /// Bypasses the cron schedule entirely for a manual run.
    pub async fn trigger(&self, detector_id: &str, scope: serde_json::Value) -> Result<String, SchedulerError> {
        self.enqueue(detector_id, scope).await
    }

    async fn enqueue(&self, detector_id: &str, scope: serde_json::Value) -> Result<String, SchedulerError> {
        let decision = self
            .start_limiter
            .check("detector_starts", self.config.max_starts_per_minute, Duration::from_secs(60))
            .await?;
        if !decision.allowed {
            tracing::warn!(detector_id, "detector start rate limit exceeded, deferring by 60s");
            return Ok(self
                .queue
                .add(
                    DETECTORS_QUEUE,
                    detector_id,
                    serde_json::json!({ "detector_id": detector_id, "scope": scope }),
                    AddOptions {
                        delay: Some(Duration::from_secs(60)),
                        ..Default::default()
                    },
                )
                .await?);
        }
        Ok(self
            .queue
            .add(
                DETECTORS_QUEUE,
                detector_id,
                serde_json::json!({ "detector_id": detector_id, "scope": scope }),
                AddOptions::default(),
            )
            .await?)
    }

    /// One scheduling pass: for each active detector, fire at most once if
    /// its cron expression has an occurrence within `(last_tick, now]`.
    pub async fn tick(&self) -> Result<u32, SchedulerError> {
        let now = Utc::now().with_timezone(&self.timezone);
        let mut fired = 0u32;
        let mut last_tick = self.last_tick.lock().await;

        for spec in self.registry.active().await {
            let schedule = Schedule::from_str(&spec.schedule)
                .map_err(|e| SchedulerError::InvalidCron(spec.schedule.clone(), e.to_string()))?;
            let since = *last_tick
                .entry(spec.detector_id.clone())
                .or_insert_with(|| now.with_timezone(&Utc) - chrono::Duration::from_std(self.config.tick_interval).unwrap_or_default());
            let due = schedule.after(&since.with_timezone(&self.timezone)).take(1).any(|t| t <= now);
            if due {
                self.enqueue(&spec.detector_id, serde_json::json!({})).await?;
                fired += 1;
            }
            last_tick.insert(spec.detector_id.clone(), now.with_timezone(&Utc));
        }
        Ok(fired)
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("detector scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticSource;
    use kiss_api_types::DetectorOutputType;
    use kiss_core::kv::SqliteKv;

    fn spec(id: &str, schedule: &str) -> kiss_api_types::DetectorSpec {
        kiss_api_types::DetectorSpec {
            detector_id: id.to_string(),
            category: "billing".to_string(),
            input_data_products: vec![],
            schedule: schedule.to_string(),
            thresholds: serde_json::json!({}),
            output_type: DetectorOutputType::Alert,
            cooldown_hours: 6,
            max_alerts_per_day: 10,
            is_active: true,
            last_run_id: None,
            last_run_status: None,
        }
    }

    async fn scheduler(schedule: &str) -> (Arc<DetectorScheduler>, Arc<JobQueue>) {
        let kv = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let queue = Arc::new(JobQueue::new(kv.clone()));
        let registry = Arc::new(DetectorRegistry::new(vec![spec("d-1", schedule)], Arc::new(StaticSource(vec![]))));
        let limiter = RateLimiter::new(kv);
        let scheduler = DetectorScheduler::new(registry, queue.clone(), limiter, SchedulerConfig::default()).unwrap();
        (Arc::new(scheduler), queue)
    }

    #[tokio::test]
    async fn every_second_cron_fires_on_first_tick() {
        let (scheduler, queue) = scheduler("* * * * * *").await;
        let fired = scheduler.tick().await.unwrap();
        assert_eq!(fired, 1);
        let stats = queue.stats(DETECTORS_QUEUE).await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn manual_trigger_bypasses_schedule() {
        let (scheduler, queue) = scheduler("0 0 0 1 1 * 2099").await; // effectively never
        scheduler.trigger("d-1", serde_json::json!({"manual": true})).await.unwrap();
        let stats = queue.stats(DETECTORS_QUEUE).await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn invalid_timezone_is_rejected_at_construction() {
        let kv = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let queue = Arc::new(JobQueue::new(kv.clone()));
        let registry = Arc::new(DetectorRegistry::new(vec![], Arc::new(StaticSource(vec![]))));
        let limiter = RateLimiter::new(kv);
        let config = SchedulerConfig {
            timezone: "Not/ARealZone".to_string(),
            ..Default::default()
        };
        let result = DetectorScheduler::new(registry, queue, limiter, config);
        assert!(matches!(result, Err(SchedulerError::InvalidTimezone(_))));
    }
}
