use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of work enqueued onto a named queue.
///
/// `data` carries whatever the route handler needs — for the messaging tier
/// this is `conversation_id`, the webhook-receipt timestamp, and the routing
/// decision; for the intelligence tier it is a detector scope. `trace_context`
/// is a serialized [`kiss_harness::trace_ctx::TraceContext`] so the worker's
/// span is a child of the span that enqueued the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub queue: String,
    pub name: String,
    pub data: serde_json::Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub next_run_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub trace_context: Option<serde_json::Value>,
}

impl Job {
    /// The key used to serialize a lock name for this job. Handlers that need
    /// per-conversation serialization store `lock_key` in `data`; jobs
    /// without one fence on their own `job_id` (no real exclusion).
    pub fn lock_key(&self) -> String {
        self.data
            .get("lock_key")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.job_id.clone())
    }
}

/// Where a job currently sits in its lifecycle. Matches `getStats()`'s
/// per-state counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Options accepted by [`crate::queue::JobQueue::add`].
#[derive(Debug, Clone)]
pub struct AddOptions {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub delay: Option<std::time::Duration>,
    pub job_id: Option<String>,
    pub trace_context: Option<serde_json::Value>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1000,
            delay: None,
            job_id: None,
            trace_context: None,
        }
    }
}

/// Per-state job counts returned by `getStats()`. `fallback` is true when the
/// queue is currently running against the in-process `MemoryKv` tier instead
/// of durable SQLite — per-process only, lost on restart, surfaced rather
/// than hidden.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub fallback: bool,
}
