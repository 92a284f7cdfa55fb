//! Queue — the durable job queue (C5), dead letter queue (C6), and worker
//! pool (C7) that drive both the messaging tier's per-conversation jobs and
//! the intelligence tier's detector runs.
//!
//! Built directly on [`kiss_core::kv::KvStore`] rather than a dedicated
//! schema: this gets the KV layer's durable/in-memory fallback for free
//! instead of reimplementing it a second time for the queue.

pub mod dlq;
pub mod job;
pub mod queue;
pub mod worker;

pub use dlq::{DeadLetterQueue, DlqEntry, DlqError};
pub use job::{AddOptions, Job, JobState, QueueStats};
pub use queue::{FailOutcome, JobQueue, QueueError};
pub use worker::{JobHandler, WorkerConfig, WorkerError, WorkerPool};
