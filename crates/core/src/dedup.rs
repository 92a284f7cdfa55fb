//! C4 — Deduplicator.
//!
//! Idempotency keys with TTL; a "seen-before?" decision built directly on
//! `set_if_absent` — whoever wins the race is the first seer, everyone else
//! gets back the first seer's timestamp.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::kv::{KvError, KvStore};

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
}

pub struct Deduplicator {
    kv: Arc<dyn KvStore>,
}

#[derive(Debug, Clone)]
pub struct SeenResult {
    pub was_seen: bool,
    pub first_seen_at: DateTime<Utc>,
}

impl Deduplicator {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(key: &str) -> String {
        format!("dedup:{key}")
    }

    /// `seen(key, ttl) -> (was_seen, first_seen_at)`. Used to drop repeat
    /// webhook deliveries by `idempotency_key`.
    pub async fn seen(&self, key: &str, ttl: Duration) -> Result<SeenResult, DedupError> {
        let full_key = Self::key(key);
        let now = Utc::now();
        let acquired = self
            .kv
            .set_if_absent(&full_key, &now.to_rfc3339(), ttl)
            .await?;
        if acquired {
            return Ok(SeenResult {
                was_seen: false,
                first_seen_at: now,
            });
        }
        let stored = self.kv.get(&full_key).await?;
        let first_seen_at = stored
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(now);
        Ok(SeenResult {
            was_seen: true,
            first_seen_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::SqliteKv;

    #[tokio::test]
    async fn same_key_seen_many_times_emits_once() {
        let dedup = Deduplicator::new(Arc::new(SqliteKv::open_in_memory().await.unwrap()));
        let first = dedup.seen("X", Duration::from_secs(60)).await.unwrap();
        assert!(!first.was_seen);
        for _ in 0..5 {
            let repeat = dedup.seen("X", Duration::from_secs(60)).await.unwrap();
            assert!(repeat.was_seen);
            assert_eq!(repeat.first_seen_at, first.first_seen_at);
        }
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let dedup = Deduplicator::new(Arc::new(SqliteKv::open_in_memory().await.unwrap()));
        assert!(!dedup.seen("A", Duration::from_secs(60)).await.unwrap().was_seen);
        assert!(!dedup.seen("B", Duration::from_secs(60)).await.unwrap().was_seen);
    }
}
