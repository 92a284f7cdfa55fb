//! C3 — Rate Limiter.
//!
//! Fixed-window token bucket per key, built directly on
//! [`crate::kv::KvStore::increment_by`]: distributed correctness when the
//! backend is the persistent [`crate::kv::SqliteKv`], weaker (but
//! documented) correctness when it has fallen back to
//! [`crate::kv::MemoryKv`] — the same contract either way.

use std::sync::Arc;
use std::time::Duration;

use crate::kv::{KvError, KvStore};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub count: i64,
    pub limit: i64,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(key: &str) -> String {
        format!("rate:{key}")
    }

    /// `check(key, limit, window) -> allowed`. Each call increments the
    /// window counter by one and reports whether the resulting count is
    /// within `limit`.
    pub async fn check(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<RateDecision, RateLimitError> {
        let count = self.kv.increment_by(&Self::key(key), 1, window).await?;
        Ok(RateDecision {
            allowed: count <= limit,
            count,
            limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::SqliteKv;

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(Arc::new(SqliteKv::open_in_memory().await.unwrap()));
        for i in 1..=3 {
            let d = limiter.check("k", 3, Duration::from_secs(60)).await.unwrap();
            assert_eq!(d.count, i);
            assert!(d.allowed);
        }
        let d = limiter.check("k", 3, Duration::from_secs(60)).await.unwrap();
        assert_eq!(d.count, 4);
        assert!(!d.allowed);
    }

    #[tokio::test]
    async fn independent_keys_have_independent_windows() {
        let limiter = RateLimiter::new(Arc::new(SqliteKv::open_in_memory().await.unwrap()));
        assert!(limiter.check("a", 1, Duration::from_secs(60)).await.unwrap().allowed);
        assert!(limiter.check("b", 1, Duration::from_secs(60)).await.unwrap().allowed);
    }
}
