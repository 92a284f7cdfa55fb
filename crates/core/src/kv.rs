//! C1 — Key-Value Store Adapter.
//!
//! A thin capability surface over a shared key-value service: strings with
//! TTL, atomic set-if-absent, atomic compare-and-delete, atomic
//! compare-and-expire, prefix scan, counter increments, and a delayed-queue
//! sorted set. The rest of the system (locks, rate limiter, deduplicator,
//! job queue) is built entirely on top of this trait, never on a concrete
//! backend, so the backend is swappable and testable in isolation.
//!
//! [`SqliteKv`] is the persistent, cross-process implementation (SQLite,
//! same WAL-tuned connection idiom as the rest of this crate). [`MemoryKv`]
//! is the in-process fallback used when the persistent backend is down;
//! every consumer of this trait must work unmodified against either.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<tokio_rusqlite::Error> for KvError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        KvError::Storage(e.to_string())
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// A scanned key/value pair.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub key: String,
    pub value: String,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;
    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool>;
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        new_ttl: Duration,
    ) -> KvResult<bool>;
    async fn increment_by(&self, key: &str, delta: i64, ttl_if_new: Duration) -> KvResult<i64>;
    async fn scan_by_prefix(&self, prefix: &str, page_size: usize) -> KvResult<Vec<ScanEntry>>;
    async fn zadd_delayed(&self, zset: &str, score: i64, value: &str) -> KvResult<()>;
    async fn zpop_min(&self, zset: &str, max_score: i64) -> KvResult<Option<(i64, String)>>;

    /// Whether this backend is currently reachable. Consumers must check
    /// this and fall back rather than let operations fail silently.
    fn is_available(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// SqliteKv — the persistent, cross-process backend
// ---------------------------------------------------------------------------

pub struct SqliteKv {
    conn: Connection,
}

impl SqliteKv {
    pub async fn open(path: impl AsRef<std::path::Path>) -> KvResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let kv = Self { conn };
        kv.init_schema().await?;
        Ok(kv)
    }

    pub async fn open_in_memory() -> KvResult<Self> {
        let conn = Connection::open_in_memory().await?;
        let kv = Self { conn };
        kv.init_schema().await?;
        Ok(kv)
    }

    async fn init_schema(&self) -> KvResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS kv_entries (
                        key        TEXT PRIMARY KEY,
                        value      TEXT NOT NULL,
                        expires_at INTEGER
                    );
                    CREATE TABLE IF NOT EXISTS kv_zsets (
                        zset  TEXT NOT NULL,
                        value TEXT NOT NULL,
                        score INTEGER NOT NULL,
                        PRIMARY KEY (zset, value)
                    );
                    CREATE INDEX IF NOT EXISTS idx_kv_zsets_score ON kv_zsets(zset, score);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn now_epoch() -> i64 {
        Utc::now().timestamp()
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let key = key.to_string();
        let now = Self::now_epoch();
        let v = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT value, expires_at FROM kv_entries WHERE key = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                match rows.next()? {
                    Some(row) => {
                        let value: String = row.get(0)?;
                        let expires_at: Option<i64> = row.get(1)?;
                        Ok(Some((value, expires_at)))
                    }
                    None => Ok(None),
                }
            })
            .await?;
        Ok(match v {
            Some((value, Some(exp))) if exp <= now => None,
            Some((value, _)) => Some(value),
            None => None,
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = Self::now_epoch() + ttl.as_secs() as i64;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1,?2,?3)
                     ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=excluded.expires_at",
                    rusqlite::params![key, value, expires_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let key_c = key.to_string();
        let value_c = value.to_string();
        let now = Self::now_epoch();
        let expires_at = now + ttl.as_secs() as i64;
        let acquired = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT expires_at FROM kv_entries WHERE key = ?1",
                        rusqlite::params![key_c],
                        |r| r.get(0),
                    )
                    .optional()?;
                let expired = matches!(existing, Some(e) if e <= now);
                let vacant = existing.is_none() || expired;
                if vacant {
                    tx.execute(
                        "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1,?2,?3)
                         ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=excluded.expires_at",
                        rusqlite::params![key_c, value_c, expires_at],
                    )?;
                }
                tx.commit()?;
                Ok(vacant)
            })
            .await?;
        Ok(acquired)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
        let key = key.to_string();
        let expected = expected.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT value FROM kv_entries WHERE key = ?1",
                        rusqlite::params![key],
                        |r| r.get(0),
                    )
                    .optional()?;
                let matches = current.as_deref() == Some(expected.as_str());
                if matches {
                    tx.execute("DELETE FROM kv_entries WHERE key = ?1", rusqlite::params![key])?;
                }
                tx.commit()?;
                Ok(matches)
            })
            .await?;
        Ok(deleted)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        new_ttl: Duration,
    ) -> KvResult<bool> {
        let key = key.to_string();
        let expected = expected.to_string();
        let new_expires = Self::now_epoch() + new_ttl.as_secs() as i64;
        let extended = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT value FROM kv_entries WHERE key = ?1",
                        rusqlite::params![key],
                        |r| r.get(0),
                    )
                    .optional()?;
                let matches = current.as_deref() == Some(expected.as_str());
                if matches {
                    tx.execute(
                        "UPDATE kv_entries SET expires_at = ?2 WHERE key = ?1",
                        rusqlite::params![key, new_expires],
                    )?;
                }
                tx.commit()?;
                Ok(matches)
            })
            .await?;
        Ok(extended)
    }

    async fn increment_by(&self, key: &str, delta: i64, ttl_if_new: Duration) -> KvResult<i64> {
        let key = key.to_string();
        let now = Self::now_epoch();
        let expires_at = now + ttl_if_new.as_secs() as i64;
        let value = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<(String, i64)> = tx
                    .query_row(
                        "SELECT value, expires_at FROM kv_entries WHERE key = ?1",
                        rusqlite::params![key],
                        |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                let new_value = match existing {
                    Some((v, exp)) if exp > now => {
                        let parsed: i64 = v.parse().unwrap_or(0);
                        let updated = parsed + delta;
                        tx.execute(
                            "UPDATE kv_entries SET value = ?2 WHERE key = ?1",
                            rusqlite::params![key, updated.to_string()],
                        )?;
                        updated
                    }
                    _ => {
                        tx.execute(
                            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1,?2,?3)
                             ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=excluded.expires_at",
                            rusqlite::params![key, delta.to_string(), expires_at],
                        )?;
                        delta
                    }
                };
                tx.commit()?;
                Ok(new_value)
            })
            .await?;
        Ok(value)
    }

    async fn scan_by_prefix(&self, prefix: &str, page_size: usize) -> KvResult<Vec<ScanEntry>> {
        let prefix_owned = prefix.to_string();
        let like = format!("{}%", prefix_owned.replace('%', "\\%"));
        let limit = page_size as i64;
        let now = Self::now_epoch();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM kv_entries
                     WHERE key LIKE ?1 ESCAPE '\\' AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY key LIMIT ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![like, now, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(ScanEntry {
                        key: row.get(0)?,
                        value: row.get(1)?,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    async fn zadd_delayed(&self, zset: &str, score: i64, value: &str) -> KvResult<()> {
        let zset = zset.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO kv_zsets (zset, value, score) VALUES (?1,?2,?3)
                     ON CONFLICT(zset, value) DO UPDATE SET score=excluded.score",
                    rusqlite::params![zset, value, score],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn zpop_min(&self, zset: &str, max_score: i64) -> KvResult<Option<(i64, String)>> {
        let zset = zset.to_string();
        let popped = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let candidate: Option<(i64, String)> = tx
                    .query_row(
                        "SELECT score, value FROM kv_zsets WHERE zset = ?1 AND score <= ?2
                         ORDER BY score ASC LIMIT 1",
                        rusqlite::params![zset, max_score],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                if let Some((_, ref value)) = candidate {
                    tx.execute(
                        "DELETE FROM kv_zsets WHERE zset = ?1 AND value = ?2",
                        rusqlite::params![zset, value],
                    )?;
                }
                tx.commit()?;
                Ok(candidate)
            })
            .await?;
        Ok(popped)
    }
}

use rusqlite::OptionalExtension;

// ---------------------------------------------------------------------------
// MemoryKv — in-process fallback used when the persistent backend is down
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<i64>,
}

pub struct MemoryKv {
    entries: DashMap<String, MemoryEntry>,
    zsets: Mutex<BTreeMap<String, BTreeMap<String, i64>>>,
    available: std::sync::atomic::AtomicBool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            zsets: Mutex::new(BTreeMap::new()),
            available: std::sync::atomic::AtomicBool::new(true),
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    fn live(&self, key: &str) -> Option<String> {
        let now = Self::now();
        match self.entries.get(key) {
            Some(e) if e.expires_at.map(|exp| exp > now).unwrap_or(true) => Some(e.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Evict all expired entries. Intended to run on a slow interval.
    pub fn prune_expired(&self) {
        let now = Self::now();
        self.entries
            .retain(|_, e| e.expires_at.map(|exp| exp > now).unwrap_or(true));
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.live(key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Self::now() + ttl.as_secs() as i64),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        if self.live(key).is_some() {
            return Ok(false);
        }
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Self::now() + ttl.as_secs() as i64),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
        if self.live(key).as_deref() == Some(expected) {
            self.entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        new_ttl: Duration,
    ) -> KvResult<bool> {
        if self.live(key).as_deref() == Some(expected) {
            if let Some(mut e) = self.entries.get_mut(key) {
                e.expires_at = Some(Self::now() + new_ttl.as_secs() as i64);
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn increment_by(&self, key: &str, delta: i64, ttl_if_new: Duration) -> KvResult<i64> {
        let now = Self::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: "0".to_string(),
                expires_at: Some(now + ttl_if_new.as_secs() as i64),
            });
        if entry.expires_at.map(|exp| exp <= now).unwrap_or(false) {
            entry.value = "0".to_string();
            entry.expires_at = Some(now + ttl_if_new.as_secs() as i64);
        }
        let current: i64 = entry.value.parse().unwrap_or(0);
        let updated = current + delta;
        entry.value = updated.to_string();
        Ok(updated)
    }

    async fn scan_by_prefix(&self, prefix: &str, page_size: usize) -> KvResult<Vec<ScanEntry>> {
        let now = Self::now();
        let mut out: Vec<ScanEntry> = self
            .entries
            .iter()
            .filter(|kv| kv.key().starts_with(prefix))
            .filter(|kv| kv.value().expires_at.map(|exp| exp > now).unwrap_or(true))
            .map(|kv| ScanEntry {
                key: kv.key().clone(),
                value: kv.value().value.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out.truncate(page_size);
        Ok(out)
    }

    async fn zadd_delayed(&self, zset: &str, score: i64, value: &str) -> KvResult<()> {
        let mut zsets = self.zsets.lock().await;
        zsets
            .entry(zset.to_string())
            .or_default()
            .insert(value.to_string(), score);
        Ok(())
    }

    async fn zpop_min(&self, zset: &str, max_score: i64) -> KvResult<Option<(i64, String)>> {
        let mut zsets = self.zsets.lock().await;
        let Some(members) = zsets.get_mut(zset) else {
            return Ok(None);
        };
        let candidate = members
            .iter()
            .filter(|(_, &score)| score <= max_score)
            .min_by_key(|(_, &score)| score)
            .map(|(value, &score)| (value.clone(), score));
        if let Some((value, score)) = &candidate {
            members.remove(value);
            return Ok(Some((*score, value.clone())));
        }
        Ok(None)
    }

    fn is_available(&self) -> bool {
        self.available.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// A KV handle that prefers a persistent backend and transparently falls
/// back to an in-process store when the backend errors out. Mirrors the
/// "fallback is a first-class mode, not a feature flag" design note: the
/// active mode is inspectable via [`DualKv::mode`].
pub struct DualKv {
    primary: Arc<SqliteKv>,
    fallback: Arc<MemoryKv>,
    degraded: std::sync::atomic::AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvMode {
    Primary,
    Fallback,
}

impl DualKv {
    pub fn new(primary: SqliteKv) -> Self {
        Self {
            primary: Arc::new(primary),
            fallback: Arc::new(MemoryKv::new()),
            degraded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> KvMode {
        if self.degraded.load(std::sync::atomic::Ordering::Relaxed) {
            KvMode::Fallback
        } else {
            KvMode::Primary
        }
    }

    fn mark_degraded(&self) {
        if !self.degraded.swap(true, std::sync::atomic::Ordering::Relaxed) {
            tracing::warn!("kv backend unavailable, falling back to in-process store");
        }
    }
}

macro_rules! try_primary_then_fallback {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        match $self.primary.$method($($arg),*).await {
            Ok(v) => Ok(v),
            Err(e) => {
                $self.mark_degraded();
                tracing::debug!(error = %e, "kv primary error, using fallback");
                $self.fallback.$method($($arg),*).await
            }
        }
    }};
}

#[async_trait]
impl KvStore for DualKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        try_primary_then_fallback!(self, get(key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        try_primary_then_fallback!(self, set_with_ttl(key, value, ttl))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        try_primary_then_fallback!(self, set_if_absent(key, value, ttl))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
        try_primary_then_fallback!(self, compare_and_delete(key, expected))
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        new_ttl: Duration,
    ) -> KvResult<bool> {
        try_primary_then_fallback!(self, compare_and_expire(key, expected, new_ttl))
    }

    async fn increment_by(&self, key: &str, delta: i64, ttl_if_new: Duration) -> KvResult<i64> {
        try_primary_then_fallback!(self, increment_by(key, delta, ttl_if_new))
    }

    async fn scan_by_prefix(&self, prefix: &str, page_size: usize) -> KvResult<Vec<ScanEntry>> {
        try_primary_then_fallback!(self, scan_by_prefix(prefix, page_size))
    }

    async fn zadd_delayed(&self, zset: &str, score: i64, value: &str) -> KvResult<()> {
        try_primary_then_fallback!(self, zadd_delayed(zset, score, value))
    }

    async fn zpop_min(&self, zset: &str, max_score: i64) -> KvResult<Option<(i64, String)>> {
        try_primary_then_fallback!(self, zpop_min(zset, max_score))
    }

    fn is_available(&self) -> bool {
        !self.degraded.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_is_atomic_first_writer_wins() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        assert!(kv.set_if_absent("lock:a", "token1", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.set_if_absent("lock:a", "token2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(kv.get("lock:a").await.unwrap().as_deref(), Some("token1"));
    }

    #[tokio::test]
    async fn compare_and_delete_only_deletes_matching_owner() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        kv.set_with_ttl("lock:b", "owner1", Duration::from_secs(5)).await.unwrap();
        assert!(!kv.compare_and_delete("lock:b", "owner2").await.unwrap());
        assert!(kv.get("lock:b").await.unwrap().is_some());
        assert!(kv.compare_and_delete("lock:b", "owner1").await.unwrap());
        assert!(kv.get("lock:b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_reacquirable() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        assert!(kv.set_if_absent("k", "v1", Duration::from_secs(0)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(kv.set_if_absent("k", "v2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn increment_by_accumulates_within_window() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        assert_eq!(kv.increment_by("counter", 1, Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(kv.increment_by("counter", 1, Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(kv.increment_by("counter", 3, Duration::from_secs(60)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn zpop_min_respects_max_score_and_fifo_order() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        kv.zadd_delayed("delayed", 200, "later").await.unwrap();
        kv.zadd_delayed("delayed", 100, "sooner").await.unwrap();
        let (score, value) = kv.zpop_min("delayed", 150).await.unwrap().unwrap();
        assert_eq!((score, value.as_str()), (100, "sooner"));
        assert!(kv.zpop_min("delayed", 150).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_kv_matches_sqlite_kv_contract() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("k", "v", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.set_if_absent("k", "v2", Duration::from_secs(5)).await.unwrap());
        assert!(kv.compare_and_delete("k", "v").await.unwrap());
    }

    #[tokio::test]
    async fn dual_kv_reports_mode() {
        let kv = DualKv::new(SqliteKv::open_in_memory().await.unwrap());
        assert_eq!(kv.mode(), KvMode::Primary);
        assert!(kv.is_available());
    }
}
