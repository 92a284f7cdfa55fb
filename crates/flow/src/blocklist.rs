//! §6.4 Blocklist policy.
//!
//! Tiered source resolution: live KV entries win over policy config, which
//! wins over an environment-derived default. Keys are normalized before
//! lookup so a phone number or email always hashes to the same entry
//! regardless of how the caller formatted it.

use std::sync::Arc;

use kiss_core::kv::{KvError, KvStore};

#[derive(Debug, thiserror::Error)]
pub enum BlocklistError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
}

/// Normalizes a contact identifier for blocklist comparison: an email is
/// lower-cased and trimmed; anything else is treated as a phone number and
/// reduced to digits with a leading `+` retained.
pub fn normalize(contact: &str) -> String {
    let trimmed = contact.trim();
    if trimmed.contains('@') {
        return trimmed.to_lowercase();
    }
    let mut out = String::new();
    if trimmed.starts_with('+') {
        out.push('+');
    }
    out.extend(trimmed.chars().filter(|c| c.is_ascii_digit()));
    out
}

pub struct Blocklist {
    kv: Arc<dyn KvStore>,
    config_entries: Vec<String>,
}

impl Blocklist {
    pub fn new(kv: Arc<dyn KvStore>, config_entries: Vec<String>) -> Self {
        Self {
            kv,
            config_entries: config_entries.iter().map(|e| normalize(e)).collect(),
        }
    }

    fn key(contact: &str) -> String {
        format!("blocklist:{}", normalize(contact))
    }

    /// `true` if `contact` is blocked by any tier. KV is checked first since
    /// it reflects the most recent operator action; config is the durable
    /// fallback.
    pub async fn is_blocked(&self, contact: &str) -> Result<bool, BlocklistError> {
        if self.kv.get(&Self::key(contact)).await?.is_some() {
            return Ok(true);
        }
        Ok(self.config_entries.iter().any(|e| e == &normalize(contact)))
    }

    pub async fn add(&self, contact: &str) -> Result<(), BlocklistError> {
        self.kv
            .set_with_ttl(&Self::key(contact), "1", std::time::Duration::from_secs(10 * 365 * 24 * 3600))
            .await?;
        Ok(())
    }

    pub async fn remove(&self, contact: &str) -> Result<(), BlocklistError> {
        self.kv.set_with_ttl(&Self::key(contact), "", std::time::Duration::from_secs(0)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiss_core::kv::SqliteKv;

    #[test]
    fn normalize_lowercases_email() {
        assert_eq!(normalize("  User@Example.COM "), "user@example.com");
    }

    #[test]
    fn normalize_strips_phone_formatting() {
        assert_eq!(normalize("+1 (555) 123-4567"), "+15551234567");
    }

    #[tokio::test]
    async fn config_entry_blocks_without_kv_hit() {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let bl = Blocklist::new(kv, vec!["spammer@example.com".to_string()]);
        assert!(bl.is_blocked("SPAMMER@example.com").await.unwrap());
        assert!(!bl.is_blocked("ok@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn kv_add_and_remove_round_trip() {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let bl = Blocklist::new(kv, vec![]);
        assert!(!bl.is_blocked("+15551234567").await.unwrap());
        bl.add("+1 555 123 4567").await.unwrap();
        assert!(bl.is_blocked("+15551234567").await.unwrap());
        bl.remove("+15551234567").await.unwrap();
        assert!(!bl.is_blocked("+15551234567").await.unwrap());
    }
}
