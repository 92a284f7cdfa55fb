//! C10 — Conversation History Cache (§4.10).
//!
//! Fixed-capacity LRU keyed by `conversation_id`; each entry is a
//! bounded-length ring of [`ConversationHistoryEntry`]. A cache miss falls
//! through to the CRM collaborator (§6.1) for the last N messages.
//! `add_user`/`add_assistant` dedupe against the conversation's last entry:
//! same direction and same body is a no-op.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;

use kiss_api_types::{ConversationHistoryEntry, Direction};
use kiss_collaborators::CrmClient;

struct Inner {
    entries: HashMap<String, VecDeque<ConversationHistoryEntry>>,
    order: VecDeque<String>,
    capacity: usize,
    per_conversation_limit: usize,
}

/// Fixed-capacity LRU of per-conversation history rings.
pub struct HistoryCache {
    inner: Mutex<Inner>,
    crm: Option<CrmClient>,
    crm_account_id: String,
    backfill_limit: u32,
}

impl HistoryCache {
    pub fn new(capacity: usize, per_conversation_limit: usize, crm: Option<CrmClient>, crm_account_id: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity,
                per_conversation_limit,
            }),
            crm,
            crm_account_id: crm_account_id.into(),
            backfill_limit: 20,
        }
    }

    fn touch(inner: &mut Inner, conversation_id: &str) {
        inner.order.retain(|c| c != conversation_id);
        inner.order.push_back(conversation_id.to_string());
        while inner.order.len() > inner.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }

    fn push(inner: &mut Inner, entry: ConversationHistoryEntry) {
        Self::touch(inner, &entry.conversation_id);
        let ring = inner.entries.entry(entry.conversation_id.clone()).or_default();
        let limit = inner.per_conversation_limit;
        ring.push_back(entry);
        while ring.len() > limit {
            ring.pop_front();
        }
    }

    fn is_duplicate_of_last(ring: &VecDeque<ConversationHistoryEntry>, direction: Direction, body: &serde_json::Value) -> bool {
        ring.back().map(|last| last.direction == direction && &last.body == body).unwrap_or(false)
    }

    pub fn get(&self, conversation_id: &str) -> Vec<ConversationHistoryEntry> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(conversation_id) {
            Self::touch(&mut inner, conversation_id);
        }
        inner.entries.get(conversation_id).map(|r| r.iter().cloned().collect()).unwrap_or_default()
    }

    /// Fetches history for `conversation_id`, backfilling from the CRM on a
    /// cache miss.
    pub async fn get_or_backfill(&self, conversation_id: &str, account_id: Option<&str>) -> Vec<ConversationHistoryEntry> {
        {
            let existing = self.get(conversation_id);
            if !existing.is_empty() {
                return existing;
            }
        }
        let Some(crm) = &self.crm else {
            return Vec::new();
        };
        let account = account_id.unwrap_or(&self.crm_account_id);
        let messages = match crm.fetch_messages(account, conversation_id, self.backfill_limit).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "CRM backfill failed");
                return Vec::new();
            }
        };

        let mut inner = self.inner.lock().unwrap();
        for m in &messages {
            let direction = match m.message_type {
                kiss_collaborators::MessageType::Incoming => Direction::Inbound,
                _ => Direction::Outbound,
            };
            Self::push(
                &mut inner,
                ConversationHistoryEntry {
                    conversation_id: conversation_id.to_string(),
                    direction,
                    body: serde_json::json!({ "text": m.content }),
                    at: m.created_at,
                },
            );
        }
        inner.entries.get(conversation_id).map(|r| r.iter().cloned().collect()).unwrap_or_default()
    }

    fn add(&self, conversation_id: &str, direction: Direction, text: &str) {
        let body = serde_json::json!({ "text": text });
        let mut inner = self.inner.lock().unwrap();
        if let Some(ring) = inner.entries.get(conversation_id) {
            if Self::is_duplicate_of_last(ring, direction, &body) {
                return;
            }
        }
        Self::push(
            &mut inner,
            ConversationHistoryEntry {
                conversation_id: conversation_id.to_string(),
                direction,
                body,
                at: Utc::now(),
            },
        );
    }

    pub fn add_user(&self, conversation_id: &str, text: &str) {
        self.add(conversation_id, Direction::Inbound, text);
    }

    pub fn add_assistant(&self, conversation_id: &str, text: &str) {
        self.add(conversation_id, Direction::Outbound, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> HistoryCache {
        HistoryCache::new(2, 10, None, "acct")
    }

    #[test]
    fn add_user_then_assistant_accumulates() {
        let c = cache();
        c.add_user("c1", "hi");
        c.add_assistant("c1", "hello!");
        assert_eq!(c.get("c1").len(), 2);
    }

    #[test]
    fn repeat_same_role_same_content_is_deduped() {
        let c = cache();
        c.add_user("c1", "hi");
        c.add_user("c1", "hi");
        assert_eq!(c.get("c1").len(), 1);
    }

    #[test]
    fn same_content_different_role_is_not_deduped() {
        let c = cache();
        c.add_user("c1", "hi");
        c.add_assistant("c1", "hi");
        assert_eq!(c.get("c1").len(), 2);
    }

    #[test]
    fn lru_evicts_least_recently_used_conversation() {
        let c = cache();
        c.add_user("c1", "a");
        c.add_user("c2", "b");
        c.add_user("c3", "c");
        assert!(c.get("c1").is_empty());
        assert_eq!(c.get("c2").len(), 1);
        assert_eq!(c.get("c3").len(), 1);
    }

    #[test]
    fn getting_an_entry_marks_it_most_recently_used() {
        let c = cache();
        c.add_user("c1", "a");
        c.add_user("c2", "b");
        let _ = c.get("c1");
        c.add_user("c3", "c");
        assert!(c.get("c2").is_empty());
        assert_eq!(c.get("c1").len(), 1);
    }
}
