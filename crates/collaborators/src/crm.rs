//! §6.1 Customer-support CRM collaborator.
//!
//! Thin REST client: one shared [`reqwest::Client`], auth header attached per
//! request, JSON in and out. Used by C10 (history backfill on cache miss),
//! C15 (outbound send), and the agent-gating policy that decides whether the
//! bot must defer to a human.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("CRM API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, CrmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Incoming,
    Outgoing,
    Activity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmMessage {
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub assignee_id: Option<String>,
    pub custom_attributes: serde_json::Value,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub base_url: String,
    pub api_token: String,
}

#[derive(Clone)]
pub struct CrmClient {
    http: reqwest::Client,
    config: CrmConfig,
}

impl CrmClient {
    pub fn new(config: CrmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(CrmError::Api { status, body })
        }
    }

    pub async fn send_message(
        &self,
        account_id: &str,
        conversation_id: &str,
        text: &str,
        private: bool,
    ) -> Result<CrmMessage> {
        let resp = self
            .http
            .post(self.url(&format!("/accounts/{account_id}/conversations/{conversation_id}/messages")))
            .bearer_auth(&self.config.api_token)
            .json(&serde_json::json!({ "content": text, "private": private }))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    pub async fn fetch_messages(&self, account_id: &str, conversation_id: &str, limit: u32) -> Result<Vec<CrmMessage>> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/accounts/{account_id}/conversations/{conversation_id}/messages?limit={limit}"
            )))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    pub async fn touch_conversation(&self, account_id: &str, conversation_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/accounts/{account_id}/conversations/{conversation_id}/update_last_seen")))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn get_conversation(&self, account_id: &str, conversation_id: &str) -> Result<Conversation> {
        let resp = self
            .http
            .get(self.url(&format!("/accounts/{account_id}/conversations/{conversation_id}")))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }
}
