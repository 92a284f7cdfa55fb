//! §6.2 Payment provider collaborators.
//!
//! Two providers behind the same trait. Webhook signature verification MUST
//! run against the raw, unmodified request body — the caller is responsible
//! for not letting JSON-re-serializing middleware touch that route; this
//! module only ever sees `&[u8]`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("payment provider API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("malformed webhook body: {0}")]
    MalformedBody(String),
}

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentHandle {
    pub provider: String,
    pub url: String,
    pub external_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Expired,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentStatusReport {
    pub status: PaymentStatus,
    pub amount_cents: i64,
    pub external_reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub external_id: String,
    pub status: PaymentStatus,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;
    /// The per-provider secret webhook callers are verified against. Only
    /// ever set from server-side config, never from anything in the request.
    fn webhook_secret(&self) -> &str;
    async fn create_payment(&self, order: &OrderRequest) -> Result<PaymentHandle>;
    async fn get_status(&self, external_id: &str) -> Result<PaymentStatusReport>;

    /// Verifies an HMAC-SHA256 signature over the raw body, then parses it.
    /// Uses constant-time comparison to avoid timing side channels.
    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str, secret: &str) -> Result<WebhookEvent> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(raw_body);
        let expected = mac.finalize().into_bytes();
        let expected_hex = hex_encode(&expected);

        if expected_hex.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() != 1 {
            return Err(PaymentError::InvalidSignature);
        }

        let raw: serde_json::Value =
            serde_json::from_slice(raw_body).map_err(|e| PaymentError::MalformedBody(e.to_string()))?;
        let external_id = raw["external_id"].as_str().unwrap_or_default().to_string();
        let status = match raw["status"].as_str().unwrap_or("pending") {
            "paid" => PaymentStatus::Paid,
            "expired" => PaymentStatus::Expired,
            "failed" => PaymentStatus::Failed,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        };
        Ok(WebhookEvent { external_id, status, raw })
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct RestPaymentProvider {
    name: String,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    webhook_secret: String,
}

impl RestPaymentProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            webhook_secret: webhook_secret.into(),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(PaymentError::Api { status, body })
        }
    }
}

#[async_trait]
impl PaymentProvider for RestPaymentProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    async fn create_payment(&self, order: &OrderRequest) -> Result<PaymentHandle> {
        let resp = self
            .http
            .post(format!("{}/payments", self.base_url))
            .bearer_auth(&self.api_key)
            .json(order)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    async fn get_status(&self, external_id: &str) -> Result<PaymentStatusReport> {
        let resp = self
            .http
            .get(format!("{}/payments/{external_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_parses_event() {
        let provider = RestPaymentProvider::new("stripe-like", "https://example.test", "key", "whsec_test");
        let body = br#"{"external_id":"ext-1","status":"paid"}"#;
        let mut mac = HmacSha256::new_from_slice(b"whsec_test").unwrap();
        mac.update(body);
        let sig = hex_encode(&mac.finalize().into_bytes());

        let event = provider.verify_webhook_signature(body, &sig, provider.webhook_secret()).unwrap();
        assert_eq!(event.external_id, "ext-1");
        assert_eq!(event.status, PaymentStatus::Paid);
    }

    #[test]
    fn tampered_body_rejected() {
        let provider = RestPaymentProvider::new("stripe-like", "https://example.test", "key", "whsec_test");
        let body = br#"{"external_id":"ext-1","status":"paid"}"#;
        let mut mac = HmacSha256::new_from_slice(b"whsec_test").unwrap();
        mac.update(body);
        let sig = hex_encode(&mac.finalize().into_bytes());

        let tampered = br#"{"external_id":"ext-1","status":"refunded"}"#;
        let result = provider.verify_webhook_signature(tampered, &sig, provider.webhook_secret());
        assert!(matches!(result, Err(PaymentError::InvalidSignature)));
    }

    #[test]
    fn wrong_secret_from_an_untrusted_source_is_rejected() {
        let provider = RestPaymentProvider::new("stripe-like", "https://example.test", "key", "whsec_test");
        let body = br#"{"external_id":"ext-1","status":"paid"}"#;
        let mut forged_mac = HmacSha256::new_from_slice(b"attacker_chosen_secret").unwrap();
        forged_mac.update(body);
        let forged_sig = hex_encode(&forged_mac.finalize().into_bytes());

        let result = provider.verify_webhook_signature(body, &forged_sig, provider.webhook_secret());
        assert!(matches!(result, Err(PaymentError::InvalidSignature)));
    }
}
