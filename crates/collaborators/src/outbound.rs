//! C15 — Outbound Gateway (§4.14).
//!
//! `send(recipient, message, channel)` runs three gates before emission:
//! opt-out, quiet hours, daily cap. A quiet-hours hit doesn't fail the send —
//! it reschedules it past the window end via a C5 delayed job on the
//! `"outbound"` queue, to be retried by a worker that calls [`OutboundGateway::send`]
//! again with `bypass_quiet_hours: true`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use kiss_core::kv::{KvError, KvStore};
use kiss_core::ratelimit::RateLimiter;
use kiss_queue::{AddOptions, JobQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("rate limit error: {0}")]
    RateLimit(#[from] kiss_core::ratelimit::RateLimitError),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub sent: bool,
    pub reason: Option<String>,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, recipient: &str, message: &str) -> std::result::Result<(), String>;
}

/// Fallback channel for a name with no real provider wired in yet: logs the
/// delivery instead of dropping it silently. A deployment replaces this with
/// a real SMS/chat provider per channel name by registering over it.
pub struct LoggingChannel {
    channel_name: &'static str,
}

impl LoggingChannel {
    pub fn new(channel_name: &'static str) -> Self {
        Self { channel_name }
    }
}

#[async_trait]
impl Channel for LoggingChannel {
    fn name(&self) -> &'static str {
        self.channel_name
    }

    async fn deliver(&self, recipient: &str, message: &str) -> std::result::Result<(), String> {
        tracing::info!(channel = self.channel_name, recipient, message, "outbound delivery (logging channel)");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Local hour (0-23) quiet hours begin.
    pub quiet_hours_start: u32,
    /// Local hour (0-23) quiet hours end.
    pub quiet_hours_end: u32,
    pub daily_cap: i64,
    pub outbound_queue: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            quiet_hours_start: 21,
            quiet_hours_end: 8,
            daily_cap: 5,
            outbound_queue: "outbound".to_string(),
        }
    }
}

pub struct OutboundGateway {
    channels: HashMap<String, Arc<dyn Channel>>,
    queue: Arc<JobQueue>,
    rate_limiter: RateLimiter,
    kv: Arc<dyn KvStore>,
    config: GatewayConfig,
}

fn in_quiet_hours(local_hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        local_hour >= start && local_hour < end
    } else {
        // Window wraps midnight, e.g. 21:00-08:00.
        local_hour >= start || local_hour < end
    }
}

impl OutboundGateway {
    pub fn new(queue: Arc<JobQueue>, kv: Arc<dyn KvStore>, config: GatewayConfig) -> Self {
        Self {
            channels: HashMap::new(),
            rate_limiter: RateLimiter::new(kv.clone()),
            queue,
            kv,
            config,
        }
    }

    pub fn register_channel(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    fn opt_out_key(category: &str, recipient: &str) -> String {
        format!("optout:{category}:{recipient}")
    }

    /// Records an opt-out for `recipient` in `category`. Persists forever
    /// (a ten-year TTL) until an explicit opt-in clears it.
    pub async fn record_opt_out(&self, category: &str, recipient: &str) -> Result<(), GatewayError> {
        self.kv
            .set_with_ttl(&Self::opt_out_key(category, recipient), "1", Duration::from_secs(10 * 365 * 24 * 3600))
            .await?;
        Ok(())
    }

    pub async fn clear_opt_out(&self, category: &str, recipient: &str) -> Result<(), GatewayError> {
        self.kv.set_with_ttl(&Self::opt_out_key(category, recipient), "", Duration::from_secs(0)).await?;
        Ok(())
    }

    pub async fn send(
        &self,
        recipient: &str,
        message: &str,
        channel: &str,
        category: &str,
        timezone: Tz,
        bypass_quiet_hours: bool,
    ) -> Result<SendOutcome, GatewayError> {
        if self.kv.get(&Self::opt_out_key(category, recipient)).await?.is_some() {
            tracing::info!(recipient, category, "outbound dropped: recipient opted out");
            return Ok(SendOutcome {
                sent: false,
                reason: Some("opted_out".to_string()),
            });
        }

        if !bypass_quiet_hours {
            let local_hour = Utc::now().with_timezone(&timezone).hour();
            if in_quiet_hours(local_hour, self.config.quiet_hours_start, self.config.quiet_hours_end) {
                let delay = self.delay_until_window_end(timezone);
                self.queue
                    .add(
                        &self.config.outbound_queue,
                        "send",
                        serde_json::json!({
                            "recipient": recipient,
                            "message": message,
                            "channel": channel,
                            "category": category,
                        }),
                        AddOptions {
                            delay: Some(delay),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(SendOutcome {
                    sent: false,
                    reason: Some("deferred_quiet_hours".to_string()),
                });
            }
        }

        let decision = self
            .rate_limiter
            .check(&format!("outbound:{recipient}"), self.config.daily_cap, Duration::from_secs(86400))
            .await?;
        if !decision.allowed {
            tracing::info!(recipient, "outbound dropped: daily cap exceeded");
            return Ok(SendOutcome {
                sent: false,
                reason: Some("daily_cap_exceeded".to_string()),
            });
        }

        let Some(ch) = self.channels.get(channel) else {
            return Err(GatewayError::UnknownChannel(channel.to_string()));
        };

        match ch.deliver(recipient, message).await {
            Ok(()) => Ok(SendOutcome { sent: true, reason: None }),
            Err(e) => Ok(SendOutcome { sent: false, reason: Some(e) }),
        }
    }

    fn delay_until_window_end(&self, timezone: Tz) -> Duration {
        let now = Utc::now().with_timezone(&timezone);
        let end_hour = self.config.quiet_hours_end;
        let mut candidate = timezone
            .with_ymd_and_hms(now.year(), now.month(), now.day(), end_hour, 0, 0)
            .single()
            .unwrap_or(now);
        if candidate <= now {
            candidate += chrono::Duration::days(1);
        }
        (candidate.with_timezone(&Utc) - now.with_timezone(&Utc)).to_std().unwrap_or(Duration::from_secs(3600))
    }
}
