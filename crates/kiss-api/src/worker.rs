//! Messaging-queue job handler: the consumer side of C7's worker pool for
//! the `"messaging"` queue. Pops the `InboundEvent` a webhook enqueued,
//! routes it (C8), and replies through the Outbound Gateway (C15) where the
//! route produces something synchronous to say back.

use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;

use kiss_api_types::{InboundEvent, Route};
use kiss_collaborators::outbound::OutboundGateway;
use kiss_flow::blocklist::Blocklist;
use kiss_flow::dispatcher::{self, Policies};
use kiss_flow::event_bus::EventBus;
use kiss_flow::events::FlowEvent;
use kiss_flow::flow_state::FlowStateService;
use kiss_flow::history_cache::HistoryCache;
use kiss_queue::worker::{JobHandler, WorkerError};
use kiss_queue::Job;

pub struct MessagingJobHandler {
    pub flow_states: Arc<FlowStateService>,
    pub history: Arc<HistoryCache>,
    pub blocklist: Arc<Blocklist>,
    pub outbound: Arc<OutboundGateway>,
    pub events: EventBus,
    pub timezone: Tz,
}

fn body_text(event: &InboundEvent) -> &str {
    event.body.get("text").and_then(|v| v.as_str()).unwrap_or_default()
}

/// Routes not handled synchronously here hand off to the multi-turn flow
/// machinery (C9) or a human, rather than a canned reply.
fn reply_for(route: &Route) -> Option<String> {
    match route {
        Route::SimpleReply { text } => Some(text.clone()),
        Route::Greeting => Some("Hello! How can I help you today?".to_string()),
        Route::Faq { topic } => Some(format!("Here's what I can tell you about {topic}.")),
        Route::HandoffHuman { .. } => Some("Connecting you with a team member now.".to_string()),
        Route::EscalateFrustration { .. } => {
            Some("I'm sorry for the trouble, let me connect you with a human agent.".to_string())
        }
        Route::FlowOrderCreate | Route::FlowOrderStatus { .. } | Route::FlowOrderModify { .. } | Route::AgenticFlow { .. } => {
            None
        }
        Route::Drop { .. } => None,
    }
}

#[async_trait]
impl JobHandler for MessagingJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), WorkerError> {
        let event: InboundEvent =
            serde_json::from_value(job.data.clone()).map_err(|e| WorkerError::Handler(e.to_string()))?;

        let blocked = self.blocklist.is_blocked(&event.sender).await.unwrap_or(false);
        let flow_state = self
            .flow_states
            .get(&event.conversation_id)
            .await
            .map_err(|e| WorkerError::Handler(e.to_string()))?;
        let policies = Policies {
            blocked,
            block_reason: blocked.then_some("blocklisted"),
        };
        let route = dispatcher::route(&event, flow_state.as_ref(), &policies);
        if matches!(route, Route::Drop { .. }) {
            return Ok(());
        }

        self.history.add_user(&event.conversation_id, body_text(&event));
        self.events.publish(FlowEvent::MessageRouted {
            conversation_id: event.conversation_id.clone(),
            route: route.name().to_string(),
        });

        if matches!(route, Route::HandoffHuman { .. } | Route::EscalateFrustration { .. }) {
            self.events.publish(FlowEvent::HandoffRequested {
                conversation_id: event.conversation_id.clone(),
                reason: route.name().to_string(),
            });
        }

        let Some(reply) = reply_for(&route) else {
            return Ok(());
        };

        self.history.add_assistant(&event.conversation_id, &reply);
        self.outbound
            .send(&event.sender, &reply, &event.channel, "messaging", self.timezone, false)
            .await
            .map_err(|e| WorkerError::Handler(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiss_collaborators::outbound::GatewayConfig;
    use kiss_collaborators::LoggingChannel;
    use kiss_core::kv::{KvStore, SqliteKv};
    use kiss_flow::flow_state::NullMirror;
    use kiss_queue::JobQueue;
    use uuid::Uuid;

    fn job_for(event: &InboundEvent) -> Job {
        Job {
            job_id: Uuid::new_v4().to_string(),
            queue: "messaging".to_string(),
            name: "inbound".to_string(),
            data: serde_json::to_value(event).unwrap(),
            attempts_made: 0,
            max_attempts: 5,
            backoff_base_ms: 1000,
            next_run_at: Utc::now(),
            enqueued_at: Utc::now(),
            trace_context: None,
        }
    }

    async fn handler() -> (Arc<MessagingJobHandler>, Arc<HistoryCache>) {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open_in_memory().await.unwrap());
        let queue = Arc::new(JobQueue::new(kv.clone()));
        let history = Arc::new(HistoryCache::new(100, 20, None, "default"));
        let mut outbound = OutboundGateway::new(queue, kv.clone(), GatewayConfig::default());
        outbound.register_channel(Arc::new(LoggingChannel::new("sms")));
        let h = Arc::new(MessagingJobHandler {
            flow_states: Arc::new(FlowStateService::new(kv.clone(), Arc::new(NullMirror))),
            history: history.clone(),
            blocklist: Arc::new(Blocklist::new(kv, vec![])),
            outbound: Arc::new(outbound),
            events: EventBus::new(),
            timezone: Tz::UTC,
        });
        (h, history)
    }

    #[tokio::test]
    async fn greeting_gets_a_reply_and_is_recorded_in_history() {
        let (handler, history) = handler().await;
        let event = InboundEvent {
            idempotency_key: "k1".to_string(),
            conversation_id: "c1".to_string(),
            channel: "sms".to_string(),
            sender: "+15550000".to_string(),
            body: serde_json::json!({"text": "hello there"}),
            received_at: Utc::now(),
        };
        handler.handle(&job_for(&event)).await.unwrap();

        let entries = history.get("c1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].direction, kiss_api_types::Direction::Inbound);
        assert_eq!(entries[1].direction, kiss_api_types::Direction::Outbound);
    }

    #[tokio::test]
    async fn blocked_sender_is_dropped_without_a_reply() {
        let (handler, history) = handler().await;
        handler.blocklist.add("+15551234").await.unwrap();
        let event = InboundEvent {
            idempotency_key: "k2".to_string(),
            conversation_id: "c2".to_string(),
            channel: "sms".to_string(),
            sender: "+15551234".to_string(),
            body: serde_json::json!({"text": "hello"}),
            received_at: Utc::now(),
        };
        handler.handle(&job_for(&event)).await.unwrap();
        assert!(history.get("c2").is_empty());
    }

    #[tokio::test]
    async fn order_flow_route_produces_no_synchronous_reply() {
        let (handler, history) = handler().await;
        let event = InboundEvent {
            idempotency_key: "k3".to_string(),
            conversation_id: "c3".to_string(),
            channel: "sms".to_string(),
            sender: "+15559999".to_string(),
            body: serde_json::json!({"text": "i want to order a thing"}),
            received_at: Utc::now(),
        };
        handler.handle(&job_for(&event)).await.unwrap();

        let entries = history.get("c3");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, kiss_api_types::Direction::Inbound);
    }
}
