//! §3.1 Messaging tier data model: the shapes that cross the webhook → queue
//! → worker → flow boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw delivery from an external messaging channel, after signature
/// verification but before dedup/dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub idempotency_key: String,
    pub conversation_id: String,
    pub channel: String,
    pub sender: String,
    pub body: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// A history entry recorded by the Conversation History Cache (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistoryEntry {
    pub conversation_id: String,
    pub direction: Direction,
    pub body: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Per-conversation state owned by the Flow State Service (C9). Created on
/// first flow-initiating route, mutated by the handler on each message,
/// destroyed on the flow's terminal step or an explicit clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub conversation_id: String,
    pub flow_name: String,
    pub step: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The nine routing outcomes the Dispatcher (C8) can hand a job to. Each
/// variant carries exactly the data its handler needs; the wire payload
/// itself is serialized as `data` on the enqueued `Job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    SimpleReply { text: String },
    Greeting,
    Faq { topic: String },
    HandoffHuman { reason: String },
    EscalateFrustration { level: usize },
    FlowOrderCreate,
    FlowOrderStatus { order_id: Option<String> },
    FlowOrderModify { order_id: String },
    AgenticFlow { goal: String },
    /// Dispatch short-circuit, e.g. the sender is on the blocklist (§6.4).
    Drop { reason: String },
}

impl Route {
    pub fn name(&self) -> &'static str {
        match self {
            Route::SimpleReply { .. } => "simple_reply",
            Route::Greeting => "greeting",
            Route::Faq { .. } => "faq",
            Route::HandoffHuman { .. } => "handoff_human",
            Route::EscalateFrustration { .. } => "escalate_frustration",
            Route::FlowOrderCreate => "flow_order_create",
            Route::FlowOrderStatus { .. } => "flow_order_status",
            Route::FlowOrderModify { .. } => "flow_order_modify",
            Route::AgenticFlow { .. } => "agentic_flow",
            Route::Drop { .. } => "drop",
        }
    }
}
