//! C8 — Dispatcher / Router (§4.8).
//!
//! `route` is a pure function: text heuristics plus `flow_state`, never the
//! language model. A non-empty `flow_state` pins the route to its
//! continuing flow unless the message is an explicit cancellation or
//! handoff request. The blocklist policy (§6.4) is consulted first and,
//! on a hit, short-circuits everything else to [`Route::Drop`].

use kiss_api_types::{FlowState, InboundEvent, Route};

const FRUSTRATION_MARKERS: &[&str] = &["this is ridiculous", "worst service", "absolutely furious", "done with this"];
const CANCEL_WORDS: &[&str] = &["cancel", "never mind", "nevermind", "stop"];
const HANDOFF_WORDS: &[&str] = &["talk to a human", "speak to a person", "representative", "agent please"];
const GREETING_WORDS: &[&str] = &["hi", "hello", "hey", "good morning", "good afternoon"];
const THANKS_WORDS: &[&str] = &["thanks", "thank you", "thx"];

/// Frustration signal: count of markers hit, 0-based. Anything >= 1 escalates.
const FRUSTRATION_THRESHOLD: usize = 1;

fn body_text(event: &InboundEvent) -> String {
    event
        .body
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_lowercase()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn frustration_level(text: &str) -> usize {
    FRUSTRATION_MARKERS.iter().filter(|m| text.contains(**m)).count()
}

/// FAQ keys recognized by canonical-question matching. A real deployment
/// would source these from the registry (§6.5); here they're the fixed set
/// this dispatcher understands without a language model.
fn faq_key(text: &str) -> Option<&'static str> {
    if text.contains("refund policy") || text.contains("how do refunds work") {
        Some("refund_policy")
    } else if text.contains("business hours") || text.contains("what time") {
        Some("business_hours")
    } else if text.contains("shipping time") || text.contains("how long does shipping take") {
        Some("shipping_time")
    } else {
        None
    }
}

fn continuing_flow_route(state: &FlowState) -> Option<Route> {
    match state.flow_name.as_str() {
        "order_create" => Some(Route::FlowOrderCreate),
        "order_status" => Some(Route::FlowOrderStatus { order_id: None }),
        "order_modify" => Some(Route::FlowOrderModify { order_id: state.conversation_id.clone() }),
        _ => None,
    }
}

pub struct Policies<'a> {
    pub blocked: bool,
    pub block_reason: Option<&'a str>,
}

/// Routes an inbound event given the conversation's current flow state (if
/// any) and the policies that must be consulted before anything else.
pub fn route(event: &InboundEvent, flow_state: Option<&FlowState>, policies: &Policies<'_>) -> Route {
    if policies.blocked {
        return Route::Drop {
            reason: policies.block_reason.unwrap_or("blocklisted").to_string(),
        };
    }

    let text = body_text(event);

    let explicit_cancel = contains_any(&text, CANCEL_WORDS);
    let explicit_handoff = contains_any(&text, HANDOFF_WORDS);

    if let Some(state) = flow_state {
        if !explicit_cancel && !explicit_handoff {
            if let Some(continuing) = continuing_flow_route(state) {
                return continuing;
            }
        }
    }

    if explicit_handoff {
        return Route::HandoffHuman {
            reason: "explicit request".to_string(),
        };
    }

    let level = frustration_level(&text);
    if level >= FRUSTRATION_THRESHOLD {
        return Route::EscalateFrustration { level };
    }

    if explicit_cancel {
        return Route::SimpleReply {
            text: "Okay, cancelled.".to_string(),
        };
    }

    if contains_any(&text, THANKS_WORDS) {
        return Route::SimpleReply {
            text: "You're welcome!".to_string(),
        };
    }

    if let Some(key) = faq_key(&text) {
        return Route::Faq { topic: key.to_string() };
    }

    if text.contains("order status") || text.contains("where is my order") || text.contains("track my order") {
        return Route::FlowOrderStatus { order_id: None };
    }
    if text.contains("change my order") || text.contains("modify order") {
        return Route::FlowOrderModify {
            order_id: event.conversation_id.clone(),
        };
    }
    if text.contains("place an order") || text.contains("i want to order") || text.contains("buy") {
        return Route::FlowOrderCreate;
    }

    if flow_state.is_none() && contains_any(&text, GREETING_WORDS) {
        return Route::Greeting;
    }

    Route::AgenticFlow {
        goal: text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(text: &str) -> InboundEvent {
        InboundEvent {
            idempotency_key: "k1".to_string(),
            conversation_id: "c1".to_string(),
            channel: "sms".to_string(),
            sender: "+1555".to_string(),
            body: serde_json::json!({ "text": text }),
            received_at: Utc::now(),
        }
    }

    fn no_policy() -> Policies<'static> {
        Policies { blocked: false, block_reason: None }
    }

    #[test]
    fn blocklist_hit_short_circuits_to_drop() {
        let policies = Policies { blocked: true, block_reason: Some("spam") };
        let r = route(&event("hello"), None, &policies);
        assert!(matches!(r, Route::Drop { reason } if reason == "spam"));
    }

    #[test]
    fn greeting_with_no_state_routes_greeting() {
        let r = route(&event("hey there"), None, &no_policy());
        assert!(matches!(r, Route::Greeting));
    }

    #[test]
    fn frustration_marker_escalates() {
        let r = route(&event("this is ridiculous, fix it now"), None, &no_policy());
        assert!(matches!(r, Route::EscalateFrustration { level } if level >= 1));
    }

    #[test]
    fn explicit_handoff_wins_over_continuing_flow() {
        let state = FlowState {
            conversation_id: "c1".to_string(),
            flow_name: "order_create".to_string(),
            step: "collect_items".to_string(),
            data: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let r = route(&event("let me talk to a human"), Some(&state), &no_policy());
        assert!(matches!(r, Route::HandoffHuman { .. }));
    }

    #[test]
    fn non_empty_flow_state_pins_continuing_route() {
        let state = FlowState {
            conversation_id: "c1".to_string(),
            flow_name: "order_create".to_string(),
            step: "collect_items".to_string(),
            data: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let r = route(&event("two shirts please"), Some(&state), &no_policy());
        assert!(matches!(r, Route::FlowOrderCreate));
    }

    #[test]
    fn cancel_during_flow_breaks_out() {
        let state = FlowState {
            conversation_id: "c1".to_string(),
            flow_name: "order_create".to_string(),
            step: "collect_items".to_string(),
            data: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let r = route(&event("never mind, cancel"), Some(&state), &no_policy());
        assert!(matches!(r, Route::SimpleReply { .. }));
    }

    #[test]
    fn faq_question_matches() {
        let r = route(&event("what is your refund policy?"), None, &no_policy());
        assert!(matches!(r, Route::Faq { topic } if topic == "refund_policy"));
    }

    #[test]
    fn unmatched_text_falls_to_agentic_flow() {
        let r = route(&event("can you help me plan a birthday party"), None, &no_policy());
        assert!(matches!(r, Route::AgenticFlow { .. }));
    }
}
