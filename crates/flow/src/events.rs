//! Internal event types broadcast over [`crate::event_bus::EventBus`] and
//! surfaced as operator notifications (§7 "operators notified via an
//! alerting hook"). These are process-internal signals, distinct from the
//! wire-level [`kiss_api_types::CaseEvent`] that drives the case state
//! machine — a `FlowEvent::CaseTransitioned` is emitted *after* a
//! `CaseEvent` has already been applied.

use serde::{Deserialize, Serialize};

use kiss_api_types::{CaseState, Severity};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowEvent {
    MessageRouted {
        conversation_id: String,
        route: String,
    },
    HandoffRequested {
        conversation_id: String,
        reason: String,
    },
    RunCompleted {
        detector_id: String,
        run_id: String,
        findings: u32,
    },
    RunFailed {
        detector_id: String,
        run_id: String,
        error: String,
    },
    AlertRaised {
        alert_id: String,
        detector_id: String,
        severity: Severity,
    },
    CaseOpened {
        case_id: String,
    },
    CaseTransitioned {
        case_id: String,
        from: CaseState,
        to: CaseState,
    },
    ActionAwaitingApproval {
        action_id: String,
        action_type: String,
    },
    ActionExecuted {
        action_id: String,
        action_type: String,
    },
    JobDeadLettered {
        job_id: String,
        queue: String,
        attempts: u32,
    },
    OutboundDeferred {
        recipient: String,
        reason: String,
    },
}

impl FlowEvent {
    pub fn summary(&self) -> String {
        match self {
            FlowEvent::MessageRouted { conversation_id, route } => {
                format!("conversation {conversation_id} routed to {route}")
            }
            FlowEvent::HandoffRequested { conversation_id, reason } => {
                format!("conversation {conversation_id} handed off to a human: {reason}")
            }
            FlowEvent::RunCompleted { detector_id, findings, .. } => {
                format!("detector {detector_id} completed with {findings} finding(s)")
            }
            FlowEvent::RunFailed { detector_id, error, .. } => {
                format!("detector {detector_id} failed: {error}")
            }
            FlowEvent::AlertRaised { detector_id, severity, .. } => {
                format!("{severity:?} alert raised by {detector_id}")
            }
            FlowEvent::CaseOpened { case_id } => format!("case {case_id} opened"),
            FlowEvent::CaseTransitioned { case_id, from, to } => {
                format!("case {case_id} moved {from} -> {to}")
            }
            FlowEvent::ActionAwaitingApproval { action_id, action_type } => {
                format!("action {action_id} ({action_type}) awaiting approval")
            }
            FlowEvent::ActionExecuted { action_id, action_type } => {
                format!("action {action_id} ({action_type}) executed")
            }
            FlowEvent::JobDeadLettered { job_id, queue, attempts } => {
                format!("job {job_id} on {queue} dead-lettered after {attempts} attempts")
            }
            FlowEvent::OutboundDeferred { recipient, reason } => {
                format!("outbound to {recipient} deferred: {reason}")
            }
        }
    }
}
