//! C13 — Case State Machine.
//!
//! A validated transition table plus an append-only transition log. The
//! table is the single source of truth for which events are legal from
//! which state — callers never branch on state themselves.

use chrono::Utc;

use kiss_api_types::{CaseEvent, CaseState, TransitionRecord};

/// Errors raised while driving a [`CaseStateMachine`].
///
/// The state machine enforces the directed transition graph of the case
/// lifecycle (Open → Investigating → Diagnosed → ... → Closed, with a single
/// `Reopen` edge back to `Investigating`). This error indicates an attempt to
/// apply a [`CaseEvent`] that has no outgoing edge from the current state.
#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state} (legal events: {legal:?})")]
    InvalidTransition {
        state: CaseState,
        event: CaseEvent,
        legal: Vec<CaseEvent>,
    },
}

const EDGES: &[(CaseState, CaseEvent, CaseState)] = &[
    (CaseState::Open, CaseEvent::StartInvestigation, CaseState::Investigating),
    (CaseState::Open, CaseEvent::CloseAsNoise, CaseState::Closed),
    (CaseState::Investigating, CaseEvent::AddEvidence, CaseState::Investigating),
    (CaseState::Investigating, CaseEvent::NeedMoreInfo, CaseState::Investigating),
    (CaseState::Investigating, CaseEvent::Diagnose, CaseState::Diagnosed),
    (CaseState::Investigating, CaseEvent::CloseAsFalsePositive, CaseState::Closed),
    (CaseState::Diagnosed, CaseEvent::RecommendAction, CaseState::Recommended),
    (CaseState::Diagnosed, CaseEvent::CloseNoActionNeeded, CaseState::Closed),
    (CaseState::Recommended, CaseEvent::ApproveAction, CaseState::Approved),
    (CaseState::Recommended, CaseEvent::RejectAction, CaseState::Diagnosed),
    (CaseState::Recommended, CaseEvent::ModifyRecommendation, CaseState::Recommended),
    (CaseState::Approved, CaseEvent::StartExecution, CaseState::Executing),
    (CaseState::Approved, CaseEvent::Cancel, CaseState::Closed),
    (CaseState::Executing, CaseEvent::ExecutionSuccess, CaseState::Executed),
    (CaseState::Executing, CaseEvent::ExecutionFailed, CaseState::Approved),
    (CaseState::Executed, CaseEvent::StartMeasurement, CaseState::Measuring),
    (CaseState::Executed, CaseEvent::SkipMeasurement, CaseState::Closed),
    (CaseState::Measuring, CaseEvent::MeasurementComplete, CaseState::Measured),
    (CaseState::Measured, CaseEvent::CloseWithLearnings, CaseState::Closed),
    (CaseState::Closed, CaseEvent::Reopen, CaseState::Investigating),
];

fn legal_events(state: CaseState) -> Vec<CaseEvent> {
    EDGES.iter().filter(|(from, _, _)| *from == state).map(|(_, e, _)| *e).collect()
}

fn target(state: CaseState, event: CaseEvent) -> Option<CaseState> {
    EDGES.iter().find(|(from, ev, _)| *from == state && *ev == event).map(|(_, _, to)| *to)
}

#[derive(Debug, Clone)]
pub struct CaseStateMachine {
    case_id: String,
    current: CaseState,
    history: Vec<TransitionRecord>,
}

impl CaseStateMachine {
    /// Construct a machine for `case_id`, starting in `Open` per the data
    /// model's initial-state invariant.
    pub fn new(case_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            current: CaseState::Open,
            history: Vec::new(),
        }
    }

    /// Rehydrate a machine at a known current state (e.g. loaded from
    /// storage), with its transition history already appended.
    pub fn from_state(case_id: impl Into<String>, current: CaseState, history: Vec<TransitionRecord>) -> Self {
        Self {
            case_id: case_id.into(),
            current,
            history,
        }
    }

    pub fn state(&self) -> CaseState {
        self.current
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn can_transition(&self, event: CaseEvent) -> bool {
        target(self.current, event).is_some()
    }

    /// `transition(case, event, ctx)`: validates the edge, appends a
    /// `TransitionRecord`, updates `current`, and returns the new state.
    pub fn transition(
        &mut self,
        event: CaseEvent,
        actor: impl Into<String>,
        context: serde_json::Value,
    ) -> Result<CaseState, StateMachineError> {
        let Some(next) = target(self.current, event) else {
            return Err(StateMachineError::InvalidTransition {
                state: self.current,
                event,
                legal: legal_events(self.current),
            });
        };

        let record = TransitionRecord {
            case_id: self.case_id.clone(),
            from_state: self.current,
            to_state: next,
            event,
            actor: actor.into(),
            context,
            at: Utc::now(),
        };
        tracing::debug!(
            case_id = %self.case_id,
            from = %record.from_state,
            event = %event,
            to = %next,
            "case state transition"
        );
        self.current = next;
        self.history.push(record);
        Ok(next)
    }
}
