//! Progress events emitted while a request moves through the step graph.
//!
//! Every request produces exactly one `Start`, then zero or more
//! `StepUpdate`/`TokenChunk` events in emission order, then exactly one
//! closing event: `End`, or `Failure` when an infrastructure error reached
//! the terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::StateUpdate;
use super::step::StepName;

/// A single event on the progress stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The request was accepted and the graph is about to run
    Start {
        request_id: Uuid,
        thread_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A step completed; carries only the fields it (and its transition) wrote
    StepUpdate {
        step: StepName,
        update: StateUpdate,
        duration_ms: u64,
    },

    /// Incremental text from a step that streams generation
    #[serde(rename = "token")]
    TokenChunk { step: StepName, text: String },

    /// The graph reached a terminal state
    End { outcome: Outcome, retry_count: u32 },

    /// An infrastructure failure ended the request
    Failure { kind: FailureKind, message: String },
}

impl ProgressEvent {
    /// Whether this event closes the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::End { .. } | ProgressEvent::Failure { .. })
    }
}

/// The authoritative answer: the last `StepUpdate` carrying `final_response`
pub fn final_response(events: &[ProgressEvent]) -> Option<&str> {
    events.iter().rev().find_map(|event| match event {
        ProgressEvent::StepUpdate { update, .. } => update.final_response.as_deref(),
        _ => None,
    })
}

/// How a request that reached `End` concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Query executed and the answer was synthesized from its rows
    Answered,

    /// The question was outside the database's scope
    OutOfScope,

    /// Every generation attempt failed the safety policy
    ValidationExhausted,

    /// Execution kept failing; the answer explains the last error
    ExecutionExhausted,
}

/// Classification of a request-ending failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A collaborator was unreachable or returned malformed output
    Infrastructure,

    /// A step exceeded its time limit
    Timeout,

    /// The orchestrator caught a broken step (bad write, panic)
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event = ProgressEvent::TokenChunk {
            step: StepName::Synthesis,
            text: "The top".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "token", "step": "synthesis", "text": "The top"})
        );

        let end = ProgressEvent::End {
            outcome: Outcome::Answered,
            retry_count: 1,
        };
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            json!({"type": "end", "outcome": "answered", "retry_count": 1})
        );
    }

    #[test]
    fn test_terminal_events() {
        let failure = ProgressEvent::Failure {
            kind: FailureKind::Timeout,
            message: "step 'rewriting' timed out".to_string(),
        };
        assert!(failure.is_terminal());

        let update = ProgressEvent::StepUpdate {
            step: StepName::Routing,
            update: StateUpdate::new(),
            duration_ms: 3,
        };
        assert!(!update.is_terminal());
    }

    #[test]
    fn test_final_response_takes_last_update() {
        let events = vec![
            ProgressEvent::StepUpdate {
                step: StepName::Synthesis,
                update: StateUpdate {
                    final_response: Some("draft".to_string()),
                    ..Default::default()
                },
                duration_ms: 10,
            },
            ProgressEvent::TokenChunk {
                step: StepName::Synthesis,
                text: "ignored".to_string(),
            },
            ProgressEvent::StepUpdate {
                step: StepName::VisualizationPlanning,
                update: StateUpdate::new(),
                duration_ms: 1,
            },
        ];
        assert_eq!(final_response(&events), Some("draft"));
        assert_eq!(final_response(&[]), None);
    }
}
