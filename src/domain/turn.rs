//! Finished requests, as remembered by a conversation thread.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::events::{FailureKind, Outcome};
use super::state::RequestState;
use super::step::StepName;

/// One question and what became of it
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub request_id: Uuid,

    /// The question as asked
    pub query: String,

    /// Answer shown to the user, if one was produced
    pub response: Option<String>,

    /// Last candidate SQL (empty when no SQL was generated)
    pub sql: String,

    pub status: TurnStatus,
    pub retry_count: u32,

    /// Steps in execution order
    pub steps: Vec<StepName>,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl Turn {
    /// Snapshot a request that has stopped advancing
    pub fn from_state(state: &RequestState, status: TurnStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            request_id: state.request_id,
            query: state.original_query.clone(),
            response: state.final_response.clone(),
            sql: state.candidate_sql.clone(),
            status,
            retry_count: state.retry_count,
            steps: state.steps.clone(),
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn is_answered(&self) -> bool {
        matches!(
            self.status,
            TurnStatus::Completed {
                outcome: Outcome::Answered
            }
        )
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TurnStatus {
    /// Reached `End`
    Completed { outcome: Outcome },

    /// Reached `Failure`
    Failed { kind: FailureKind, message: String },

    /// The caller went away before a terminal event
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_snapshot() {
        let mut state = RequestState::new("thread-1", "how many tracks?");
        state.candidate_sql = "SELECT COUNT(*) FROM Track".to_string();
        state.final_response = Some("There are 3503 tracks.".to_string());
        state.steps = vec![StepName::Routing, StepName::Rewriting];

        let turn = Turn::from_state(
            &state,
            TurnStatus::Completed {
                outcome: Outcome::Answered,
            },
            Utc::now(),
        );

        assert!(turn.is_answered());
        assert_eq!(turn.query, "how many tracks?");
        assert_eq!(turn.steps.len(), 2);
        assert!(turn.completed_at >= turn.started_at);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(TurnStatus::Failed {
            kind: FailureKind::Infrastructure,
            message: "llm unavailable".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "infrastructure");
    }
}
