//! Step identities and the fields each step reads and writes.
//!
//! The read/write declarations are what the orchestrator enforces when a
//! step's partial update is committed, and what the transition table's
//! static checks use to prove read-after-write ordering.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::state::Field;

/// A unit of work in the request pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    /// Classify the question as relevant or not to the database
    Routing,

    /// Answer an out-of-scope question directly
    GeneralReply,

    /// Rewrite the question into an unambiguous, SQL-friendly form
    Rewriting,

    /// Pick the tables the query needs
    TableSelection,

    /// Produce candidate SQL
    Generation,

    /// Run the safety policy over the candidate SQL
    Validation,

    /// Run the candidate SQL against the data store
    Execution,

    /// Turn rows (or an execution error) into a natural-language answer
    Synthesis,

    /// Decide whether the answer deserves a chart
    VisualizationPlanning,

    /// Build the chart spec
    VisualizationGeneration,
}

impl StepName {
    /// Every step, in graph order
    pub const ALL: [StepName; 10] = [
        StepName::Routing,
        StepName::GeneralReply,
        StepName::Rewriting,
        StepName::TableSelection,
        StepName::Generation,
        StepName::Validation,
        StepName::Execution,
        StepName::Synthesis,
        StepName::VisualizationPlanning,
        StepName::VisualizationGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Routing => "routing",
            StepName::GeneralReply => "general_reply",
            StepName::Rewriting => "rewriting",
            StepName::TableSelection => "table_selection",
            StepName::Generation => "generation",
            StepName::Validation => "validation",
            StepName::Execution => "execution",
            StepName::Synthesis => "synthesis",
            StepName::VisualizationPlanning => "visualization_planning",
            StepName::VisualizationGeneration => "visualization_generation",
        }
    }

    /// Fields that must hold a committed value before this step runs
    pub fn inputs(&self) -> &'static [Field] {
        match self {
            StepName::Routing | StepName::GeneralReply | StepName::Rewriting => {
                &[Field::OriginalQuery]
            }
            StepName::TableSelection => &[Field::OriginalQuery, Field::RefinedQuery],
            StepName::Generation => &[
                Field::OriginalQuery,
                Field::RefinedQuery,
                Field::SelectedTables,
                Field::RetryCount,
            ],
            StepName::Validation | StepName::Execution => &[Field::CandidateSql],
            StepName::Synthesis => &[
                Field::OriginalQuery,
                Field::CandidateSql,
                Field::ExecutionResult,
                Field::ExecutionError,
                Field::RetryCount,
            ],
            StepName::VisualizationPlanning => &[
                Field::OriginalQuery,
                Field::RefinedQuery,
                Field::ExecutionResult,
                Field::ExecutionError,
            ],
            StepName::VisualizationGeneration => &[
                Field::OriginalQuery,
                Field::RefinedQuery,
                Field::ExecutionResult,
                Field::ChartKind,
            ],
        }
    }

    /// Fields read only when an earlier attempt left them set
    pub fn feedback_inputs(&self) -> &'static [Field] {
        match self {
            StepName::Generation => &[Field::ValidationError, Field::ExecutionError],
            _ => &[],
        }
    }

    /// Fields this step owns and writes on every successful run
    /// (`logs` is open to every step)
    pub fn writes(&self) -> &'static [Field] {
        match self {
            StepName::Routing => &[Field::Relevance],
            StepName::GeneralReply | StepName::Synthesis => &[Field::FinalResponse],
            StepName::Rewriting => &[Field::RefinedQuery],
            StepName::TableSelection => &[Field::SelectedTables],
            StepName::Generation => &[Field::CandidateSql],
            StepName::Validation => &[Field::ValidationError, Field::ExecutionError],
            StepName::Execution => &[
                Field::ValidationError,
                Field::ExecutionError,
                Field::ExecutionResult,
            ],
            StepName::VisualizationPlanning => &[Field::NeedsVisualization, Field::ChartKind],
            StepName::VisualizationGeneration => &[Field::VisualizationSpec],
        }
    }

    /// Whether a step may commit the given field
    pub fn may_write(&self, field: Field) -> bool {
        field == Field::Logs || self.writes().contains(&field)
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepName::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown step '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_name_round_trips_through_str() {
        for step in StepName::ALL {
            assert_eq!(step.as_str().parse::<StepName>().unwrap(), step);
        }
        assert!("sql_generator".parse::<StepName>().is_err());
    }

    #[test]
    fn test_logs_are_writable_by_every_step() {
        for step in StepName::ALL {
            assert!(step.may_write(Field::Logs));
        }
    }

    #[test]
    fn test_retry_count_is_owned_by_no_step() {
        for step in StepName::ALL {
            assert!(!step.may_write(Field::RetryCount), "{} owns retry_count", step);
        }
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&StepName::VisualizationPlanning).unwrap();
        assert_eq!(json, "\"visualization_planning\"");
    }
}
