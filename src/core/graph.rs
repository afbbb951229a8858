//! The step graph as a static transition table.
//!
//! Each step owns an ordered list of edges. An edge fires when every one of
//! its conditions holds; the first edge that fires wins, and the last edge of
//! every step is an unconditional fallback. Retry accounting and the
//! exhaustion message are edge effects applied by the orchestrator, so no
//! step ever writes `retry_count`.
//!
//! [`TransitionTable::validate`] checks the table before any request runs:
//! every step has a fallback, every step is reachable and can terminate,
//! every cycle consumes retry budget, and every declared input is written on
//! all paths leading to the step that reads it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::policy::Policy;
use crate::domain::{Field, Relevance, RequestState, StateUpdate, StepName};

/// A predicate over committed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Routing classified the question as out of scope
    Irrelevant,
    /// The last validation produced no error
    SqlAccepted,
    /// The last execution produced an error
    ExecutionFailed,
    /// The last execution produced no error
    ExecutionSucceeded,
    /// `retry_count` is below the policy ceiling
    RetryBudgetLeft,
    /// The planner asked for a chart
    ChartRequested,
    /// Execution returned at least one row
    HasRows,
}

impl Condition {
    pub fn holds(&self, state: &RequestState, policy: &Policy) -> bool {
        match self {
            Condition::Irrelevant => state.relevance == Relevance::Irrelevant,
            Condition::SqlAccepted => state.validation_error.is_none(),
            Condition::ExecutionFailed => state.execution_error.is_some(),
            Condition::ExecutionSucceeded => state.execution_error.is_none(),
            Condition::RetryBudgetLeft => policy.has_retry_budget(state.retry_count),
            Condition::ChartRequested => state.needs_visualization,
            Condition::HasRows => !state.execution_result.is_empty(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Irrelevant => "irrelevant",
            Condition::SqlAccepted => "sql_accepted",
            Condition::ExecutionFailed => "execution_failed",
            Condition::ExecutionSucceeded => "execution_succeeded",
            Condition::RetryBudgetLeft => "retry_budget_left",
            Condition::ChartRequested => "chart_requested",
            Condition::HasRows => "has_rows",
        }
    }
}

/// State changes owned by the transition rather than the step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    None,
    /// Spend one retry
    ConsumeRetry,
    /// Explain to the user why no safe query could be produced
    ExplainExhaustion,
}

impl Effect {
    /// The update this effect contributes, given the state it fires on
    pub fn update(&self, state: &RequestState) -> StateUpdate {
        match self {
            Effect::None => StateUpdate::new(),
            Effect::ConsumeRetry => StateUpdate {
                retry_count: Some(state.retry_count + 1),
                ..Default::default()
            },
            Effect::ExplainExhaustion => StateUpdate {
                final_response: Some(exhaustion_message(state)),
                ..Default::default()
            },
        }
    }
}

fn exhaustion_message(state: &RequestState) -> String {
    let attempts = state.retry_count + 1;
    let reason = state
        .validation_error
        .as_deref()
        .unwrap_or("the generated query was not accepted");
    format!(
        "I couldn't produce a safe, read-only query for your question after {} attempt{}. \
         The last attempt was rejected because: {} Try rephrasing the question.",
        attempts,
        if attempts == 1 { "" } else { "s" },
        reason
    )
}

/// Why the graph stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exit {
    Completed,
    RetriesExhausted,
}

/// Where an edge leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Step(StepName),
    Terminal(Exit),
}

impl fmt::Display for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Next::Step(step) => write!(f, "{}", step),
            Next::Terminal(Exit::Completed) => f.write_str("END"),
            Next::Terminal(Exit::RetriesExhausted) => f.write_str("END (retries exhausted)"),
        }
    }
}

/// One conditional transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Conjunction of conditions; empty means unconditional
    pub when: &'static [Condition],
    pub to: Next,
    pub effect: Effect,
}

impl Edge {
    pub fn is_fallback(&self) -> bool {
        self.when.is_empty()
    }

    pub fn fires(&self, state: &RequestState, policy: &Policy) -> bool {
        self.when.iter().all(|condition| condition.holds(state, policy))
    }
}

const fn to(step: StepName) -> Edge {
    Edge {
        when: &[],
        to: Next::Step(step),
        effect: Effect::None,
    }
}

const DONE: Edge = Edge {
    when: &[],
    to: Next::Terminal(Exit::Completed),
    effect: Effect::None,
};

const STANDARD: &[(StepName, &[Edge])] = &[
    (
        StepName::Routing,
        &[
            Edge {
                when: &[Condition::Irrelevant],
                to: Next::Step(StepName::GeneralReply),
                effect: Effect::None,
            },
            to(StepName::Rewriting),
        ],
    ),
    (StepName::GeneralReply, &[DONE]),
    (StepName::Rewriting, &[to(StepName::TableSelection)]),
    (StepName::TableSelection, &[to(StepName::Generation)]),
    (StepName::Generation, &[to(StepName::Validation)]),
    (
        StepName::Validation,
        &[
            Edge {
                when: &[Condition::SqlAccepted],
                to: Next::Step(StepName::Execution),
                effect: Effect::None,
            },
            Edge {
                when: &[Condition::RetryBudgetLeft],
                to: Next::Step(StepName::Generation),
                effect: Effect::ConsumeRetry,
            },
            Edge {
                when: &[],
                to: Next::Terminal(Exit::RetriesExhausted),
                effect: Effect::ExplainExhaustion,
            },
        ],
    ),
    (
        StepName::Execution,
        &[
            Edge {
                when: &[Condition::ExecutionFailed, Condition::RetryBudgetLeft],
                to: Next::Step(StepName::Generation),
                effect: Effect::ConsumeRetry,
            },
            to(StepName::Synthesis),
        ],
    ),
    (StepName::Synthesis, &[to(StepName::VisualizationPlanning)]),
    (
        StepName::VisualizationPlanning,
        &[
            Edge {
                when: &[
                    Condition::ChartRequested,
                    Condition::HasRows,
                    Condition::ExecutionSucceeded,
                ],
                to: Next::Step(StepName::VisualizationGeneration),
                effect: Effect::None,
            },
            DONE,
        ],
    ),
    (StepName::VisualizationGeneration, &[DONE]),
];

/// Structural or dataflow defect in a transition table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("step '{0}' has no transitions")]
    MissingStep(StepName),

    #[error("step '{0}' appears more than once")]
    DuplicateStep(StepName),

    #[error("step '{0}' has no unconditional fallback edge")]
    NoFallback(StepName),

    #[error("edge {index} of step '{step}' follows the fallback and can never fire")]
    UnreachableEdge { step: StepName, index: usize },

    #[error("step '{0}' cannot be reached from the entry step")]
    UnreachableStep(StepName),

    #[error("step '{0}' has no path to a terminal state")]
    NoExit(StepName),

    #[error("cycle through step '{0}' does not consume retry budget")]
    UnboundedCycle(StepName),

    #[error("edge out of step '{0}' consumes a retry without checking the budget")]
    UnguardedRetry(StepName),

    #[error("step '{step}' reads '{field}', which is not written on every path to it")]
    UnwrittenInput { step: StepName, field: Field },

    #[error("step '{step}' reads feedback '{field}', which no earlier step writes")]
    OrphanFeedback { step: StepName, field: Field },
}

/// The static step graph
#[derive(Debug, Clone, Copy)]
pub struct TransitionTable {
    entries: &'static [(StepName, &'static [Edge])],
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl TransitionTable {
    /// Where every request starts
    pub const ENTRY: StepName = StepName::Routing;

    /// The NL-to-SQL pipeline
    pub fn standard() -> Self {
        Self { entries: STANDARD }
    }

    /// A custom table; call [`validate`](Self::validate) before use
    pub fn from_entries(entries: &'static [(StepName, &'static [Edge])]) -> Self {
        Self { entries }
    }

    pub fn edges(&self, step: StepName) -> Option<&'static [Edge]> {
        self.entries
            .iter()
            .find(|(name, _)| *name == step)
            .map(|(_, edges)| *edges)
    }

    /// The first edge out of `step` whose conditions hold
    pub fn next(&self, step: StepName, state: &RequestState, policy: &Policy) -> Option<&'static Edge> {
        self.edges(step)?
            .iter()
            .find(|edge| edge.fires(state, policy))
    }

    fn successors(&self, step: StepName) -> impl Iterator<Item = (StepName, &'static Edge)> + '_ {
        self.edges(step)
            .unwrap_or(&[])
            .iter()
            .filter_map(move |edge| match edge.to {
                Next::Step(next) => Some((next, edge)),
                Next::Terminal(_) => None,
            })
    }

    /// Run every structural and dataflow check
    pub fn validate(&self) -> Result<(), GraphError> {
        self.check_structure()?;
        self.check_reachability()?;
        self.check_termination()?;
        self.check_dataflow()?;
        Ok(())
    }

    fn check_structure(&self) -> Result<(), GraphError> {
        let mut seen = BTreeSet::new();
        for (step, _) in self.entries {
            if !seen.insert(*step) {
                return Err(GraphError::DuplicateStep(*step));
            }
        }

        for step in StepName::ALL {
            let edges = self.edges(step).ok_or(GraphError::MissingStep(step))?;

            let fallback = edges
                .iter()
                .position(Edge::is_fallback)
                .ok_or(GraphError::NoFallback(step))?;
            if fallback + 1 < edges.len() {
                return Err(GraphError::UnreachableEdge {
                    step,
                    index: fallback + 1,
                });
            }

            let unguarded = edges.iter().any(|edge| {
                edge.effect == Effect::ConsumeRetry
                    && !edge.when.contains(&Condition::RetryBudgetLeft)
            });
            if unguarded {
                return Err(GraphError::UnguardedRetry(step));
            }
        }
        Ok(())
    }

    fn check_reachability(&self) -> Result<(), GraphError> {
        let mut reached = BTreeSet::from([Self::ENTRY]);
        let mut frontier = vec![Self::ENTRY];
        while let Some(step) = frontier.pop() {
            for (next, _) in self.successors(step) {
                if reached.insert(next) {
                    frontier.push(next);
                }
            }
        }

        match StepName::ALL.iter().find(|step| !reached.contains(*step)) {
            Some(step) => Err(GraphError::UnreachableStep(*step)),
            None => Ok(()),
        }
    }

    fn check_termination(&self) -> Result<(), GraphError> {
        // Backward fixpoint: a step exits if any edge leads to a terminal or
        // to a step that exits.
        let mut exits: BTreeSet<StepName> = BTreeSet::new();
        loop {
            let before = exits.len();
            for step in StepName::ALL {
                let leads_out = self.edges(step).unwrap_or(&[]).iter().any(|edge| match edge.to {
                    Next::Terminal(_) => true,
                    Next::Step(next) => exits.contains(&next),
                });
                if leads_out {
                    exits.insert(step);
                }
            }
            if exits.len() == before {
                break;
            }
        }
        if let Some(step) = StepName::ALL.iter().find(|step| !exits.contains(*step)) {
            return Err(GraphError::NoExit(*step));
        }

        // With retry-consuming edges removed the graph must be acyclic, so
        // every loop is bounded by the retry ceiling.
        let mut marks: BTreeMap<StepName, Mark> = BTreeMap::new();
        for step in StepName::ALL {
            self.find_free_cycle(step, &mut marks)?;
        }
        Ok(())
    }

    fn find_free_cycle(
        &self,
        step: StepName,
        marks: &mut BTreeMap<StepName, Mark>,
    ) -> Result<(), GraphError> {
        match marks.get(&step) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Active) => return Err(GraphError::UnboundedCycle(step)),
            None => {}
        }
        marks.insert(step, Mark::Active);
        for (next, edge) in self.successors(step) {
            if edge.effect != Effect::ConsumeRetry {
                self.find_free_cycle(next, marks)?;
            }
        }
        marks.insert(step, Mark::Done);
        Ok(())
    }

    fn check_dataflow(&self) -> Result<(), GraphError> {
        // Forward must-write analysis: a field is available at a step when
        // every path from the entry writes it first.
        let everything: BTreeSet<Field> = all_fields();
        let mut available: BTreeMap<StepName, BTreeSet<Field>> = StepName::ALL
            .iter()
            .map(|step| (*step, everything.clone()))
            .collect();
        available.insert(Self::ENTRY, Field::INITIAL.iter().copied().collect());

        loop {
            let mut changed = false;
            for step in StepName::ALL {
                let mut out = available[&step].clone();
                out.extend(step.writes().iter().copied());
                for (next, _) in self.successors(step) {
                    if next == Self::ENTRY {
                        continue;
                    }
                    let narrowed: BTreeSet<Field> =
                        available[&next].intersection(&out).copied().collect();
                    if narrowed != available[&next] {
                        available.insert(next, narrowed);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for step in StepName::ALL {
            if let Some(field) = step
                .inputs()
                .iter()
                .find(|field| !available[&step].contains(*field))
            {
                return Err(GraphError::UnwrittenInput {
                    step,
                    field: *field,
                });
            }

            for field in step.feedback_inputs() {
                let written_upstream = StepName::ALL.iter().any(|writer| {
                    writer.writes().contains(field) && self.leads_to(*writer, step)
                });
                if !written_upstream {
                    return Err(GraphError::OrphanFeedback {
                        step,
                        field: *field,
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether some non-empty path leads from `from` to `to`
    fn leads_to(&self, from: StepName, to: StepName) -> bool {
        let mut seen = BTreeSet::new();
        let mut frontier: Vec<StepName> = self.successors(from).map(|(next, _)| next).collect();
        while let Some(step) = frontier.pop() {
            if step == to {
                return true;
            }
            if seen.insert(step) {
                frontier.extend(self.successors(step).map(|(next, _)| next));
            }
        }
        false
    }

    /// Human-readable listing of every edge
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (step, edges) in self.entries {
            for edge in *edges {
                let guard = if edge.is_fallback() {
                    "otherwise".to_string()
                } else {
                    edge.when
                        .iter()
                        .map(Condition::as_str)
                        .collect::<Vec<_>>()
                        .join(" && ")
                };
                let effect = match edge.effect {
                    Effect::None => String::new(),
                    Effect::ConsumeRetry => "  [retry_count += 1]".to_string(),
                    Effect::ExplainExhaustion => "  [explain exhaustion]".to_string(),
                };
                out.push_str(&format!(
                    "{:<26} --[{}]--> {}{}\n",
                    step.as_str(),
                    guard,
                    edge.to,
                    effect
                ));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Active,
    Done,
}

fn all_fields() -> BTreeSet<Field> {
    [
        Field::OriginalQuery,
        Field::RefinedQuery,
        Field::Relevance,
        Field::SelectedTables,
        Field::CandidateSql,
        Field::ValidationError,
        Field::ExecutionError,
        Field::ExecutionResult,
        Field::RetryCount,
        Field::NeedsVisualization,
        Field::ChartKind,
        Field::VisualizationSpec,
        Field::FinalResponse,
        Field::Logs,
    ]
    .into_iter()
    .collect()
}
