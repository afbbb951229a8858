//! Request state and partial updates.
//!
//! One `RequestState` exists per in-flight request. Steps never mutate it
//! directly: they return a `StateUpdate` carrying only the fields they wrote,
//! and the orchestrator merges it with the per-field rules in
//! [`RequestState::apply`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::chart::{ChartKind, VisualizationSpec};
use super::step::StepName;

/// One result row: column name to value, in select-list order
pub type Row = Map<String, Value>;

/// Outcome of the relevance classifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    Relevant,
    Irrelevant,
    #[default]
    Unset,
}

/// Addressable fields of [`RequestState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    OriginalQuery,
    RefinedQuery,
    Relevance,
    SelectedTables,
    CandidateSql,
    ValidationError,
    ExecutionError,
    ExecutionResult,
    RetryCount,
    NeedsVisualization,
    ChartKind,
    VisualizationSpec,
    FinalResponse,
    Logs,
}

impl Field {
    /// Fields that hold a value from the moment the request is created
    pub const INITIAL: [Field; 2] = [Field::OriginalQuery, Field::RetryCount];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::OriginalQuery => "original_query",
            Field::RefinedQuery => "refined_query",
            Field::Relevance => "relevance",
            Field::SelectedTables => "selected_tables",
            Field::CandidateSql => "candidate_sql",
            Field::ValidationError => "validation_error",
            Field::ExecutionError => "execution_error",
            Field::ExecutionResult => "execution_result",
            Field::RetryCount => "retry_count",
            Field::NeedsVisualization => "needs_visualization",
            Field::ChartKind => "chart_kind",
            Field::VisualizationSpec => "visualization_spec",
            Field::FinalResponse => "final_response",
            Field::Logs => "logs",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write-once field was written a second time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("field '{0}' is write-once and already set")]
pub struct WriteOnceViolation(pub Field);

/// The mutable record threaded through the step graph
#[derive(Debug, Clone, Serialize)]
pub struct RequestState {
    pub request_id: Uuid,
    pub thread_id: String,
    pub original_query: String,
    pub refined_query: Option<String>,
    pub relevance: Relevance,
    pub selected_tables: BTreeSet<String>,
    pub candidate_sql: String,
    pub validation_error: Option<String>,
    pub execution_error: Option<String>,
    pub execution_result: Vec<Row>,
    pub retry_count: u32,
    pub needs_visualization: bool,
    pub chart_kind: Option<ChartKind>,
    pub visualization_spec: Option<VisualizationSpec>,
    pub final_response: Option<String>,

    /// Steps committed so far, in execution order
    pub steps: Vec<StepName>,

    /// Append-only diagnostic notes written by steps
    pub logs: Vec<String>,
}

impl RequestState {
    /// Fresh state for a new request; `retry_count` starts at zero
    pub fn new(thread_id: impl Into<String>, original_query: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            thread_id: thread_id.into(),
            original_query: original_query.into(),
            refined_query: None,
            relevance: Relevance::Unset,
            selected_tables: BTreeSet::new(),
            candidate_sql: String::new(),
            validation_error: None,
            execution_error: None,
            execution_result: Vec::new(),
            retry_count: 0,
            needs_visualization: false,
            chart_kind: None,
            visualization_spec: None,
            final_response: None,
            steps: Vec::new(),
            logs: Vec::new(),
        }
    }

    /// The question downstream steps should work from
    pub fn effective_query(&self) -> &str {
        self.refined_query
            .as_deref()
            .unwrap_or(&self.original_query)
    }

    /// Feedback text for the next generation attempt, if the last one failed
    pub fn feedback(&self) -> Option<&str> {
        self.validation_error
            .as_deref()
            .or(self.execution_error.as_deref())
    }

    /// Merge a partial update.
    ///
    /// Merge rules: `relevance`, `refined_query` and `final_response` are
    /// write-once; `logs` is append-only; everything else is last-write-wins.
    /// The update is checked in full before any field is touched.
    pub fn apply(&mut self, update: &StateUpdate) -> Result<(), WriteOnceViolation> {
        if update.relevance.is_some() && self.relevance != Relevance::Unset {
            return Err(WriteOnceViolation(Field::Relevance));
        }
        if update.refined_query.is_some() && self.refined_query.is_some() {
            return Err(WriteOnceViolation(Field::RefinedQuery));
        }
        if update.final_response.is_some() && self.final_response.is_some() {
            return Err(WriteOnceViolation(Field::FinalResponse));
        }

        if let Some(relevance) = update.relevance {
            self.relevance = relevance;
        }
        if let Some(ref refined) = update.refined_query {
            self.refined_query = Some(refined.clone());
        }
        if let Some(ref tables) = update.selected_tables {
            self.selected_tables = tables.clone();
        }
        if let Some(ref sql) = update.candidate_sql {
            self.candidate_sql = sql.clone();
        }
        if let Some(ref error) = update.validation_error {
            self.validation_error = error.clone();
        }
        if let Some(ref error) = update.execution_error {
            self.execution_error = error.clone();
        }
        if let Some(ref rows) = update.execution_result {
            self.execution_result = rows.clone();
        }
        if let Some(count) = update.retry_count {
            self.retry_count = count;
        }
        if let Some(needs) = update.needs_visualization {
            self.needs_visualization = needs;
        }
        if let Some(kind) = update.chart_kind {
            self.chart_kind = kind;
        }
        if let Some(ref spec) = update.visualization_spec {
            self.visualization_spec = spec.clone();
        }
        if let Some(ref response) = update.final_response {
            self.final_response = Some(response.clone());
        }
        self.logs.extend(update.logs.iter().cloned());

        Ok(())
    }
}

/// The fields one step wrote.
///
/// `None` means "not written". For nullable fields the inner `Option`
/// carries the value, so `Some(None)` is an explicit clear.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refined_query: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<Relevance>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_tables: Option<BTreeSet<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_sql: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<Option<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<Option<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<Vec<Row>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_visualization: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_kind: Option<Option<ChartKind>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization_spec: Option<Option<VisualizationSpec>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a diagnostic note
    pub fn with_log(mut self, message: impl Into<String>) -> Self {
        self.logs.push(message.into());
        self
    }

    /// Fields this update writes
    pub fn fields(&self) -> Vec<Field> {
        let mut fields = Vec::new();
        if self.refined_query.is_some() {
            fields.push(Field::RefinedQuery);
        }
        if self.relevance.is_some() {
            fields.push(Field::Relevance);
        }
        if self.selected_tables.is_some() {
            fields.push(Field::SelectedTables);
        }
        if self.candidate_sql.is_some() {
            fields.push(Field::CandidateSql);
        }
        if self.validation_error.is_some() {
            fields.push(Field::ValidationError);
        }
        if self.execution_error.is_some() {
            fields.push(Field::ExecutionError);
        }
        if self.execution_result.is_some() {
            fields.push(Field::ExecutionResult);
        }
        if self.retry_count.is_some() {
            fields.push(Field::RetryCount);
        }
        if self.needs_visualization.is_some() {
            fields.push(Field::NeedsVisualization);
        }
        if self.chart_kind.is_some() {
            fields.push(Field::ChartKind);
        }
        if self.visualization_spec.is_some() {
            fields.push(Field::VisualizationSpec);
        }
        if self.final_response.is_some() {
            fields.push(Field::FinalResponse);
        }
        if !self.logs.is_empty() {
            fields.push(Field::Logs);
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Fold a later update into this one; fields `other` writes win
    pub fn merge(&mut self, other: StateUpdate) {
        if other.refined_query.is_some() {
            self.refined_query = other.refined_query;
        }
        if other.relevance.is_some() {
            self.relevance = other.relevance;
        }
        if other.selected_tables.is_some() {
            self.selected_tables = other.selected_tables;
        }
        if other.candidate_sql.is_some() {
            self.candidate_sql = other.candidate_sql;
        }
        if other.validation_error.is_some() {
            self.validation_error = other.validation_error;
        }
        if other.execution_error.is_some() {
            self.execution_error = other.execution_error;
        }
        if other.execution_result.is_some() {
            self.execution_result = other.execution_result;
        }
        if other.retry_count.is_some() {
            self.retry_count = other.retry_count;
        }
        if other.needs_visualization.is_some() {
            self.needs_visualization = other.needs_visualization;
        }
        if other.chart_kind.is_some() {
            self.chart_kind = other.chart_kind;
        }
        if other.visualization_spec.is_some() {
            self.visualization_spec = other.visualization_spec;
        }
        if other.final_response.is_some() {
            self.final_response = other.final_response;
        }
        self.logs.extend(other.logs);
    }
}
