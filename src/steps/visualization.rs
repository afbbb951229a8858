use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{StepContext, StepRunner};
use crate::adapters::{ChatMessage, ClassificationTask, Classifier};
use crate::core::error::StepError;
use crate::domain::{ChartKind, RequestState, StateUpdate, StepName, VisualizationSpec};

/// Rows shown to the planner
const SAMPLE_ROWS: usize = 5;

/// Decides whether the answer deserves a chart, and which kind
pub struct VisualizationPlanningStep {
    classifier: Arc<dyn Classifier>,
}

impl VisualizationPlanningStep {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }

    fn task() -> ClassificationTask {
        ClassificationTask {
            name: "plan_visualization",
            description: "Plan the visualization.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "needs_visualization": {
                        "type": "boolean",
                        "description": "Whether the user asked for a chart or the data is best shown visually."
                    },
                    "visualization_type": {
                        "type": ["string", "null"],
                        "enum": ["bar", "line", "pie", "scatter", null],
                        "description": "Type of chart to generate if needed."
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "Why a chart is or is not needed."
                    }
                },
                "required": ["needs_visualization", "reasoning"]
            }),
        }
    }
}

/// The planner's verdict: `None` when it cannot be parsed
fn parse_plan(value: &Value) -> Option<(bool, Option<ChartKind>)> {
    let needs = value.get("needs_visualization")?.as_bool()?;
    let kind = value
        .get("visualization_type")
        .and_then(Value::as_str)
        .and_then(|kind| kind.parse().ok());
    Some((needs, kind))
}

fn no_chart() -> StateUpdate {
    StateUpdate {
        needs_visualization: Some(false),
        chart_kind: Some(None),
        ..Default::default()
    }
}

#[async_trait]
impl StepRunner for VisualizationPlanningStep {
    fn name(&self) -> StepName {
        StepName::VisualizationPlanning
    }

    async fn run(&self, state: &RequestState, _ctx: &StepContext) -> Result<StateUpdate, StepError> {
        if state.execution_result.is_empty() || state.execution_error.is_some() {
            debug!("Nothing to chart");
            return Ok(no_chart());
        }

        let sample_end = state.execution_result.len().min(SAMPLE_ROWS);
        let sample = serde_json::to_string(&state.execution_result[..sample_end])
            .unwrap_or_default();
        let messages = vec![ChatMessage::system(format!(
            "You are a data visualization expert. Decide whether a chart is needed.\n\n\
             User query: {}\n\
             Data sample (first rows): {}\n\n\
             Rules:\n\
             1. If the user explicitly asks for a plot, chart, graph or visualization, return true.\n\
             2. If the data is a time series or a distribution that benefits from a chart, return true.\n\
             3. If the data is a single number or text, return false.",
            state.effective_query(),
            sample
        ))];

        let raw = self.classifier.classify(&Self::task(), &messages).await?;

        let update = match parse_plan(&raw) {
            Some((needs, kind)) => {
                debug!(needs, ?kind, "Visualization planned");
                StateUpdate {
                    needs_visualization: Some(needs),
                    chart_kind: Some(if needs { kind } else { None }),
                    ..Default::default()
                }
            }
            None => {
                warn!(%raw, "Unparsable visualization plan, skipping the chart");
                no_chart().with_log("visualization plan could not be parsed; no chart")
            }
        };
        Ok(update)
    }
}

/// Builds the chart spec from the rows; makes no external calls
pub struct VisualizationGenerationStep;

#[async_trait]
impl StepRunner for VisualizationGenerationStep {
    fn name(&self) -> StepName {
        StepName::VisualizationGeneration
    }

    async fn run(&self, state: &RequestState, _ctx: &StepContext) -> Result<StateUpdate, StepError> {
        let kind = state.chart_kind.unwrap_or_default();
        let spec = VisualizationSpec::from_rows(kind, state.effective_query(), &state.execution_result);

        let mut update = StateUpdate {
            visualization_spec: Some(spec.clone()),
            ..Default::default()
        };
        if spec.is_none() {
            warn!(%kind, "Rows have no chartable columns");
            update = update.with_log(format!("no {} chart could be built from the rows", kind));
        }
        Ok(update)
    }
}
