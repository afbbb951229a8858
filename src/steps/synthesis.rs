use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{StepContext, StepRunner};
use crate::adapters::{ChatMessage, GenerationRequest, Temperature, TextGenerator};
use crate::core::error::StepError;
use crate::domain::{RequestState, Row, StateUpdate, StepName};

/// Turns rows, or the last execution error, into the answer
pub struct SynthesisStep {
    generator: Arc<dyn TextGenerator>,
}

impl SynthesisStep {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

/// Serialize rows for a prompt, cut at `limit` characters
pub fn render_results(rows: &[Row], limit: usize) -> String {
    let text = serde_json::Value::Array(
        rows.iter()
            .cloned()
            .map(serde_json::Value::Object)
            .collect(),
    )
    .to_string();

    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}... (truncated)", &text[..cut]),
        None => text,
    }
}

/// User-facing answer when the query could not be run
pub fn explain_execution_error(state: &RequestState) -> String {
    let error = state.execution_error.as_deref().unwrap_or("unknown error");
    let attempts = state.retry_count + 1;
    format!(
        "I wasn't able to answer that from the database. The query failed after {} attempt{} \
         with this error from the database: {}",
        attempts,
        if attempts == 1 { "" } else { "s" },
        error
    )
}

#[async_trait]
impl StepRunner for SynthesisStep {
    fn name(&self) -> StepName {
        StepName::Synthesis
    }

    async fn run(&self, state: &RequestState, ctx: &StepContext) -> Result<StateUpdate, StepError> {
        if state.execution_error.is_some() {
            debug!("Execution failed, explaining instead of summarizing");
            return Ok(StateUpdate {
                final_response: Some(explain_execution_error(state)),
                ..Default::default()
            });
        }

        let results = render_results(&state.execution_result, ctx.policy.synthesis_context_chars);
        let system = format!(
            "You are a helpful data assistant. Answer the user's question from the \
             database results below.\n\n\
             User question: {}\n\
             SQL used: {}\n\
             Rows returned: {}\n\
             Results: {}\n\n\
             Guidelines:\n\
             1. Be concise and direct.\n\
             2. State single numbers clearly.\n\
             3. Summarize lists (for example the top 5 items).\n\
             4. If there are no results, say so politely.\n\
             5. Avoid mentioning SQL unless it helps.",
            state.original_query,
            state.candidate_sql,
            state.execution_result.len(),
            results
        );

        let request = GenerationRequest {
            step: StepName::Synthesis,
            messages: vec![ChatMessage::system(system)],
            temperature: Temperature::Deterministic,
            stream: true,
        };
        let answer = self.generator.generate(&request, &ctx.tokens).await?;

        Ok(StateUpdate {
            final_response: Some(answer),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(name: &str, total: f64) -> Row {
        let mut row = Row::new();
        row.insert("Name".to_string(), json!(name));
        row.insert("Total".to_string(), json!(total));
        row
    }

    #[test]
    fn test_render_results_in_full() {
        let text = render_results(&[row("Helena", 49.62)], 10_000);
        assert_eq!(text, r#"[{"Name":"Helena","Total":49.62}]"#);
    }

    #[test]
    fn test_render_results_truncates() {
        let rows: Vec<Row> = (0..100).map(|i| row(&format!("c{}", i), i as f64)).collect();
        let text = render_results(&rows, 50);
        assert!(text.ends_with("... (truncated)"));
        assert_eq!(text.chars().count(), 50 + "... (truncated)".len());
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let text = render_results(&[row("Zoë Björk", 1.0)], 12);
        assert!(text.ends_with("... (truncated)"));
    }

    #[test]
    fn test_error_explanation_is_readable() {
        let mut state = RequestState::new("t", "q");
        state.retry_count = 3;
        state.execution_error = Some("no such column: Spend".to_string());

        let text = explain_execution_error(&state);
        assert!(text.contains("4 attempts"));
        assert!(text.contains("no such column: Spend"));
    }
}
