use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{StepContext, StepRunner};
use crate::adapters::{ChatMessage, GenerationRequest, Temperature, TextGenerator};
use crate::core::error::StepError;
use crate::domain::{RequestState, StateUpdate, StepName};

const SYSTEM_PROMPT: &str = "You are an expert SQL analyst. Rewrite the user's question so it \
is clear, unambiguous and easy to translate into SQL.

Rules:
1. Resolve vague terms (\"best\" -> \"top by sales\", \"popular\" -> \"highest number of purchases\").
2. Keep the user's original intent.
3. If the question is already clear, return it unchanged.
4. No conversational filler; return only the rewritten question.
5. Make implied aggregations explicit (\"by year\", \"by country\").

Example: \"best customers\" -> \"Show top 10 customers by total purchase amount\"";

/// Turns the raw question into an SQL-friendly one
pub struct RewritingStep {
    generator: Arc<dyn TextGenerator>,
}

impl RewritingStep {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl StepRunner for RewritingStep {
    fn name(&self) -> StepName {
        StepName::Rewriting
    }

    async fn run(&self, state: &RequestState, ctx: &StepContext) -> Result<StateUpdate, StepError> {
        let request = GenerationRequest {
            step: StepName::Rewriting,
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(&state.original_query),
            ],
            temperature: Temperature::Deterministic,
            stream: false,
        };

        let rewritten = self.generator.generate(&request, &ctx.tokens).await?;
        let rewritten = rewritten.trim();

        let update = if rewritten.is_empty() {
            StateUpdate {
                refined_query: Some(state.original_query.clone()),
                ..Default::default()
            }
            .with_log("rewriter returned nothing; using the original question")
        } else {
            debug!(refined = %rewritten, "Query rewritten");
            StateUpdate {
                refined_query: Some(rewritten.to_string()),
                ..Default::default()
            }
        };
        Ok(update)
    }
}
