use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{StepContext, StepRunner};
use crate::adapters::{ChatMessage, DataStore, GenerationRequest, Temperature, TextGenerator};
use crate::core::error::{DataStoreError, StepError};
use crate::domain::{RequestState, StateUpdate, StepName};

/// Produces candidate SQL, folding in feedback from the previous attempt
pub struct GenerationStep {
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn DataStore>,
}

impl GenerationStep {
    pub fn new(generator: Arc<dyn TextGenerator>, store: Arc<dyn DataStore>) -> Self {
        Self { generator, store }
    }

    /// DDL for the selected tables, or for every table when none were selected
    async fn schema_context(&self, state: &RequestState) -> Result<String, StepError> {
        let wrap = |e: DataStoreError| StepError::data_store(StepName::Generation, e);

        let tables: Vec<String> = if state.selected_tables.is_empty() {
            self.store
                .list_tables()
                .await
                .map_err(wrap)?
                .into_iter()
                .collect()
        } else {
            state.selected_tables.iter().cloned().collect()
        };

        let mut parts = Vec::with_capacity(tables.len());
        for table in &tables {
            let ddl = self.store.schema_of(table).await.map_err(wrap)?;
            if !ddl.trim().is_empty() {
                parts.push(ddl);
            }
        }
        Ok(parts.join("\n\n"))
    }
}

fn system_prompt(schema: &str) -> String {
    format!(
        "You are an expert SQLite developer. Write one valid SQLite query that answers \
         the user's question, using the schema below.\n\n\
         Schema:\n{}\n\n\
         Rules:\n\
         1. Return ONLY the SQL query: no markdown, no backticks, no explanation.\n\
         2. The query must be read-only (SELECT).\n\
         3. Use SQLite-compatible syntax.\n\
         4. Use GROUP BY for aggregations.",
        schema
    )
}

/// Remove markdown code fences a model may wrap around its SQL
pub fn strip_markdown_fences(text: &str) -> String {
    text.replace("```sql", "")
        .replace("```SQL", "")
        .replace("```", "")
        .trim()
        .to_string()
}

#[async_trait]
impl StepRunner for GenerationStep {
    fn name(&self) -> StepName {
        StepName::Generation
    }

    async fn run(&self, state: &RequestState, ctx: &StepContext) -> Result<StateUpdate, StepError> {
        let schema = self.schema_context(state).await?;

        let mut messages = vec![
            ChatMessage::system(system_prompt(&schema)),
            ChatMessage::user(state.effective_query()),
        ];
        if let Some(feedback) = state.feedback() {
            messages.push(ChatMessage::user(format!(
                "The previous query was invalid. Error: {}. Please fix the SQL.",
                feedback.trim_end_matches('.')
            )));
        }

        // Deterministic on the first attempt, exploratory on retries
        let temperature = if state.retry_count == 0 {
            Temperature::Deterministic
        } else {
            Temperature::Exploratory
        };

        let request = GenerationRequest {
            step: StepName::Generation,
            messages,
            temperature,
            stream: false,
        };
        let raw = self.generator.generate(&request, &ctx.tokens).await?;
        let sql = strip_markdown_fences(&raw);

        debug!(attempt = state.retry_count + 1, "Candidate SQL generated");

        let mut update = StateUpdate {
            candidate_sql: Some(sql),
            ..Default::default()
        };
        if raw.contains("```") {
            update = update.with_log("stripped markdown fences from generated SQL");
        }
        Ok(update)
    }
}
