use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{StepContext, StepRunner};
use crate::adapters::{ChatMessage, ClassificationTask, Classifier, DataStore};
use crate::core::error::StepError;
use crate::domain::{RequestState, StateUpdate, StepName};

/// Picks the tables the query needs from the live schema
pub struct TableSelectionStep {
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn DataStore>,
}

impl TableSelectionStep {
    pub fn new(classifier: Arc<dyn Classifier>, store: Arc<dyn DataStore>) -> Self {
        Self { classifier, store }
    }

    fn task() -> ClassificationTask {
        ClassificationTask {
            name: "select_tables",
            description: "Select relevant tables.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "selected_tables": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Names of the tables needed to answer the query."
                    }
                },
                "required": ["selected_tables"]
            }),
        }
    }
}

/// Split a raw selection into live tables and names that do not exist
pub fn filter_selection(raw: &Value, live: &BTreeSet<String>) -> (BTreeSet<String>, Vec<String>) {
    let mut selected = BTreeSet::new();
    let mut unknown = Vec::new();

    let names = raw
        .get("selected_tables")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();

    for name in names {
        let name = name.trim();
        if live.contains(name) {
            selected.insert(name.to_string());
        } else {
            unknown.push(name.to_string());
        }
    }
    (selected, unknown)
}

#[async_trait]
impl StepRunner for TableSelectionStep {
    fn name(&self) -> StepName {
        StepName::TableSelection
    }

    async fn run(&self, state: &RequestState, _ctx: &StepContext) -> Result<StateUpdate, StepError> {
        let live = self
            .store
            .list_tables()
            .await
            .map_err(|e| StepError::data_store(StepName::TableSelection, e))?;

        let available = live.iter().cloned().collect::<Vec<_>>().join(", ");
        let messages = vec![
            ChatMessage::system(format!(
                "You are an expert database architect. Select the tables strictly \
                 necessary to answer the user's query. The available tables are: {}. \
                 Use only these names.",
                available
            )),
            ChatMessage::user(state.effective_query()),
        ];

        let raw = self.classifier.classify(&Self::task(), &messages).await?;
        let (selected, unknown) = filter_selection(&raw, &live);

        let mut update = StateUpdate::new();
        if raw.is_null() {
            warn!("Unparsable table selection, continuing with an empty selection");
            update = update.with_log("table selection could not be parsed; using the full schema");
        }
        if !unknown.is_empty() {
            warn!(?unknown, "Dropping tables that are not in the live schema");
            update = update.with_log(format!("dropped unknown tables: {}", unknown.join(", ")));
        }
        debug!(?selected, "Tables selected");

        update.selected_tables = Some(selected);
        Ok(update)
    }
}
