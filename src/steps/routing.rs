use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{StepContext, StepRunner};
use crate::adapters::{ChatMessage, ClassificationTask, Classifier};
use crate::core::error::StepError;
use crate::domain::{Relevance, RequestState, StateUpdate, StepName};

/// Decides whether the question is about the database at all
pub struct RoutingStep {
    classifier: Arc<dyn Classifier>,
    subject: String,
}

impl RoutingStep {
    pub fn new(classifier: Arc<dyn Classifier>, subject: &str) -> Self {
        Self {
            classifier,
            subject: subject.to_string(),
        }
    }

    fn task() -> ClassificationTask {
        ClassificationTask {
            name: "route_query",
            description: "Route the user query based on relevance.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "relevance": {
                        "type": "string",
                        "enum": ["relevant", "irrelevant"],
                        "description": "Whether the query can be answered from the database."
                    }
                },
                "required": ["relevance"]
            }),
        }
    }
}

/// Read the classifier verdict; anything unrecognized is out of scope
fn parse_relevance(value: &Value) -> Option<Relevance> {
    match value.get("relevance").and_then(Value::as_str) {
        Some("relevant") => Some(Relevance::Relevant),
        Some("irrelevant") => Some(Relevance::Irrelevant),
        _ => None,
    }
}

#[async_trait]
impl StepRunner for RoutingStep {
    fn name(&self) -> StepName {
        StepName::Routing
    }

    async fn run(&self, state: &RequestState, _ctx: &StepContext) -> Result<StateUpdate, StepError> {
        let messages = vec![
            ChatMessage::system(format!(
                "You are an expert at routing user queries. Decide whether the user's \
                 query is relevant to {}. Greetings, chitchat and questions unrelated to \
                 the data are 'irrelevant'; everything else is 'relevant'.",
                self.subject
            )),
            ChatMessage::user(&state.original_query),
        ];

        let verdict = self.classifier.classify(&Self::task(), &messages).await?;

        let update = match parse_relevance(&verdict) {
            Some(relevance) => {
                debug!(?relevance, "Query routed");
                StateUpdate {
                    relevance: Some(relevance),
                    ..Default::default()
                }
            }
            None => {
                warn!(%verdict, "Unparsable routing verdict, treating query as irrelevant");
                StateUpdate {
                    relevance: Some(Relevance::Irrelevant),
                    ..Default::default()
                }
                .with_log("routing verdict could not be parsed; treated as irrelevant")
            }
        };
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relevance() {
        assert_eq!(
            parse_relevance(&json!({"relevance": "relevant"})),
            Some(Relevance::Relevant)
        );
        assert_eq!(
            parse_relevance(&json!({"relevance": "irrelevant"})),
            Some(Relevance::Irrelevant)
        );
        assert_eq!(parse_relevance(&json!({"relevance": "maybe"})), None);
        assert_eq!(parse_relevance(&Value::Null), None);
    }
}
