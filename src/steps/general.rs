use std::sync::Arc;

use async_trait::async_trait;

use super::{StepContext, StepRunner};
use crate::adapters::{ChatMessage, GenerationRequest, Temperature, TextGenerator};
use crate::core::error::StepError;
use crate::domain::{RequestState, StateUpdate, StepName};

/// Streams a reply to an out-of-scope question and steers the user back
pub struct GeneralReplyStep {
    generator: Arc<dyn TextGenerator>,
    subject: String,
}

impl GeneralReplyStep {
    pub fn new(generator: Arc<dyn TextGenerator>, subject: &str) -> Self {
        Self {
            generator,
            subject: subject.to_string(),
        }
    }
}

#[async_trait]
impl StepRunner for GeneralReplyStep {
    fn name(&self) -> StepName {
        StepName::GeneralReply
    }

    async fn run(&self, state: &RequestState, ctx: &StepContext) -> Result<StateUpdate, StepError> {
        let request = GenerationRequest {
            step: StepName::GeneralReply,
            messages: vec![
                ChatMessage::system(format!(
                    "You are a helpful assistant for an analytics application built on {}. \
                     The user has asked something outside the scope of this database. \
                     Politely acknowledge the question, explain what the database covers, \
                     and suggest two or three questions they could ask instead.",
                    self.subject
                )),
                ChatMessage::user(&state.original_query),
            ],
            temperature: Temperature::Exploratory,
            stream: true,
        };

        let reply = self.generator.generate(&request, &ctx.tokens).await?;

        Ok(StateUpdate {
            final_response: Some(reply),
            ..Default::default()
        })
    }
}
