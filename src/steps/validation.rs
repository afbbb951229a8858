use async_trait::async_trait;
use tracing::{info, warn};

use super::{StepContext, StepRunner};
use crate::core::error::StepError;
use crate::core::safety::fingerprint;
use crate::domain::{RequestState, StateUpdate, StepName};

/// Runs the safety policy over the candidate SQL; makes no external calls
pub struct ValidationStep;

#[async_trait]
impl StepRunner for ValidationStep {
    fn name(&self) -> StepName {
        StepName::Validation
    }

    async fn run(&self, state: &RequestState, ctx: &StepContext) -> Result<StateUpdate, StepError> {
        let verdict = ctx.policy.safety.validate(&state.candidate_sql);

        if verdict.accepted {
            info!(sql = %fingerprint(&state.candidate_sql), "SQL accepted");
        } else {
            warn!(
                sql = %fingerprint(&state.candidate_sql),
                reason = verdict.reason.as_deref().unwrap_or_default(),
                "SQL rejected"
            );
        }

        // A new validation always clears the previous execution error
        Ok(StateUpdate {
            validation_error: Some(verdict.reason),
            execution_error: Some(None),
            ..Default::default()
        })
    }
}
