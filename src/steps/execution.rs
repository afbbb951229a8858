use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{StepContext, StepRunner};
use crate::adapters::DataStore;
use crate::core::error::{DataStoreError, StepError};
use crate::core::safety::fingerprint;
use crate::domain::{RequestState, StateUpdate, StepName};

/// Runs the validated SQL against the data store
pub struct ExecutionStep {
    store: Arc<dyn DataStore>,
}

impl ExecutionStep {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StepRunner for ExecutionStep {
    fn name(&self) -> StepName {
        StepName::Execution
    }

    async fn run(&self, state: &RequestState, _ctx: &StepContext) -> Result<StateUpdate, StepError> {
        let sql = fingerprint(&state.candidate_sql);
        let started = Instant::now();

        match self.store.execute_read_only(&state.candidate_sql).await {
            Ok(rows) => {
                info!(
                    %sql,
                    rows = rows.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Query executed"
                );
                Ok(StateUpdate {
                    validation_error: Some(None),
                    execution_error: Some(None),
                    execution_result: Some(rows),
                    ..Default::default()
                })
            }
            Err(DataStoreError::Query(message)) => {
                warn!(%sql, error = %message, "Query failed");
                Ok(StateUpdate {
                    validation_error: Some(None),
                    execution_error: Some(Some(message)),
                    execution_result: Some(Vec::new()),
                    ..Default::default()
                })
            }
            Err(unavailable) => Err(StepError::data_store(StepName::Execution, unavailable)),
        }
    }
}
