//! Infrastructure error taxonomy.
//!
//! Domain failures (unsafe SQL, a query the data store rejects) are not
//! errors here: they live on `RequestState` and drive the retry loop. What
//! this module describes is everything that ends a request without retry.

use thiserror::Error;

use crate::domain::{FailureKind, Field, StepName};

/// Failure talking to the text-generation or classification service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("{service} is unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    #[error("{service} returned malformed output: {message}")]
    Malformed {
        service: &'static str,
        message: String,
    },
}

/// Failure reported by the data store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataStoreError {
    /// The store ran the statement and rejected it (domain failure)
    #[error("{0}")]
    Query(String),

    /// The store could not be reached at all
    #[error("data store is unavailable: {0}")]
    Unavailable(String),
}

/// Why a step could not produce an update
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("data store failed during {step}: {message}")]
    DataStore { step: StepName, message: String },

    #[error("step '{step}' timed out after {timeout_ms}ms")]
    Timeout { step: StepName, timeout_ms: u64 },

    #[error("step '{step}' attempted to write '{field}', which it does not own")]
    Unauthorized { step: StepName, field: Field },

    #[error("step '{step}' attempted to overwrite write-once field '{field}'")]
    WriteOnce { step: StepName, field: Field },

    #[error("step '{step}' did not write '{field}'")]
    MissingWrite { step: StepName, field: Field },

    #[error("no runner registered for step '{0}'")]
    MissingRunner(StepName),

    #[error("no transition out of step '{0}'")]
    NoTransition(StepName),

    #[error("step '{step}' panicked: {message}")]
    Panicked { step: StepName, message: String },

    #[error("request cancelled by the caller")]
    Cancelled,
}

impl StepError {
    /// Wrap a data-store error raised outside the Execution step
    pub fn data_store(step: StepName, error: DataStoreError) -> Self {
        let message = match error {
            DataStoreError::Query(message) | DataStoreError::Unavailable(message) => message,
        };
        StepError::DataStore { step, message }
    }

    /// Classification carried on the `Failure` event
    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::Collaborator(_) | StepError::DataStore { .. } => FailureKind::Infrastructure,
            StepError::Timeout { .. } => FailureKind::Timeout,
            StepError::Unauthorized { .. }
            | StepError::WriteOnce { .. }
            | StepError::MissingWrite { .. }
            | StepError::MissingRunner(_)
            | StepError::NoTransition(_)
            | StepError::Panicked { .. }
            | StepError::Cancelled => FailureKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        let outage = StepError::from(CollaboratorError::Unavailable {
            service: "llm",
            message: "connection refused".to_string(),
        });
        assert_eq!(outage.kind(), FailureKind::Infrastructure);
        assert_eq!(outage.to_string(), "llm is unavailable: connection refused");

        let slow = StepError::Timeout {
            step: StepName::Rewriting,
            timeout_ms: 1000,
        };
        assert_eq!(slow.kind(), FailureKind::Timeout);
        assert_eq!(slow.to_string(), "step 'rewriting' timed out after 1000ms");

        let rogue = StepError::Unauthorized {
            step: StepName::Routing,
            field: Field::FinalResponse,
        };
        assert_eq!(rogue.kind(), FailureKind::Internal);
    }

    #[test]
    fn test_data_store_wrapping() {
        let error = StepError::data_store(
            StepName::TableSelection,
            DataStoreError::Unavailable("unable to open database file".to_string()),
        );
        assert_eq!(error.kind(), FailureKind::Infrastructure);
        assert!(error.to_string().contains("table_selection"));
    }
}
