//! Domain types for the sqlpilot orchestrator.
//!
//! This module contains the core data structures:
//! - State: the per-request record and partial updates
//! - Step: step identities and their declared reads/writes
//! - Events: what the progress stream carries
//! - Chart: chart specs built from result rows
//! - Turn: finished requests kept per thread

pub mod chart;
pub mod events;
pub mod state;
pub mod step;
pub mod turn;

// Re-export commonly used types
pub use chart::{ChartKind, VisualizationSpec};
pub use events::{final_response, FailureKind, Outcome, ProgressEvent};
pub use state::{Field, Relevance, RequestState, Row, StateUpdate, WriteOnceViolation};
pub use step::StepName;
pub use turn::{Turn, TurnStatus};
