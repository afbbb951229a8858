//! Core orchestration logic.
//!
//! This module contains:
//! - Graph: the static transition table and its checks
//! - Orchestrator: drives requests through the graph
//! - Policy: retry ceiling, timeouts and prompt limits
//! - Safety: the read-only SQL policy
//! - Stream: progress events from orchestrator to caller
//! - Threads: per-thread serialization and history

pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod policy;
pub mod safety;
pub mod stream;
pub mod threads;

// Re-export commonly used types
pub use error::{CollaboratorError, DataStoreError, StepError};
pub use graph::{Condition, Edge, Effect, Exit, GraphError, Next, TransitionTable};
pub use orchestrator::Orchestrator;
pub use policy::Policy;
pub use safety::{fingerprint, SafetyVerdict, SafetyViolation, SqlSafetyPolicy};
pub use stream::{ProgressSink, ProgressStream, TokenSink};
pub use threads::ThreadRegistry;
