//! sqlpilot - natural-language questions over a SQL database
//!
//! A question moves through a fixed graph of steps: routing, rewriting,
//! table selection, SQL generation, validation, execution, synthesis and
//! visualization. Generation failures loop back with feedback until a
//! bounded retry budget runs out.
//!
//! # Architecture
//!
//! - The step graph is a static transition table, verified at startup:
//!   every step reachable, every run terminating, every field a step reads
//!   written on every path into it
//! - Steps return partial updates; only the orchestrator merges them into
//!   the request state and picks the next step
//! - Progress is streamed to the caller as it happens, tokens included
//!
//! # Modules
//!
//! - `adapters`: Language model and database collaborators
//! - `core`: Orchestration logic (graph, orchestrator, policy, safety)
//! - `domain`: Data structures (state, events, charts, turns)
//! - `steps`: The ten step runners
//! - `server`: HTTP/SSE transport
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Ask a question
//! sqlpilot ask "Who are the top 5 artists by sales?"
//!
//! # Serve the HTTP API
//! sqlpilot serve --address 127.0.0.1:8000
//!
//! # Print and verify the step graph
//! sqlpilot graph
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod server;
pub mod steps;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, Policy, ProgressStream, TransitionTable};
pub use domain::{Outcome, ProgressEvent, RequestState, StateUpdate, StepName};
pub use steps::{Collaborators, StepRunners};
