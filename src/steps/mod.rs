//! Step runners: one unit of work per node of the step graph.
//!
//! A runner reads the committed [`RequestState`] and returns a
//! [`StateUpdate`] holding only the fields it owns. Runners never mutate state
//! and never decide what runs next; both belong to the orchestrator.

mod execution;
mod general;
mod generation;
mod rewrite;
mod routing;
mod synthesis;
mod tables;
mod validation;
mod visualization;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::{Classifier, DataStore, TextGenerator};
use crate::core::error::StepError;
use crate::core::policy::Policy;
use crate::core::stream::TokenSink;
use crate::domain::{RequestState, StateUpdate, StepName};

pub use execution::ExecutionStep;
pub use general::GeneralReplyStep;
pub use generation::{strip_markdown_fences, GenerationStep};
pub use rewrite::RewritingStep;
pub use routing::RoutingStep;
pub use synthesis::{explain_execution_error, render_results, SynthesisStep};
pub use tables::{filter_selection, TableSelectionStep};
pub use validation::ValidationStep;
pub use visualization::{VisualizationGenerationStep, VisualizationPlanningStep};

/// What the database is about, for routing and out-of-scope replies
pub const DEFAULT_SUBJECT: &str = "a music store database (Chinook) covering artists, albums, \
tracks, playlists, invoices, customers and employees";

/// Per-invocation context handed to a runner
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Where streaming steps forward incremental text
    pub tokens: TokenSink,
    pub policy: Arc<Policy>,
}

/// One node of the step graph
#[async_trait]
pub trait StepRunner: Send + Sync {
    fn name(&self) -> StepName;

    async fn run(&self, state: &RequestState, ctx: &StepContext) -> Result<StateUpdate, StepError>;
}

/// The shared clients every step draws from
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn TextGenerator>,
    pub classifier: Arc<dyn Classifier>,
    pub store: Arc<dyn DataStore>,
}

/// Runner lookup by step name
#[derive(Clone, Default)]
pub struct StepRunners {
    runners: HashMap<StepName, Arc<dyn StepRunner>>,
}

impl StepRunners {
    pub fn new() -> Self {
        Self::default()
    }

    /// The ten standard runners wired to the given collaborators
    pub fn standard(collaborators: &Collaborators, subject: &str) -> Self {
        let Collaborators {
            generator,
            classifier,
            store,
        } = collaborators;

        Self::new()
            .with_runner(Arc::new(RoutingStep::new(classifier.clone(), subject)))
            .with_runner(Arc::new(GeneralReplyStep::new(generator.clone(), subject)))
            .with_runner(Arc::new(RewritingStep::new(generator.clone())))
            .with_runner(Arc::new(TableSelectionStep::new(
                classifier.clone(),
                store.clone(),
            )))
            .with_runner(Arc::new(GenerationStep::new(generator.clone(), store.clone())))
            .with_runner(Arc::new(ValidationStep))
            .with_runner(Arc::new(ExecutionStep::new(store.clone())))
            .with_runner(Arc::new(SynthesisStep::new(generator.clone())))
            .with_runner(Arc::new(VisualizationPlanningStep::new(classifier.clone())))
            .with_runner(Arc::new(VisualizationGenerationStep))
    }

    /// Register a runner, replacing any existing one for the same step
    pub fn with_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.runners.insert(runner.name(), runner);
        self
    }

    pub fn get(&self, step: StepName) -> Option<Arc<dyn StepRunner>> {
        self.runners.get(&step).cloned()
    }

    /// Steps with no registered runner
    pub fn missing(&self) -> Vec<StepName> {
        StepName::ALL
            .iter()
            .copied()
            .filter(|step| !self.runners.contains_key(step))
            .collect()
    }
}
