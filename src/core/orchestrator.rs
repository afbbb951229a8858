//! Main orchestrator for request execution.
//!
//! Drives one request through the transition table: runs each step under
//! its timeout, commits the step's update, picks the next edge and streams
//! progress. Domain failures loop through the graph; infrastructure failures
//! end the request with a `Failure` event.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    Outcome, ProgressEvent, Relevance, RequestState, StateUpdate, StepName, Turn, TurnStatus,
    WriteOnceViolation,
};
use crate::steps::{StepContext, StepRunners};

use super::error::StepError;
use super::graph::{Exit, Next, TransitionTable};
use super::policy::Policy;
use super::safety::fingerprint;
use super::stream::{ProgressSink, ProgressStream, DEFAULT_CAPACITY};
use super::threads::ThreadRegistry;

/// Request orchestrator; cheap to clone, shared by every request
#[derive(Clone)]
pub struct Orchestrator {
    runners: Arc<StepRunners>,
    table: TransitionTable,
    policy: Arc<Policy>,
    threads: Arc<ThreadRegistry>,
}

impl Orchestrator {
    /// Create an orchestrator over the standard step graph
    pub fn new(runners: StepRunners, policy: Policy) -> Result<Self> {
        Self::with_table(TransitionTable::standard(), runners, policy)
    }

    /// Create an orchestrator over a custom transition table
    pub fn with_table(table: TransitionTable, runners: StepRunners, policy: Policy) -> Result<Self> {
        policy.validate()?;
        table.validate().context("Invalid transition table")?;

        let missing = runners.missing();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(StepName::as_str).collect();
            anyhow::bail!("No runner registered for: {}", names.join(", "));
        }

        let threads = ThreadRegistry::with_limits(policy.max_turns_per_thread, policy.max_threads);
        Ok(Self {
            runners: Arc::new(runners),
            table,
            policy: Arc::new(policy),
            threads: Arc::new(threads),
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn table(&self) -> TransitionTable {
        self.table
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Start a request and return its progress stream.
    ///
    /// The request runs on its own task. Dropping the stream cancels it.
    pub fn stream(&self, message: impl Into<String>, thread_id: impl Into<String>) -> ProgressStream {
        let (sink, stream) = ProgressSink::channel(DEFAULT_CAPACITY);
        let state = RequestState::new(thread_id, message);
        let this = self.clone();
        tokio::spawn(async move { this.drive(state, sink).await });
        stream
    }

    /// Run a request to completion and return every event it produced
    pub async fn ask(
        &self,
        message: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Vec<ProgressEvent> {
        self.stream(message, thread_id).collect_all().await
    }

    #[instrument(skip_all, fields(request_id = %state.request_id, thread_id = %state.thread_id))]
    async fn drive(&self, mut state: RequestState, sink: ProgressSink) {
        let thread_id = state.thread_id.clone();

        let _lease = tokio::select! {
            biased;
            _ = sink.closed() => {
                debug!("Caller left while waiting for the thread");
                return;
            }
            lease = self.threads.acquire(&thread_id) => lease,
        };

        let started_at = Utc::now();
        info!("Request started");

        let start = ProgressEvent::Start {
            request_id: state.request_id,
            thread_id: thread_id.clone(),
            timestamp: started_at,
        };
        let result = if sink.emit(start).await {
            self.run_graph(&mut state, &sink).await
        } else {
            Err(StepError::Cancelled)
        };

        let (status, terminal) = match result {
            Ok(exit) => {
                let outcome = outcome(exit, &state);
                info!(
                    ?outcome,
                    retry_count = state.retry_count,
                    steps = state.steps.len(),
                    "Request completed"
                );
                let end = ProgressEvent::End {
                    outcome,
                    retry_count: state.retry_count,
                };
                (TurnStatus::Completed { outcome }, Some(end))
            }
            Err(StepError::Cancelled) => {
                warn!(steps = state.steps.len(), "Request cancelled by caller");
                (TurnStatus::Cancelled, None)
            }
            Err(e) => {
                error!(error = %e, kind = ?e.kind(), "Request failed");
                let kind = e.kind();
                let message = e.to_string();
                let failure = ProgressEvent::Failure {
                    kind,
                    message: message.clone(),
                };
                (TurnStatus::Failed { kind, message }, Some(failure))
            }
        };

        // The turn is visible in history before the caller sees the terminal event
        self.threads
            .record(&thread_id, Turn::from_state(&state, status, started_at));
        if let Some(event) = terminal {
            sink.emit(event).await;
        }
    }

    /// Advance from the entry step until a terminal edge fires
    async fn run_graph(
        &self,
        state: &mut RequestState,
        sink: &ProgressSink,
    ) -> Result<Exit, StepError> {
        let mut step = TransitionTable::ENTRY;
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            let started = Instant::now();
            let mut update = self.run_step(step, state, sink).await?;
            self.commit(step, state, &update)?;
            state.steps.push(step);

            if step == StepName::Generation {
                let sql = fingerprint(&state.candidate_sql);
                let attempt = state.retry_count + 1;
                debug!(%sql, candidate = %state.candidate_sql, "Candidate SQL");
                if attempted.insert(sql.clone()) {
                    info!(%sql, attempt, "SQL generated");
                } else {
                    warn!(%sql, attempt, "Generator repeated an earlier attempt");
                }
            }

            let edge = self
                .table
                .next(step, state, &self.policy)
                .ok_or(StepError::NoTransition(step))?;

            let effect = edge.effect.update(state);
            if !effect.is_empty() {
                state
                    .apply(&effect)
                    .map_err(|WriteOnceViolation(field)| StepError::WriteOnce { step, field })?;
                if let Some(retry_count) = effect.retry_count {
                    info!(
                        retry_count,
                        max_retries = self.policy.max_retries,
                        feedback = state.feedback().unwrap_or_default(),
                        "Retrying generation"
                    );
                }
                update.merge(effect);
            }

            let duration_ms = started.elapsed().as_millis() as u64;
            debug!(%step, to = %edge.to, duration_ms, "Step committed");

            let event = ProgressEvent::StepUpdate {
                step,
                update,
                duration_ms,
            };
            if !sink.emit(event).await {
                return Err(StepError::Cancelled);
            }

            match edge.to {
                Next::Step(next) => step = next,
                Next::Terminal(exit) => return Ok(exit),
            }
        }
    }

    /// Run one step under its timeout, watching for a departed caller
    async fn run_step(
        &self,
        step: StepName,
        state: &RequestState,
        sink: &ProgressSink,
    ) -> Result<StateUpdate, StepError> {
        let runner = self.runners.get(step).ok_or(StepError::MissingRunner(step))?;
        let ctx = StepContext {
            tokens: sink.tokens(step),
            policy: self.policy.clone(),
        };
        let limit = self.policy.timeout(step);
        let call = AssertUnwindSafe(runner.run(state, &ctx)).catch_unwind();

        tokio::select! {
            biased;
            _ = sink.closed() => Err(StepError::Cancelled),
            outcome = tokio::time::timeout(limit, call) => match outcome {
                Err(_) => Err(StepError::Timeout {
                    step,
                    timeout_ms: limit.as_millis() as u64,
                }),
                Ok(Err(panic)) => Err(StepError::Panicked {
                    step,
                    message: panic_message(panic.as_ref()),
                }),
                Ok(Ok(result)) => result,
            },
        }
    }

    /// Check a step's update against what it owns, then merge it
    fn commit(
        &self,
        step: StepName,
        state: &mut RequestState,
        update: &StateUpdate,
    ) -> Result<(), StepError> {
        let written = update.fields();
        if let Some(field) = written.iter().find(|field| !step.may_write(**field)) {
            return Err(StepError::Unauthorized {
                step,
                field: *field,
            });
        }
        if let Some(field) = step.writes().iter().find(|field| !written.contains(*field)) {
            return Err(StepError::MissingWrite {
                step,
                field: *field,
            });
        }

        state
            .apply(update)
            .map_err(|WriteOnceViolation(field)| StepError::WriteOnce { step, field })
    }
}

/// How a completed request is reported
fn outcome(exit: Exit, state: &RequestState) -> Outcome {
    match exit {
        Exit::RetriesExhausted => Outcome::ValidationExhausted,
        Exit::Completed if state.relevance == Relevance::Irrelevant => Outcome::OutOfScope,
        Exit::Completed if state.execution_error.is_some() => Outcome::ExecutionExhausted,
        Exit::Completed => Outcome::Answered,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
