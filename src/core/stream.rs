//! Progress streaming between the orchestrator and its caller.
//!
//! The orchestrator holds a [`ProgressSink`]; the caller holds the matching
//! [`ProgressStream`]. The channel is bounded, so a slow consumer applies
//! backpressure instead of events piling up. Dropping the stream is how a
//! caller disconnects: the sink observes the closed channel and the
//! orchestrator stops advancing the request.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::domain::{ProgressEvent, StepName};

/// Events buffered between producer and consumer
pub const DEFAULT_CAPACITY: usize = 64;

/// Producer side of a request's progress stream
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSink {
    pub fn channel(capacity: usize) -> (ProgressSink, ProgressStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ProgressSink { tx },
            ProgressStream {
                rx,
                finished: false,
            },
        )
    }

    /// Send an event; returns false once the consumer has gone away
    pub async fn emit(&self, event: ProgressEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Resolves when the consumer drops its stream
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Token channel for one step
    pub fn tokens(&self, step: StepName) -> TokenSink {
        TokenSink {
            step,
            tx: Some(self.tx.clone()),
        }
    }
}

/// Where a streaming step forwards incremental text
#[derive(Debug, Clone)]
pub struct TokenSink {
    step: StepName,
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl TokenSink {
    /// A sink that drops every chunk
    pub fn discard(step: StepName) -> Self {
        Self { step, tx: None }
    }

    pub fn step(&self) -> StepName {
        self.step
    }

    /// Forward a chunk verbatim as a `TokenChunk` event
    pub async fn emit(&self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        if let Some(ref tx) = self.tx {
            // A closed channel means the caller left; the orchestrator notices
            // on its own and cancels the step.
            let _ = tx
                .send(ProgressEvent::TokenChunk {
                    step: self.step,
                    text,
                })
                .await;
        }
    }
}

/// Consumer side: the ordered events of one request, readable once
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
    finished: bool,
}

impl ProgressStream {
    /// Next event, or `None` after the terminal event
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await?;
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Drain every event up to and including the terminal one
    pub async fn collect_all(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}
