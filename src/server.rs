//! HTTP transport.
//!
//! - `POST /api/chat` starts a request and streams its progress events as
//!   server-sent events, one JSON object per event
//! - `GET /api/threads/{thread_id}` returns the turns recorded for a thread
//! - `GET /health`
//!
//! Closing the event stream early cancels the request.

use std::convert::Infallible;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::Orchestrator;
use crate::domain::Turn;

pub const DEFAULT_THREAD: &str = "default_thread";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default = "default_thread")]
    pub thread_id: String,
}

fn default_thread() -> String {
    DEFAULT_THREAD.to_string()
}

#[derive(Debug, Serialize)]
pub struct ThreadView {
    pub thread_id: String,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message: message.into(),
        }),
    )
}

/// Routes over a shared orchestrator
pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/threads/{thread_id}", get(thread))
        .with_state(orchestrator)
}

/// Bind `address` and serve until the process is stopped
pub async fn serve(orchestrator: Orchestrator, address: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    info!(address, "Listening");

    axum::serve(listener, router(orchestrator))
        .await
        .context("Server terminated with error")
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn chat(
    State(orchestrator): State<Orchestrator>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_argument",
            "message must not be empty",
        ));
    }

    let events = orchestrator
        .stream(request.message, request.thread_id)
        .map(|event| {
            let payload = serde_json::to_string(&event).unwrap_or_else(|e| {
                warn!(error = %e, "Failed to serialize progress event");
                "{}".to_string()
            });
            Ok(SseEvent::default().data(payload))
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn thread(
    State(orchestrator): State<Orchestrator>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadView>, ApiError> {
    match orchestrator.threads().history(&thread_id) {
        Some(turns) => Ok(Json(ThreadView { thread_id, turns })),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("unknown thread: {}", thread_id),
        )),
    }
}
