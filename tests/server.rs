//! HTTP Server Integration Tests
//!
//! The router served on an ephemeral port, driven with a real HTTP client.

mod common;

use serde_json::{json, Value};

use common::{Harness, TOP_ARTISTS_ANSWER};
use sqlpilot::server::router;
use sqlpilot::Orchestrator;

async fn spawn(orchestrator: Orchestrator) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(orchestrator)).await.unwrap();
    });
    format!("http://{}", address)
}

/// JSON payloads of an SSE body, in order
fn sse_payloads(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_health() {
    let base = spawn(Harness::new().orchestrator()).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_chat_streams_progress_events() {
    let harness = Harness::answering_top_artists();
    let orchestrator = harness.orchestrator();
    let base = spawn(orchestrator.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({"message": "Who are the top 5 artists by sales?", "thread_id": "web-1"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = sse_payloads(&response.text().await.unwrap());
    assert_eq!(events.first().unwrap()["type"], "start");
    assert_eq!(events.first().unwrap()["thread_id"], "web-1");
    assert_eq!(
        events.last().unwrap(),
        &json!({"type": "end", "outcome": "answered", "retry_count": 0})
    );

    let streamed: String = events
        .iter()
        .filter(|event| event["type"] == "token")
        .map(|event| event["text"].as_str().unwrap())
        .collect();
    assert_eq!(streamed, TOP_ARTISTS_ANSWER);

    let chart = events
        .iter()
        .find(|event| event["step"] == "visualization_generation")
        .unwrap();
    let spec = &chart["update"]["visualization_spec"];
    assert_eq!(spec["mark"]["type"], "bar");
    assert_eq!(spec["encoding"]["y"]["field"], "Sales");
    assert_eq!(spec["data"]["values"].as_array().unwrap().len(), 5);

    // The turn is visible on the thread endpoint as soon as the stream ends
    let thread: Value = reqwest::get(format!("{}/api/threads/web-1", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(thread["thread_id"], "web-1");
    assert_eq!(thread["turns"][0]["status"]["status"], "completed");
    assert_eq!(thread["turns"][0]["response"], TOP_ARTISTS_ANSWER);
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let base = spawn(Harness::new().orchestrator()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({"message": "   "}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_argument");
}

#[tokio::test]
async fn test_unknown_thread_is_not_found() {
    let base = spawn(Harness::new().orchestrator()).await;

    let response = reqwest::get(format!("{}/api/threads/nobody", base))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
