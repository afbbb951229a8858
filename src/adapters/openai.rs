//! OpenAI-compatible chat-completions client.
//!
//! Implements both [`TextGenerator`] (plain and SSE-streamed completions) and
//! [`Classifier`] (a forced function call whose arguments are the result).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ChatMessage, ClassificationTask, Classifier, GenerationRequest, Temperature, TextGenerator};
use crate::config::LlmSettings;
use crate::core::error::CollaboratorError;
use crate::core::stream::TokenSink;

const SERVICE: &str = "llm";

/// HTTP client for a chat-completions endpoint
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    deterministic_temperature: f32,
    exploratory_temperature: f32,
}

impl OpenAiClient {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        if settings.api_key.is_none() {
            warn!("No API key configured for the language model; requests will be unauthenticated");
        }

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            deterministic_temperature: settings.deterministic_temperature,
            exploratory_temperature: settings.exploratory_temperature,
        })
    }

    fn temperature(&self, temperature: Temperature) -> f32 {
        match temperature {
            Temperature::Deterministic => self.deterministic_temperature,
            Temperature::Exploratory => self.exploratory_temperature,
        }
    }

    fn payload(&self, messages: &[ChatMessage], temperature: Temperature) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature(temperature),
        })
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, CollaboratorError> {
        let mut request = self.client.post(&self.endpoint).json(payload);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(unavailable(format!("API error {}: {}", status, body)));
        }
        Ok(response)
    }

    async fn post_json(&self, payload: &Value) -> Result<Value, CollaboratorError> {
        self.post(payload)
            .await?
            .json()
            .await
            .map_err(|e| malformed(format!("invalid response body: {}", e)))
    }

    async fn stream_completion(&self, payload: &Value, tokens: &TokenSink) -> Result<String, CollaboratorError> {
        let response = self.post(payload).await?;
        read_sse_body(response.bytes_stream(), tokens).await
    }
}

/// Forward the deltas of an SSE body to `tokens`; the body must end with `[DONE]`
async fn read_sse_body<S, B, E>(body: S, tokens: &TokenSink) -> Result<String, CollaboratorError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut pending: Vec<u8> = Vec::new();
    let mut text = String::new();
    let mut done = false;

    'read: while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| unavailable(format!("stream interrupted: {}", e)))?;
        pending.extend_from_slice(chunk.as_ref());

        // Split on newlines at the byte level so multi-byte characters
        // spanning two chunks stay intact
        while let Some(end) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            match parse_sse_line(&line) {
                SseLine::Delta(delta) => {
                    tokens.emit(delta.as_str()).await;
                    text.push_str(&delta);
                }
                SseLine::Done => {
                    done = true;
                    break 'read;
                }
                SseLine::Skip => {}
            }
        }
    }

    // A trailing `data: [DONE]` without its newline still counts
    if !done && parse_sse_line(&String::from_utf8_lossy(&pending)) == SseLine::Done {
        done = true;
        pending.clear();
    }
    if !done {
        warn!(chars = text.len(), unterminated = pending.len(), "Stream cut off");
        return Err(malformed("stream ended before [DONE]".to_string()));
    }

    debug!(chars = text.len(), "Stream finished");
    Ok(text)
}

/// One line of a server-sent-events body
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(parsed) => match parsed["choices"][0]["delta"]["content"].as_str() {
            Some(delta) if !delta.is_empty() => SseLine::Delta(delta.to_string()),
            _ => SseLine::Skip,
        },
        Err(_) => SseLine::Skip,
    }
}

/// Arguments of the first tool call, or `Null` when absent or not JSON
fn tool_arguments(response: &Value) -> Value {
    response["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"]
        .as_str()
        .and_then(|arguments| serde_json::from_str(arguments).ok())
        .unwrap_or(Value::Null)
}

fn unavailable(message: String) -> CollaboratorError {
    CollaboratorError::Unavailable {
        service: SERVICE,
        message,
    }
}

fn malformed(message: String) -> CollaboratorError {
    CollaboratorError::Malformed {
        service: SERVICE,
        message,
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest, tokens: &TokenSink) -> Result<String, CollaboratorError> {
        let mut payload = self.payload(&request.messages, request.temperature);
        debug!(step = %request.step, stream = request.stream, "Calling language model");

        if request.stream {
            payload["stream"] = json!(true);
            return self.stream_completion(&payload, tokens).await;
        }

        let response = self.post_json(&payload).await?;
        response["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| malformed("response has no message content".to_string()))
    }
}

#[async_trait]
impl Classifier for OpenAiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, task: &ClassificationTask, messages: &[ChatMessage]) -> Result<Value, CollaboratorError> {
        let mut payload = self.payload(messages, Temperature::Deterministic);
        payload["tools"] = json!([{
            "type": "function",
            "function": {
                "name": task.name,
                "description": task.description,
                "parameters": task.parameters,
            }
        }]);
        payload["tool_choice"] = json!({"type": "function", "function": {"name": task.name}});

        debug!(task = task.name, "Calling classifier");
        let response = self.post_json(&payload).await?;
        Ok(tool_arguments(&response))
    }
}
