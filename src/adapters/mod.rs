//! Collaborator interfaces for external systems.
//!
//! Steps never talk to the network or the database directly. They go through
//! three traits, each safe to share across concurrent requests:
//! - [`TextGenerator`]: chat-style text generation, optionally streamed
//! - [`Classifier`]: structured classification (returns JSON, never prose)
//! - [`DataStore`]: table listing, schema lookup and read-only execution

pub mod openai;
pub mod sqlite;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::error::{CollaboratorError, DataStoreError};
use crate::core::stream::TokenSink;
use crate::domain::{Row, StepName};

pub use openai::OpenAiClient;
pub use sqlite::SqliteStore;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Sampling mode requested by a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Temperature {
    /// Repeatable output (first attempts, rewriting)
    Deterministic,
    /// Higher temperature (retries, conversational replies)
    Exploratory,
}

/// A text-generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Step issuing the call, for logging and scripted fakes
    pub step: StepName,
    pub messages: Vec<ChatMessage>,
    pub temperature: Temperature,
    /// Forward incremental chunks to the token sink
    pub stream: bool,
}

/// A structured classification call, described as a function schema
#[derive(Debug, Clone)]
pub struct ClassificationTask {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON schema of the expected arguments
    pub parameters: Value,
}

/// Text-generation service
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Generate a completion. When `request.stream` is set, every chunk is
    /// forwarded to `tokens` in order before the full text is returned.
    async fn generate(
        &self,
        request: &GenerationRequest,
        tokens: &TokenSink,
    ) -> Result<String, CollaboratorError>;
}

/// Classification service
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Classify the conversation. Returns `Value::Null` when the service
    /// answered but its answer could not be parsed.
    async fn classify(
        &self,
        task: &ClassificationTask,
        messages: &[ChatMessage],
    ) -> Result<Value, CollaboratorError>;
}

/// Relational data store
#[async_trait]
pub trait DataStore: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tables(&self) -> Result<BTreeSet<String>, DataStoreError>;

    /// DDL text describing one table
    async fn schema_of(&self, table: &str) -> Result<String, DataStoreError>;

    /// Run a read-only statement, returning rows in result order
    async fn execute_read_only(&self, sql: &str) -> Result<Vec<Row>, DataStoreError>;
}
