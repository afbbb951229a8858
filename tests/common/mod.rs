//! Scripted in-process collaborators for integration tests.
//!
//! Each fake answers from a per-step (or per-task) queue of replies. When a
//! queue runs dry the last reply for that key is repeated, so a single
//! scripted reply covers every retry.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use sqlpilot::adapters::{
    ChatMessage, ClassificationTask, Classifier, DataStore, GenerationRequest, TextGenerator,
};
use sqlpilot::core::{CollaboratorError, DataStoreError, Policy, TokenSink};
use sqlpilot::domain::{ProgressEvent, Row, StateUpdate, StepName, Turn};
use sqlpilot::{Collaborators, Orchestrator, StepRunners};

/// One scripted answer
#[derive(Debug, Clone)]
pub enum Reply<T> {
    Ok(T),
    /// Answer after a delay
    Delayed(T, Duration),
    /// The service is down
    Unavailable,
    /// Never answer
    Hang,
    Panic(&'static str),
}

struct Script<K, T> {
    queues: HashMap<K, VecDeque<Reply<T>>>,
    last: HashMap<K, Reply<T>>,
}

impl<K: std::hash::Hash + Eq + Clone, T: Clone> Script<K, T> {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
            last: HashMap::new(),
        }
    }

    fn push(&mut self, key: K, reply: Reply<T>) {
        self.queues.entry(key).or_default().push_back(reply);
    }

    fn next(&mut self, key: &K) -> Option<Reply<T>> {
        let popped = self.queues.get_mut(key).and_then(VecDeque::pop_front);
        match popped {
            Some(reply) => {
                self.last.insert(key.clone(), reply.clone());
                Some(reply)
            }
            None => self.last.get(key).cloned(),
        }
    }
}

async fn answer<T>(reply: Option<Reply<T>>, service: &'static str) -> Result<T, CollaboratorError> {
    match reply {
        Some(Reply::Ok(value)) => Ok(value),
        Some(Reply::Delayed(value, delay)) => {
            tokio::time::sleep(delay).await;
            Ok(value)
        }
        Some(Reply::Unavailable) => Err(CollaboratorError::Unavailable {
            service,
            message: "connection refused".to_string(),
        }),
        Some(Reply::Hang) => std::future::pending::<Result<T, CollaboratorError>>().await,
        Some(Reply::Panic(message)) => panic!("{}", message),
        None => Err(CollaboratorError::Malformed {
            service,
            message: "no scripted reply".to_string(),
        }),
    }
}

/// Text generator answering per step; streams replies word by word
pub struct ScriptedGenerator {
    script: Mutex<Script<StepName, String>>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(&self, step: StepName, text: &str) -> &Self {
        self.push(step, Reply::Ok(text.to_string()))
    }

    pub fn push(&self, step: StepName, reply: Reply<String>) -> &Self {
        self.script.lock().unwrap().push(step, reply);
        self
    }

    pub fn calls_for(&self, step: StepName) -> Vec<GenerationRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.step == step)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        tokens: &TokenSink,
    ) -> Result<String, CollaboratorError> {
        self.calls.lock().unwrap().push(request.clone());
        let reply = self.script.lock().unwrap().next(&request.step);
        let text = answer(reply, "llm").await?;

        if request.stream {
            for chunk in text.split_inclusive(' ') {
                tokens.emit(chunk).await;
            }
        }
        Ok(text)
    }
}

/// Classifier answering per task name
pub struct ScriptedClassifier {
    script: Mutex<Script<&'static str, Value>>,
    calls: Mutex<Vec<(&'static str, Vec<ChatMessage>)>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(&self, task: &'static str, value: Value) -> &Self {
        self.push(task, Reply::Ok(value))
    }

    pub fn push(&self, task: &'static str, reply: Reply<Value>) -> &Self {
        self.script.lock().unwrap().push(task, reply);
        self
    }

    pub fn call_count(&self, task: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| *name == task)
            .count()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(
        &self,
        task: &ClassificationTask,
        messages: &[ChatMessage],
    ) -> Result<Value, CollaboratorError> {
        self.calls
            .lock()
            .unwrap()
            .push((task.name, messages.to_vec()));
        let reply = self.script.lock().unwrap().next(&task.name);
        answer(reply, "llm").await
    }
}

/// What the fake store does when asked to execute
#[derive(Debug, Clone)]
pub enum Execution {
    Rows(Vec<Row>),
    QueryError(String),
    Unavailable,
}

/// In-memory data store with a fixed schema
pub struct FakeStore {
    tables: BTreeMap<String, String>,
    executions: Mutex<VecDeque<Execution>>,
    last: Mutex<Option<Execution>>,
    executed: Mutex<Vec<String>>,
}

impl FakeStore {
    /// Chinook-like schema: Artist, Album, Track, Invoice, InvoiceLine
    pub fn chinook() -> Self {
        let tables = [
            ("Artist", "CREATE TABLE Artist (ArtistId INTEGER PRIMARY KEY, Name TEXT)"),
            ("Album", "CREATE TABLE Album (AlbumId INTEGER PRIMARY KEY, Title TEXT, ArtistId INTEGER)"),
            ("Track", "CREATE TABLE Track (TrackId INTEGER PRIMARY KEY, Name TEXT, AlbumId INTEGER, UnitPrice NUMERIC)"),
            ("Invoice", "CREATE TABLE Invoice (InvoiceId INTEGER PRIMARY KEY, Total NUMERIC)"),
            ("InvoiceLine", "CREATE TABLE InvoiceLine (InvoiceLineId INTEGER PRIMARY KEY, InvoiceId INTEGER, TrackId INTEGER, Quantity INTEGER)"),
        ];
        Self {
            tables: tables
                .iter()
                .map(|(name, ddl)| (name.to_string(), ddl.to_string()))
                .collect(),
            executions: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn then(&self, execution: Execution) -> &Self {
        self.executions.lock().unwrap().push_back(execution);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataStore for FakeStore {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_tables(&self) -> Result<BTreeSet<String>, DataStoreError> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn schema_of(&self, table: &str) -> Result<String, DataStoreError> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| DataStoreError::Query(format!("no such table: {}", table)))
    }

    async fn execute_read_only(&self, sql: &str) -> Result<Vec<Row>, DataStoreError> {
        self.executed.lock().unwrap().push(sql.to_string());

        let popped = self.executions.lock().unwrap().pop_front();
        let execution = match popped {
            Some(execution) => {
                *self.last.lock().unwrap() = Some(execution.clone());
                Some(execution)
            }
            None => self.last.lock().unwrap().clone(),
        };

        match execution {
            Some(Execution::Rows(rows)) => Ok(rows),
            Some(Execution::QueryError(message)) => Err(DataStoreError::Query(message)),
            Some(Execution::Unavailable) | None => {
                Err(DataStoreError::Unavailable("unable to open database file".to_string()))
            }
        }
    }
}

/// The three fakes, wired together
pub struct Harness {
    pub generator: Arc<ScriptedGenerator>,
    pub classifier: Arc<ScriptedClassifier>,
    pub store: Arc<FakeStore>,
}

pub const TOP_ARTISTS_SQL: &str = "SELECT ar.Name, SUM(il.UnitPrice * il.Quantity) AS Sales \
FROM Artist ar JOIN Album al ON al.ArtistId = ar.ArtistId \
JOIN Track t ON t.AlbumId = al.AlbumId \
JOIN InvoiceLine il ON il.TrackId = t.TrackId \
GROUP BY ar.Name ORDER BY Sales DESC LIMIT 5";

pub const TOP_ARTISTS_TABLES: &[&str] = &["Artist", "Album", "Track", "InvoiceLine"];

pub const TOP_ARTISTS_ANSWER: &str =
    "Iron Maiden leads with 138.60 in sales, followed by U2, Metallica, Led Zeppelin and Lost.";

impl Harness {
    pub fn new() -> Self {
        Self {
            generator: Arc::new(ScriptedGenerator::new()),
            classifier: Arc::new(ScriptedClassifier::new()),
            store: Arc::new(FakeStore::chinook()),
        }
    }

    /// Scripts for a relevant question: routing, rewriting, table selection,
    /// the given generation replies (the last one repeats) and a bar chart plan
    pub fn relevant_question(tables: &[&str], generations: &[&str]) -> Self {
        let harness = Self::new();
        harness
            .classifier
            .reply("route_query", json!({"relevance": "relevant"}))
            .reply("select_tables", json!({ "selected_tables": tables }))
            .reply(
                "plan_visualization",
                json!({
                    "needs_visualization": true,
                    "visualization_type": "bar",
                    "reasoning": "Ranking across artists"
                }),
            );
        harness.generator.reply(
            StepName::Rewriting,
            "Show the top 5 artists by total sales amount",
        );
        for sql in generations {
            harness.generator.reply(StepName::Generation, sql);
        }
        harness
    }

    /// A question answered on the first attempt
    pub fn answering_top_artists() -> Self {
        let harness = Self::relevant_question(TOP_ARTISTS_TABLES, &[TOP_ARTISTS_SQL]);
        harness
            .generator
            .reply(StepName::Synthesis, TOP_ARTISTS_ANSWER);
        harness.store.then(Execution::Rows(top_artist_rows()));
        harness
    }

    pub fn runners(&self) -> StepRunners {
        let collaborators = Collaborators {
            generator: self.generator.clone(),
            classifier: self.classifier.clone(),
            store: self.store.clone(),
        };
        StepRunners::standard(&collaborators, sqlpilot::steps::DEFAULT_SUBJECT)
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(Policy::default())
    }

    pub fn orchestrator_with(&self, policy: Policy) -> Orchestrator {
        Orchestrator::new(self.runners(), policy).unwrap()
    }
}

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

pub fn top_artist_rows() -> Vec<Row> {
    vec![
        row(json!({"Name": "Iron Maiden", "Sales": 138.6})),
        row(json!({"Name": "U2", "Sales": 105.93})),
        row(json!({"Name": "Metallica", "Sales": 90.09})),
        row(json!({"Name": "Led Zeppelin", "Sales": 86.13})),
        row(json!({"Name": "Lost", "Sales": 81.59})),
    ]
}

/// Wait until the thread has recorded `count` turns
pub async fn wait_for_turns(orchestrator: &Orchestrator, thread_id: &str, count: usize) -> Vec<Turn> {
    for _ in 0..500 {
        if let Some(turns) = orchestrator.threads().history(thread_id) {
            if turns.len() >= count {
                return turns;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("thread {} never recorded {} turn(s)", thread_id, count);
}

/// Updates streamed for one step, in order
pub fn updates(events: &[ProgressEvent], step: StepName) -> Vec<StateUpdate> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::StepUpdate { step: s, update, .. } if *s == step => Some(update.clone()),
            _ => None,
        })
        .collect()
}

/// Steps in the order their updates were streamed
pub fn steps(events: &[ProgressEvent]) -> Vec<StepName> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::StepUpdate { step, .. } => Some(*step),
            _ => None,
        })
        .collect()
}

/// Concatenated token chunks for one step
pub fn tokens(events: &[ProgressEvent], step: StepName) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::TokenChunk { step: s, text } if *s == step => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
