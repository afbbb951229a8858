//! Command-line interface for sqlpilot.
//!
//! Provides commands for asking questions, serving the HTTP API, inspecting
//! the database and the step graph, and checking SQL against the safety policy.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::adapters::{DataStore, OpenAiClient, SqliteStore};
use crate::config::{self, ResolvedConfig};
use crate::core::{fingerprint, Orchestrator, TransitionTable};
use crate::domain::{final_response, ProgressEvent};
use crate::steps::{Collaborators, StepRunners};

/// sqlpilot - ask questions of a SQL database in plain language
#[derive(Parser, Debug)]
#[command(name = "sqlpilot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log line format on stderr
    #[arg(long, global = true, env = "SQLPILOT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a question and stream the answer
    Ask {
        /// The question
        message: String,

        /// Conversation thread to record the turn under
        #[arg(short, long, default_value = "cli")]
        thread: String,

        /// Print every progress event as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP server
    Serve {
        /// Address to bind to (defaults to server.address)
        #[arg(short, long)]
        address: Option<String>,
    },

    /// List the tables of the configured database
    Tables {
        /// Also print each table's definition
        #[arg(short, long)]
        schema: bool,
    },

    /// Check a SQL statement against the read-only policy
    CheckSql {
        /// SQL text
        sql: String,
    },

    /// Print the step graph and verify it
    Graph,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Ask {
                message,
                thread,
                json,
            } => ask(&message, &thread, json).await,
            Commands::Serve { address } => serve(address).await,
            Commands::Tables { schema } => list_tables(schema).await,
            Commands::CheckSql { sql } => check_sql(&sql),
            Commands::Graph => show_graph(),
            Commands::Config => show_config(),
        }
    }
}

/// Wire the configured database and language model into an orchestrator
pub fn build_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let store = SqliteStore::open(&cfg.database)?;
    let llm = Arc::new(OpenAiClient::new(&cfg.llm)?);

    let collaborators = Collaborators {
        generator: llm.clone(),
        classifier: llm,
        store: Arc::new(store),
    };
    let runners = StepRunners::standard(&collaborators, &cfg.database.subject);

    Orchestrator::new(runners, cfg.policy.clone())
}

/// Ask one question, streaming tokens to stdout and progress to stderr
async fn ask(message: &str, thread: &str, json: bool) -> Result<()> {
    if message.trim().is_empty() {
        anyhow::bail!("Question is empty");
    }

    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;

    let mut stream = orchestrator.stream(message, thread);
    let mut events = Vec::new();
    let mut streamed = false;
    let mut stdout = io::stdout();

    while let Some(event) = stream.recv().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            match &event {
                ProgressEvent::TokenChunk { text, .. } => {
                    print!("{}", text);
                    stdout.flush().context("Failed to write to stdout")?;
                    streamed = true;
                }
                ProgressEvent::StepUpdate { step, update, .. } => {
                    if let Some(ref sql) = update.candidate_sql {
                        eprintln!("[{}] {}", step, sql);
                    }
                    if let Some(Some(ref error)) = update.validation_error {
                        eprintln!("[{}] rejected: {}", step, error);
                    }
                    if let Some(Some(ref error)) = update.execution_error {
                        eprintln!("[{}] failed: {}", step, error);
                    }
                }
                _ => {}
            }
        }
        events.push(event);
    }

    if json {
        return finish(&events);
    }

    if streamed {
        println!();
    } else if let Some(response) = final_response(&events) {
        println!("{}", response);
    }

    let chart = events.iter().rev().find_map(|event| match event {
        ProgressEvent::StepUpdate { update, .. } => update.visualization_spec.clone().flatten(),
        _ => None,
    });
    if let Some(spec) = chart {
        eprintln!(
            "\n[{} chart: {} by {}, {} point(s)]",
            spec.kind.as_str(),
            spec.value_field,
            spec.category_field,
            spec.data.len()
        );
    }

    finish(&events)
}

/// Report the terminal event; failures exit non-zero
fn finish(events: &[ProgressEvent]) -> Result<()> {
    match events.last() {
        Some(ProgressEvent::End {
            outcome,
            retry_count,
        }) => {
            eprintln!("\n[{:?}, retries: {}]", outcome, retry_count);
            Ok(())
        }
        Some(ProgressEvent::Failure { kind, message }) => {
            eprintln!("\n[Request failed ({:?}): {}]", kind, message);
            std::process::exit(1);
        }
        _ => anyhow::bail!("Progress stream ended without a terminal event"),
    }
}

/// Start the HTTP server
async fn serve(address: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;
    let address = address.unwrap_or_else(|| cfg.server.address.clone());

    eprintln!("sqlpilot listening on http://{}", address);
    crate::server::serve(orchestrator, &address).await
}

/// List tables in the configured database
async fn list_tables(schema: bool) -> Result<()> {
    let cfg = config::config()?;
    let store = SqliteStore::open(&cfg.database)?;

    let tables = store.list_tables().await?;
    if tables.is_empty() {
        println!("No tables found in {}", store.path().display());
        return Ok(());
    }

    for table in &tables {
        if schema {
            let ddl = store.schema_of(table).await?;
            println!("{};\n", ddl);
        } else {
            println!("{}", table);
        }
    }

    Ok(())
}

/// Check SQL against the configured denylist
fn check_sql(sql: &str) -> Result<()> {
    let cfg = config::config()?;
    let verdict = cfg.policy.safety.validate(sql);

    if verdict.accepted {
        println!("accepted ({})", fingerprint(sql));
        Ok(())
    } else {
        println!("rejected: {}", verdict.reason.unwrap_or_default());
        std::process::exit(1);
    }
}

/// Print the transition table after checking it
fn show_graph() -> Result<()> {
    let table = TransitionTable::standard();
    table.validate().context("Step graph failed verification")?;

    let max_retries = config::config()
        .map(|cfg| cfg.policy.max_retries)
        .unwrap_or(3);

    println!("{}", table.describe());
    println!(
        "Verified: every step reachable, every run terminates \
         (max_retries = {}: at most {} generation attempts).",
        max_retries,
        max_retries + 1
    );

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Database:");
    println!("  Path:      {}", cfg.database.path.display());
    println!("  Pool size: {}", cfg.database.pool_size);
    println!("  Max rows:  {}", cfg.database.max_rows);
    println!();
    println!("Language model:");
    println!("  Endpoint:  {}", cfg.llm.endpoint);
    println!("  Model:     {}", cfg.llm.model);
    println!(
        "  API key:   {}",
        if cfg.llm.api_key.is_some() { "(set)" } else { "(missing)" }
    );
    println!(
        "  Temperatures: {} / {}",
        cfg.llm.deterministic_temperature, cfg.llm.exploratory_temperature
    );
    println!();
    println!("Policy:");
    println!("  Max retries:     {}", cfg.policy.max_retries);
    println!("  Step timeout:    {}s", cfg.policy.step_timeout_seconds);
    let mut overrides: Vec<_> = cfg.policy.step_timeouts.iter().collect();
    overrides.sort_by_key(|(step, _)| step.as_str());
    for (step, seconds) in overrides {
        println!("    {:<24} {}s", step.as_str(), seconds);
    }
    println!("  Synthesis chars: {}", cfg.policy.synthesis_context_chars);
    println!(
        "  History:         {} turns/thread, {} threads",
        cfg.policy.max_turns_per_thread, cfg.policy.max_threads
    );
    println!("  Denylist:        {}", cfg.policy.safety.denylist.join(", "));
    println!();
    println!("Server address: {}", cfg.server.address);

    Ok(())
}
