//! Step Runner Integration Tests
//!
//! Individual runners against scripted collaborators, outside the
//! orchestrator.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;

use common::{row, FakeStore, ScriptedClassifier, ScriptedGenerator};
use sqlpilot::core::{Policy, ProgressSink, SqlSafetyPolicy, TokenSink};
use sqlpilot::domain::{ChartKind, ProgressEvent, Relevance, RequestState, StepName};
use sqlpilot::steps::{
    GeneralReplyStep, GenerationStep, RewritingStep, StepContext, StepRunner, SynthesisStep,
    TableSelectionStep, ValidationStep, VisualizationGenerationStep, DEFAULT_SUBJECT,
};

fn context(step: StepName) -> StepContext {
    context_with(step, Policy::default())
}

fn context_with(step: StepName, policy: Policy) -> StepContext {
    StepContext {
        tokens: TokenSink::discard(step),
        policy: Arc::new(policy),
    }
}

fn relevant(query: &str) -> RequestState {
    let mut state = RequestState::new("t", query);
    state.relevance = Relevance::Relevant;
    state
}

#[tokio::test]
async fn test_table_selection_keeps_only_live_tables() {
    let classifier = Arc::new(ScriptedClassifier::new());
    classifier.reply("select_tables", json!({"selected_tables": ["Album", "Ghost"]}));
    let step = TableSelectionStep::new(classifier.clone(), Arc::new(FakeStore::chinook()));

    let update = step
        .run(&relevant("albums per artist"), &context(StepName::TableSelection))
        .await
        .unwrap();

    assert_eq!(
        update.selected_tables,
        Some(BTreeSet::from(["Album".to_string()]))
    );
    assert_eq!(update.logs, vec!["dropped unknown tables: Ghost".to_string()]);
}

#[tokio::test]
async fn test_generation_strips_markdown_fences() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.reply(
        StepName::Generation,
        "```sql\nSELECT COUNT(*) FROM Track\n```",
    );
    let step = GenerationStep::new(generator.clone(), Arc::new(FakeStore::chinook()));

    let mut state = relevant("how many tracks?");
    state.selected_tables = BTreeSet::from(["Track".to_string()]);
    let update = step
        .run(&state, &context(StepName::Generation))
        .await
        .unwrap();

    assert_eq!(update.candidate_sql.as_deref(), Some("SELECT COUNT(*) FROM Track"));
    assert_eq!(update.logs.len(), 1);
}

#[tokio::test]
async fn test_rewriting_falls_back_to_original_question() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.reply(StepName::Rewriting, "   ");
    let step = RewritingStep::new(generator);

    let update = step
        .run(&relevant("best customers"), &context(StepName::Rewriting))
        .await
        .unwrap();

    assert_eq!(update.refined_query.as_deref(), Some("best customers"));
    assert!(!update.logs.is_empty());
}

#[tokio::test]
async fn test_validation_uses_configured_denylist() {
    let policy = Policy {
        safety: SqlSafetyPolicy {
            denylist: vec!["PRAGMA".to_string(), "DROP".to_string()],
        },
        ..Default::default()
    };
    let mut state = relevant("describe the track table");
    state.candidate_sql = "pragma table_info(Track)".to_string();

    let update = ValidationStep
        .run(&state, &context_with(StepName::Validation, policy))
        .await
        .unwrap();

    let reason = update.validation_error.flatten().unwrap();
    assert!(reason.contains("PRAGMA"));
    assert_eq!(update.execution_error, Some(None));
}

#[tokio::test]
async fn test_synthesis_prompt_is_truncated() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.reply(StepName::Synthesis, "Lots of tracks.");
    let step = SynthesisStep::new(generator.clone());

    let mut state = relevant("list every track");
    state.candidate_sql = "SELECT Name FROM Track".to_string();
    state.execution_result = (0..100)
        .map(|i| row(json!({"Name": format!("Track {}", i)})))
        .collect();
    let policy = Policy {
        synthesis_context_chars: 50,
        ..Default::default()
    };

    let update = step
        .run(&state, &context_with(StepName::Synthesis, policy))
        .await
        .unwrap();

    assert_eq!(update.final_response.as_deref(), Some("Lots of tracks."));
    let prompt = &generator.calls_for(StepName::Synthesis)[0].messages[0].content;
    assert!(prompt.contains("... (truncated)"));
    assert!(prompt.contains("Rows returned: 100"));
    assert!(!prompt.contains("Track 99"));
}

#[tokio::test]
async fn test_chart_degrades_without_numeric_column() {
    let mut state = relevant("list artist names as a chart");
    state.needs_visualization = true;
    state.chart_kind = Some(ChartKind::Pie);
    state.execution_result = vec![
        row(json!({"Name": "AC/DC"})),
        row(json!({"Name": "Accept"})),
    ];

    let update = VisualizationGenerationStep
        .run(&state, &context(StepName::VisualizationGeneration))
        .await
        .unwrap();

    assert_eq!(update.visualization_spec, Some(None));
    assert_eq!(update.logs.len(), 1);
}

#[tokio::test]
async fn test_general_reply_streams_tokens_in_order() {
    let generator = Arc::new(ScriptedGenerator::new());
    let reply = "I only know about the music store. Try asking about top albums.";
    generator.reply(StepName::GeneralReply, reply);
    let step = GeneralReplyStep::new(generator, DEFAULT_SUBJECT);

    let (sink, stream) = ProgressSink::channel(64);
    let ctx = StepContext {
        tokens: sink.tokens(StepName::GeneralReply),
        policy: Arc::new(Policy::default()),
    };

    let update = step.run(&RequestState::new("t", "hello"), &ctx).await.unwrap();
    drop(ctx);
    drop(sink);

    let streamed: String = stream
        .collect_all()
        .await
        .into_iter()
        .map(|event| match event {
            ProgressEvent::TokenChunk { step, text } => {
                assert_eq!(step, StepName::GeneralReply);
                text
            }
            other => panic!("unexpected event: {:?}", other),
        })
        .collect();

    assert_eq!(streamed, reply);
    assert_eq!(update.final_response.as_deref(), Some(reply));
}
