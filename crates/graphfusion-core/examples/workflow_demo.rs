//! Three-step workflow across two agents.
//!
//! Run with `cargo run -p graphfusion-core --example workflow_demo`.
//! Set `GRAPHFUSION_LOG_FORMAT=json` for JSON logs and `GRAPHFUSION_OTEL=1`
//! to export spans to stdout.

use graphfusion_core::WorkflowCoordinator;
use graphfusion_core::agent::{AgentDirectory, CapabilityAgent, CapabilityError};
use graphfusion_core::config::load_engine_config;
use graphfusion_core::knowledge::InMemoryKnowledgeSink;
use graphfusion_core::workflow::definition::parse_workflow_json;
use graphfusion_observe::{LogFormat, init_tracing, shutdown_tracing};
use graphfusion_types::workflow::StepInput;
use serde_json::{Value, json};

const WORKFLOW: &str = r#"{
    "name": "quarterly_review",
    "steps": [
        {
            "id": "sales_analysis",
            "agent_id": "analyst1",
            "task": "analyze_data",
            "input": {"data": "Q3_sales.csv"}
        },
        {
            "id": "market_research",
            "agent_id": "researcher1",
            "task": "find_references",
            "input": {"topic": "market_trends"},
            "depends_on": ["sales_analysis"],
            "retries": 2
        },
        {
            "id": "report_generation",
            "agent_id": "analyst1",
            "task": "generate_report",
            "input": {"analysis": "{{sales_analysis}}"},
            "depends_on": ["market_research"]
        }
    ]
}"#;

fn text_param(params: &StepInput, name: &str) -> Result<String, CapabilityError> {
    match params.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(CapabilityError::InvalidInput(format!("missing '{name}'"))),
    }
}

fn agents() -> AgentDirectory {
    let analyst = CapabilityAgent::new("analyst1", "Data Analyst")
        .with_capability("analyze_data", |params| async move {
            Ok(json!(format!("Analysis of {}", text_param(&params, "data")?)))
        })
        .with_capability("generate_report", |params| async move {
            Ok(json!(format!("Report: {}", text_param(&params, "analysis")?)))
        });

    let researcher = CapabilityAgent::new("researcher1", "Research Specialist")
        .with_capability("find_references", |params| async move {
            Ok(json!(format!("References about {}", text_param(&params, "topic")?)))
        })
        .with_capability("summarize", |params| async move {
            let text = text_param(&params, "text")?;
            let head: String = text.chars().take(50).collect();
            Ok(json!(format!("Summary: {head}...")))
        });

    let mut directory = AgentDirectory::new();
    directory.register(analyst);
    directory.register(researcher);
    directory
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = match std::env::var("GRAPHFUSION_LOG_FORMAT") {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::Pretty,
    };
    let enable_otel = std::env::var("GRAPHFUSION_OTEL").is_ok_and(|v| v == "1");
    init_tracing(format, enable_otel)?;

    let config = load_engine_config(std::path::Path::new(".")).await;
    let knowledge = InMemoryKnowledgeSink::new();
    let coordinator = WorkflowCoordinator::new(agents(), config).with_knowledge_sink(knowledge.clone());

    let spec = parse_workflow_json(WORKFLOW)?;
    let result = coordinator.execute_workflow(&spec, None).await?;

    println!("\nWorkflow '{}' finished: {}", spec.name, result.status);
    println!("Completed: {} steps", result.completed.len());
    println!("Failed: {} steps", result.failed.len());

    println!("\nDetailed Results:");
    for (step_id, completion) in &result.completed {
        println!("{step_id}: {} (attempts: {})", completion.result, completion.attempts);
    }
    for (step_id, error) in &result.failed {
        println!("{step_id} FAILED: {error}");
    }

    tokio::task::yield_now().await;
    println!("\nKnowledge records: {}", knowledge.records().len());

    shutdown_tracing();
    Ok(())
}
