//! CLI workflow management subcommands.
//!
//! Provides register, trigger, schedule, list, and schema operations for
//! workflow declarations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use taskloom_core::workflow::TriggerRequest;
use taskloom_core::workflow::registry::parse_declaration;
use taskloom_types::run::MAX_PRIORITY;
use taskloom_types::workflow::WorkflowDeclaration;

use super::parse_json_arg;
use crate::state::AppState;

/// Workflow management subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Register a workflow from a YAML or JSON declaration.
    ///
    /// Re-registering an unchanged declaration keeps the current version.
    Register {
        /// Path to the declaration file.
        file: PathBuf,
    },

    /// Trigger a workflow run manually.
    Trigger {
        /// Workflow name.
        name: String,

        /// JSON object passed to the run as input.
        #[arg(long)]
        input: Option<String>,

        /// Run priority (1 to 3, higher is served first).
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=MAX_PRIORITY as i64))]
        priority: Option<u8>,

        /// Reject the trigger if another run of this workflow used the same value.
        #[arg(long)]
        dedupe: Option<String>,
    },

    /// Schedule one run of a workflow at a fixed time.
    Schedule {
        /// Workflow name.
        name: String,

        /// RFC 3339 timestamp, e.g. 2026-01-01T09:00:00Z.
        #[arg(long)]
        at: DateTime<Utc>,

        /// JSON object passed to the run as input.
        #[arg(long)]
        input: Option<String>,
    },

    /// List registered workflows.
    #[command(alias = "ls")]
    List,

    /// Print the JSON schema of workflow declarations.
    Schema,
}

/// Dispatch a workflow subcommand.
pub async fn handle_workflow_command(cmd: WorkflowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Register { file } => handle_register(&file, state, json).await,
        WorkflowCommand::Trigger {
            name,
            input,
            priority,
            dedupe,
        } => handle_trigger(&name, input.as_deref(), priority, dedupe, state, json).await,
        WorkflowCommand::Schedule { name, at, input } => {
            handle_schedule(&name, at, input.as_deref(), state, json).await
        }
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Schema => handle_schema(),
    }
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

async fn handle_register(file: &PathBuf, state: &AppState, json: bool) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let declaration = parse_declaration(&text)?;
    let jobs = declaration.jobs.len();
    let steps: usize = declaration.jobs.iter().map(|j| j.steps.len()).sum();

    let registration = state.engine.register_workflow(declaration).await?;
    let version = &registration.version;

    if json {
        let out = serde_json::json!({
            "workflow_id": version.workflow_id.to_string(),
            "version_id": version.id.to_string(),
            "name": version.declaration.name,
            "version": version.version,
            "checksum": version.checksum,
            "created": registration.created,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if registration.created {
        println!(
            "  {} Registered workflow '{}' version {}",
            style("*").green().bold(),
            style(&version.declaration.name).cyan(),
            version.version
        );
    } else {
        println!(
            "  {} Workflow '{}' unchanged, still version {}",
            style("=").yellow().bold(),
            style(&version.declaration.name).cyan(),
            version.version
        );
    }
    println!("  Jobs: {jobs}");
    println!("  Steps: {steps}");
    println!("  Checksum: {}", style(&version.checksum).dim());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

async fn handle_trigger(
    name: &str,
    input: Option<&str>,
    priority: Option<u8>,
    dedupe: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let mut request = TriggerRequest::manual(name, parse_json_arg(input, "input")?);
    if let Some(priority) = priority {
        request = request.with_priority(priority);
    }
    if let Some(dedupe) = dedupe {
        request = request.with_dedupe(dedupe);
    }

    let run = state.engine.trigger_workflow(request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Triggered workflow '{}'",
        style("*").green().bold(),
        style(&run.workflow_name).cyan()
    );
    println!("  Run ID: {}", run.id);
    println!("  Status: {}", run.status);
    if let Some(key) = &run.concurrency_group_key {
        println!("  Group key: {key}");
    }
    println!();
    println!(
        "  Check progress: {}",
        style(format!("loom run show {}", run.id)).dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

async fn handle_schedule(
    name: &str,
    at: DateTime<Utc>,
    input: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let timer = state
        .engine
        .schedule_workflow_run(name, at, parse_json_arg(input, "input")?)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&timer)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Scheduled '{}' for {}",
        style("*").green().bold(),
        style(name).cyan(),
        at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Timer ID: {}", timer.id);
    println!(
        "  {}",
        style("The run is created by `loom serve` once the time passes.").dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state.engine.list_workflows().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Register one with: {}",
            style("loom workflow register <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Checksum"),
            Cell::new("Updated"),
        ]);

    for wf in &workflows {
        table.add_row(vec![
            Cell::new(&wf.name),
            Cell::new(wf.latest_version),
            Cell::new(wf.latest_checksum.get(..12).unwrap_or(&wf.latest_checksum)),
            Cell::new(wf.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

fn handle_schema() -> Result<()> {
    let schema = schemars::schema_for!(WorkflowDeclaration);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lists_declaration_fields() {
        let schema = serde_json::to_value(schemars::schema_for!(WorkflowDeclaration)).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        assert!(properties.contains_key("name"));
        assert!(properties.contains_key("jobs"));
        assert!(properties.contains_key("concurrency"));
    }

    #[test]
    fn test_run_status_cell_uses_display_name() {
        let cell = super::super::format_run_status(taskloom_types::run::WorkflowRunStatus::Queued);
        assert_eq!(cell.content(), "queued");
    }
}
