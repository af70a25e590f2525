//! CLI workflow run subcommands: list, show, and cancel.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use uuid::Uuid;

use taskloom_core::repository::run::WorkflowRunFilter;
use taskloom_types::run::{StepRun, WorkflowRun, WorkflowRunStatus};

use super::{format_run_status, format_step_status};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum RunCommand {
    /// List workflow runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only runs of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Only runs in this status (pending, queued, running, succeeded, failed, cancelled).
        #[arg(long)]
        status: Option<WorkflowRunStatus>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show a run with its jobs and steps.
    Show {
        /// Workflow run ID.
        id: String,
    },

    /// Cancel a run. In-flight steps observe the cancellation on their next update.
    Cancel {
        /// Workflow run ID.
        id: String,

        /// Reason recorded on the run.
        #[arg(long, default_value = "cancelled from CLI")]
        reason: String,
    },
}

pub async fn handle_run_command(cmd: RunCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunCommand::List {
            workflow,
            status,
            limit,
        } => handle_list(workflow.as_deref(), status, limit, state, json).await,
        RunCommand::Show { id } => handle_show(&parse_id(&id)?, state, json).await,
        RunCommand::Cancel { id, reason } => handle_cancel(&parse_id(&id)?, &reason, state, json).await,
    }
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid ID: {raw}"))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(
    workflow: Option<&str>,
    status: Option<WorkflowRunStatus>,
    limit: u32,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let mut filter = WorkflowRunFilter {
        limit,
        ..Default::default()
    };
    if let Some(name) = workflow {
        let version = state
            .engine
            .latest_workflow_version(name)
            .await
            .with_context(|| format!("Workflow '{name}' not found"))?;
        filter.workflow_id = Some(version.workflow_id);
    }
    if let Some(status) = status {
        filter.statuses = vec![status];
    }

    let runs = state.engine.list_workflow_runs(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No workflow runs found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Priority"),
            Cell::new("Group key"),
            Cell::new("Created"),
        ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(run.id),
            Cell::new(&run.workflow_name),
            format_run_status(run.status),
            Cell::new(format!("{:?}", run.trigger.kind()).to_lowercase()),
            Cell::new(run.priority),
            Cell::new(run.concurrency_group_key.as_deref().unwrap_or("-")),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(id: &Uuid, state: &AppState, json: bool) -> Result<()> {
    let run = state.engine.get_workflow_run(id).await?;
    let jobs = state.engine.list_job_runs(id).await?;
    let steps = state.engine.list_step_runs(id).await?;

    if json {
        let out = serde_json::json!({
            "run": run,
            "jobs": jobs,
            "steps": steps,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_run_header(&run);

    if !jobs.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Job").fg(Color::Cyan),
                Cell::new("Kind"),
                Cell::new("Status"),
            ]);
        for job in &jobs {
            table.add_row(vec![
                Cell::new(&job.job_name),
                Cell::new(format!("{:?}", job.kind).to_lowercase()),
                Cell::new(format!("{:?}", job.status).to_lowercase()),
            ]);
        }
        println!("{table}");
        println!();
    }

    if !steps.is_empty() {
        println!("{}", step_table(&steps));
        println!();
    }
    Ok(())
}

fn print_run_header(run: &WorkflowRun) {
    println!();
    println!(
        "  {} {} ({})",
        style("Run").bold(),
        style(run.id).cyan(),
        style(&run.workflow_name).cyan()
    );
    println!("  Status:   {}", run.status);
    println!("  Priority: {}", run.priority);
    if let Some(key) = &run.concurrency_group_key {
        println!("  Group:    {key}");
    }
    if let Some(started) = run.started_at {
        println!("  Started:  {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(finished) = run.finished_at {
        println!("  Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(err) = &run.error {
        println!("  Error:    {}", style(err).red());
    }
    println!();
}

pub(crate) fn step_table(steps: &[StepRun]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Action"),
            Cell::new("Status"),
            Cell::new("Retries"),
            Cell::new("Worker"),
            Cell::new("Error"),
        ]);
    for step in steps {
        table.add_row(vec![
            Cell::new(&step.step_name),
            Cell::new(step.id),
            Cell::new(&step.action_id),
            format_step_status(step.status),
            Cell::new(format!("{}/{}", step.retry_count, step.max_retries)),
            Cell::new(step.worker_id.map(|w| w.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::new(step.error.as_deref().unwrap_or("")),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

async fn handle_cancel(id: &Uuid, reason: &str, state: &AppState, json: bool) -> Result<()> {
    let current = state.engine.get_workflow_run(id).await?;
    if current.status.is_terminal() {
        bail!("Run {id} is already {}", current.status);
    }

    let run = state.engine.cancel_workflow_run(id, reason).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Cancelled run {}",
        style("*").green().bold(),
        style(run.id).cyan()
    );
    println!();
    Ok(())
}
