//! CLI command definitions and dispatch for the `loom` binary.
//!
//! Uses clap derive macros for argument parsing. The CLI follows a
//! noun-verb pattern (e.g., `loom workflow register`, `loom run show`).

pub mod config;
pub mod event;
pub mod run;
pub mod serve;
pub mod step;
pub mod worker;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};

use taskloom_types::run::{StepRunStatus, WorkflowRunStatus};

/// Durable workflow orchestration.
#[derive(Parser)]
#[command(name = "loom", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (defaults to $TASKLOOM_DATA_DIR, then ~/.taskloom).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the assignment, recovery, and timer loops until Ctrl+C.
    Serve,

    /// Register, trigger, and list workflows.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        command: workflow::WorkflowCommand,
    },

    /// Inspect and cancel workflow runs.
    Run {
        #[command(subcommand)]
        command: run::RunCommand,
    },

    /// Operate on individual step runs.
    Step {
        #[command(subcommand)]
        command: step::StepCommand,
    },

    /// Inspect registered workers.
    Worker {
        #[command(subcommand)]
        command: worker::WorkerCommand,
    },

    /// Push client events.
    Event {
        #[command(subcommand)]
        command: event::EventCommand,
    },

    /// Inspect the engine configuration.
    Config {
        #[command(subcommand)]
        command: config::ConfigCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse an optional JSON argument, defaulting to an empty object.
pub(crate) fn parse_json_arg(raw: Option<&str>, what: &str) -> anyhow::Result<serde_json::Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid JSON {what}: {e}")),
        None => Ok(serde_json::json!({})),
    }
}

pub(crate) fn format_run_status(status: WorkflowRunStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        WorkflowRunStatus::Pending => cell.fg(Color::Yellow),
        WorkflowRunStatus::Queued => cell.fg(Color::Magenta),
        WorkflowRunStatus::Running => cell.fg(Color::Blue),
        WorkflowRunStatus::Succeeded => cell.fg(Color::Green),
        WorkflowRunStatus::Failed => cell.fg(Color::Red),
        WorkflowRunStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

pub(crate) fn format_step_status(status: StepRunStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        StepRunStatus::Pending | StepRunStatus::PendingAssignment => cell.fg(Color::Yellow),
        StepRunStatus::Assigned => cell.fg(Color::Magenta),
        StepRunStatus::Running => cell.fg(Color::Blue),
        StepRunStatus::Succeeded => cell.fg(Color::Green),
        StepRunStatus::Failed => cell.fg(Color::Red),
        StepRunStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_trigger_with_priority() {
        let cli = Cli::try_parse_from([
            "loom", "workflow", "trigger", "nightly", "--input", "{\"a\":1}", "--priority", "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Workflow {
                command: workflow::WorkflowCommand::Trigger { name, priority, .. },
            } => {
                assert_eq!(name, "nightly");
                assert_eq!(priority, Some(3));
            }
            _ => panic!("expected workflow trigger"),
        }
    }

    #[test]
    fn test_rejects_unknown_status_filter() {
        let result = Cli::try_parse_from(["loom", "run", "list", "--status", "exploded"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_json_arg_defaults_to_empty_object() {
        assert_eq!(parse_json_arg(None, "input").unwrap(), serde_json::json!({}));
        assert!(parse_json_arg(Some("{not json"), "input").is_err());
    }
}
