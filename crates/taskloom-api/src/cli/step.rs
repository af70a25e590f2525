//! CLI step run subcommands.

use anyhow::Result;
use clap::Subcommand;
use console::style;

use super::parse_json_arg;
use super::run::{parse_id, step_table};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum StepCommand {
    /// Show a single step run.
    Show {
        /// Step run ID.
        id: String,
    },

    /// Replay a finished step run and every step downstream of it.
    ///
    /// Fails without changing anything if the step or one of its
    /// descendants is still in flight.
    Replay {
        /// Step run ID.
        id: String,

        /// Replace the step's input with this JSON object.
        #[arg(long)]
        input: Option<String>,
    },
}

pub async fn handle_step_command(cmd: StepCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        StepCommand::Show { id } => {
            let step = state.engine.get_step_run(&parse_id(&id)?).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&step)?);
            } else {
                println!();
                println!("{}", step_table(std::slice::from_ref(&step)));
                if let Some(output) = &step.output {
                    println!("  Output: {}", serde_json::to_string(output)?);
                }
                println!();
            }
            Ok(())
        }
        StepCommand::Replay { id, input } => {
            let input = match input.as_deref() {
                Some(raw) => Some(parse_json_arg(Some(raw), "input")?),
                None => None,
            };
            let step = state.engine.replay_step_run(&parse_id(&id)?, input).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&step)?);
            } else {
                println!();
                println!(
                    "  {} Replaying step '{}' of run {}",
                    style("*").green().bold(),
                    style(&step.step_name).cyan(),
                    step.workflow_run_id
                );
                println!("  Status: {}", step.status);
                println!();
            }
            Ok(())
        }
    }
}
