//! CLI event subcommands.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use clap::Subcommand;
use console::style;

use super::parse_json_arg;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum EventCommand {
    /// Push an event, triggering every workflow that listens for its key.
    Push {
        /// Event key, e.g. `user:created`.
        key: String,

        /// JSON object carried by the event.
        #[arg(long)]
        data: Option<String>,

        /// Extra metadata as key=value (repeatable).
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },
}

pub async fn handle_event_command(cmd: EventCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        EventCommand::Push { key, data, metadata } => {
            let data = parse_json_arg(data.as_deref(), "data")?;
            let metadata = parse_metadata(&metadata)?;
            let (event, runs) = state.engine.push_event(&key, data, metadata).await?;

            if json {
                let out = serde_json::json!({
                    "event": event,
                    "runs": runs,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }

            println!();
            println!(
                "  {} Pushed event '{}' ({})",
                style("*").green().bold(),
                style(&event.key).cyan(),
                event.id
            );
            if runs.is_empty() {
                println!("  No workflow listens for this key.");
            }
            for run in &runs {
                println!("  Triggered {} run {}", style(&run.workflow_name).cyan(), run.id);
            }
            println!();
            Ok(())
        }
    }
}

fn parse_metadata(pairs: &[String]) -> Result<BTreeMap<String, serde_json::Value>> {
    let mut metadata = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid metadata '{pair}', expected KEY=VALUE");
        };
        metadata.insert(key.to_string(), serde_json::Value::String(value.to_string()));
    }
    Ok(metadata)
}
