//! CLI worker subcommands.

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};

use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// List registered workers with their slot usage.
    #[command(alias = "ls")]
    List,
}

pub async fn handle_worker_command(cmd: WorkerCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        WorkerCommand::List => handle_list(state, json).await,
    }
}

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let workers = state.engine.list_workers().await?;

    if json {
        let out: Vec<_> = workers
            .iter()
            .map(|w| {
                serde_json::json!({
                    "worker": w.worker,
                    "used_slots": w.used_slots,
                    "free_slots": w.free_slots(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if workers.is_empty() {
        println!();
        println!("  No workers registered.");
        println!();
        return Ok(());
    }

    let now = Utc::now();
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Active"),
            Cell::new("Slots"),
            Cell::new("Actions"),
            Cell::new("Last heartbeat"),
        ]);

    for capacity in &workers {
        let worker = &capacity.worker;
        let active = if worker.is_active {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::Red)
        };
        let since = (now - worker.last_heartbeat_at).num_seconds().max(0);
        table.add_row(vec![
            Cell::new(&worker.name),
            Cell::new(worker.id),
            active,
            Cell::new(format!("{}/{}", capacity.used_slots, worker.max_runs)),
            Cell::new(worker.actions.join(", ")),
            Cell::new(format!("{since}s ago")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
