//! Taskloom CLI entry point.
//!
//! Binary name: `loom`
//!
//! Parses CLI arguments, loads `config.toml`, initializes tracing and the
//! SQLite-backed engine, then dispatches to the command handler or runs the
//! engine loops (`loom serve`).

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;
use taskloom_infra::config::{data_dir, load_engine_config};
use taskloom_observe::tracing_setup::{filter_for_verbosity, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need config or state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "loom", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(data_dir);
    let (config, config_error) = load_engine_config(&data_dir).await;

    let mut log = config.logging.clone();
    log.level = filter_for_verbosity(cli.verbose, cli.quiet, &log.level);
    if let Err(e) = init_tracing(&log) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }
    if let Some(e) = config_error {
        tracing::warn!(error = %e, "using default configuration");
    }

    let result = run(cli, data_dir, config).await;
    shutdown_tracing();

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => Err(e),
    }
}

/// Dispatch a parsed command. `Ok(false)` means the command reported a
/// failure itself and the process should exit non-zero.
async fn run(cli: Cli, data_dir: std::path::PathBuf, config: taskloom_types::config::EngineConfig) -> anyhow::Result<bool> {
    // Config commands inspect the file without opening the database
    if let Commands::Config { command } = cli.command {
        return cli::config::handle_config_command(command, &data_dir, cli.json).await;
    }

    let state = AppState::init(data_dir, config).await?;

    match cli.command {
        Commands::Serve => cli::serve::serve(state).await?,
        Commands::Workflow { command } => {
            cli::workflow::handle_workflow_command(command, &state, cli.json).await?
        }
        Commands::Run { command } => cli::run::handle_run_command(command, &state, cli.json).await?,
        Commands::Step { command } => cli::step::handle_step_command(command, &state, cli.json).await?,
        Commands::Worker { command } => {
            cli::worker::handle_worker_command(command, &state, cli.json).await?
        }
        Commands::Event { command } => cli::event::handle_event_command(command, &state, cli.json).await?,
        Commands::Config { .. } | Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(true)
}
