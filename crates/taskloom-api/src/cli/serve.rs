//! `loom serve`: the long-running engine process.
//!
//! Registers this process as a dispatcher and a ticker, then runs the
//! assignment loop, recovery scanner, timer scanner and analytics flusher
//! side by side until Ctrl+C or SIGTERM. Every loop shares one
//! `CancellationToken`; shutdown cancels it and waits for each task so the
//! analytics buffer is flushed before exit.

use anyhow::Result;
use console::style;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskloom_core::analytics::spawn_buffered;
use taskloom_core::recovery::{RecoveryScanner, TimerScanner, select_freshest_peer};
use taskloom_infra::analytics_sink::JsonLinesSink;
use taskloom_types::ownership::OwnerKind;

use crate::state::{AppState, ConcreteEngine};

pub async fn serve(state: AppState) -> Result<()> {
    let cancel = CancellationToken::new();

    let sink = JsonLinesSink::in_data_dir(&state.data_dir);
    let (analytics, flusher) = spawn_buffered(sink, &state.engine.config().analytics, cancel.clone());
    let engine = state.engine.clone().with_analytics(analytics);

    let dispatcher = engine.register_coordinator(OwnerKind::Dispatcher).await?;
    let ticker = engine.register_coordinator(OwnerKind::Ticker).await?;

    let tasks = vec![
        tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run_assigner(cancel).await }
        }),
        tokio::spawn({
            let scanner = RecoveryScanner::new(engine.clone(), ticker.id);
            let cancel = cancel.clone();
            async move { scanner.run(cancel, select_freshest_peer).await }
        }),
        tokio::spawn({
            let timers = TimerScanner::new(engine.clone(), ticker.id);
            let cancel = cancel.clone();
            async move { timers.run(cancel).await }
        }),
        tokio::spawn(heartbeat_dispatcher(engine.clone(), dispatcher.id, cancel.clone())),
        flusher,
    ];

    println!();
    println!(
        "  {} taskloom engine running against {}",
        style("*").green().bold(),
        style(state.data_dir.display()).cyan()
    );
    println!("  Dispatcher: {}", dispatcher.id);
    println!("  Ticker:     {}", ticker.id);
    println!("  {}", style("Press Ctrl+C to stop").dim());

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "engine task panicked");
        }
    }

    println!("\n  Engine stopped.");
    Ok(())
}

/// Keep the dispatcher row fresh so its peers do not take over its units.
async fn heartbeat_dispatcher(engine: ConcreteEngine, dispatcher_id: Uuid, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(engine.config().recovery.scan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = engine.heartbeat_coordinator(OwnerKind::Dispatcher, &dispatcher_id).await {
                    tracing::warn!(error = %e, "dispatcher heartbeat failed");
                }
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
