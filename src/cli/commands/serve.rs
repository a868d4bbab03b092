use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::config::Config;
use crate::hub::BroadcastHub;
use crate::server::{create_router, AppState};
use crate::store::{SnapshotScheduler, SnapshotStore};
use crate::usage::StatsReader;
use crate::watch::{ChangeDispatcher, DebouncedWatcher, WatchError};

/// Run the dashboard server until Ctrl+C
pub async fn run(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate()?;

    let reader = StatsReader::new(config.claude_dir_path());
    let pricing = config.pricing_table()?;
    let store = SnapshotStore::open(config.database_file())?;
    let hub = BroadcastHub::new(config.heartbeat_interval());

    let scheduler = SnapshotScheduler::new(
        reader.clone(),
        store.clone(),
        config.snapshot_interval(),
        config.snapshots.retention_days,
    )
    .spawn();

    let submitter = ChangeDispatcher::new(reader.clone(), hub.clone()).spawn(&Handle::current());
    let mut watcher = DebouncedWatcher::new(reader.claude_dir(), config.watch_options());
    match watcher.start(submitter.into_callback()) {
        Ok(()) => {}
        Err(WatchError::RootNotFound(root)) => {
            tracing::warn!(root = %root.display(), "Claude directory not found, live updates disabled");
        }
        Err(e) => return Err(e).context("Failed to start file watcher"),
    }

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    println!("\n{}", "  Token Monitor".bold().bright_yellow());
    println!("{}", "  ─────────────────────────────".dimmed());
    println!("  {} http://{}/api", "API:".bold(), addr);
    println!("  {} ws://{}/ws", "Live:".bold(), addr);
    println!("  {} {}", "Watching:".bold(), reader.claude_dir().display());
    println!("  {} {}", "Database:".bold(), store.path().display());
    println!("\n  {}", "Press Ctrl+C to stop".dimmed());

    let state = Arc::new(AppState {
        config,
        reader,
        pricing,
        hub: hub.clone(),
        store,
    });

    let served = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    tracing::info!("Shutting down");
    tokio::task::spawn_blocking(move || watcher.stop())
        .await
        .context("File watcher shutdown failed")?;
    hub.shutdown().await.ok();
    scheduler.abort();

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
