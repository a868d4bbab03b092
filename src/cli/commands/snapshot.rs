use anyhow::{bail, Result};
use colored::Colorize;

use crate::cli::format_number;
use crate::config::Config;
use crate::store::SnapshotStore;
use crate::usage::StatsReader;

fn open_store(config: &Config) -> Result<SnapshotStore> {
    SnapshotStore::open(config.database_file())
}

/// Capture the stats cache into the database once
pub async fn run_capture(config: &Config) -> Result<()> {
    let reader = StatsReader::new(config.claude_dir_path());
    let Some(snapshot) = reader.snapshot().await else {
        bail!(
            "Stats cache is not available at {}",
            reader.stats_cache_file().display()
        );
    };

    let store = open_store(config)?;
    let sessions = snapshot.total_sessions;
    let tokens = snapshot.total_tokens;
    let id = store.run(move |store| store.save_snapshot(&snapshot)).await?;

    println!(
        "{} snapshot {} ({} sessions, {} tokens)",
        "Saved".green(),
        id.to_string().bright_yellow(),
        sessions,
        format_number(tokens)
    );
    Ok(())
}

/// List stored snapshots, newest first
pub async fn run_history(config: &Config, start: Option<String>, end: Option<String>, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let records = store
        .run(move |store| store.history(start.as_deref(), end.as_deref(), limit))
        .await?;

    if records.is_empty() {
        println!("No snapshots stored.");
        return Ok(());
    }

    println!("Snapshots ({} shown):", records.len());
    println!("{}", "─".repeat(60).dimmed());
    for record in &records {
        println!(
            "  {:>5}  {}  {:>6} sessions  {:>16} tokens",
            format!("#{}", record.id).bright_yellow(),
            record.timestamp.dimmed(),
            record.total_sessions,
            format_number(record.total_tokens)
        );
    }
    Ok(())
}

/// Apply snapshot retention
pub async fn run_cleanup(config: &Config, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(config.snapshots.retention_days);
    let store = open_store(config)?;
    let deleted = store.run(move |store| store.cleanup_older_than(days)).await?;

    println!(
        "Deleted {} snapshot(s) older than {} days",
        deleted.to_string().bright_yellow(),
        days
    );
    Ok(())
}
