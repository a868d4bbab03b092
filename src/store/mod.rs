//! Append-only snapshot history in SQLite.
//!
//! Each snapshot is one `stats_snapshots` row plus child rows in `model_usage`
//! and `daily_activities`; deleting a snapshot cascades to its children.

pub mod scheduler;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::usage::{parse_date, DailyActivity, ModelUsage, StatsSnapshot, TokenUsage};

pub use scheduler::SnapshotScheduler;

/// Stored form of a snapshot timestamp; sorts lexically and works with `DATE()`
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS stats_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL UNIQUE,
        total_sessions INTEGER NOT NULL DEFAULT 0,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS model_usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        snapshot_id INTEGER NOT NULL,
        model_name TEXT NOT NULL,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        cache_read_tokens INTEGER NOT NULL DEFAULT 0,
        cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (snapshot_id) REFERENCES stats_snapshots(id) ON DELETE CASCADE,
        UNIQUE(snapshot_id, model_name)
    );

    CREATE TABLE IF NOT EXISTS daily_activities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        snapshot_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        session_count INTEGER NOT NULL DEFAULT 0,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (snapshot_id) REFERENCES stats_snapshots(id) ON DELETE CASCADE,
        UNIQUE(snapshot_id, date)
    );

    CREATE INDEX IF NOT EXISTS idx_stats_snapshots_timestamp ON stats_snapshots(timestamp);
    CREATE INDEX IF NOT EXISTS idx_model_usage_snapshot ON model_usage(snapshot_id);
    CREATE INDEX IF NOT EXISTS idx_model_usage_name ON model_usage(model_name);
    CREATE INDEX IF NOT EXISTS idx_daily_activities_date ON daily_activities(date);
";

/// Snapshot header row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub timestamp: String,
    pub total_sessions: u64,
    pub total_tokens: u64,
    pub created_at: String,
}

/// SQLite-backed snapshot store.
///
/// Holds only the database path; every operation opens its own connection so
/// the store can be cloned into blocking tasks freely.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Open the database at `path`, creating parent directories and the schema
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
        }

        let store = Self { path };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("Failed to open database: {}", self.path.display()))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }

    /// Create tables and indexes if missing
    pub fn init(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize database schema")?;
        tracing::info!(path = %self.path.display(), "Snapshot database ready");
        Ok(())
    }

    /// Persist a snapshot and its child rows in one transaction; returns the snapshot id
    pub fn save_snapshot(&self, snapshot: &StatsSnapshot) -> Result<i64> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO stats_snapshots (timestamp, total_sessions, total_tokens) VALUES (?1, ?2, ?3)",
            params![
                format_timestamp(&snapshot.timestamp),
                snapshot.total_sessions as i64,
                snapshot.total_tokens as i64,
            ],
        )
        .context("Failed to insert snapshot")?;
        let snapshot_id = tx.last_insert_rowid();

        {
            let mut insert_model = tx.prepare(
                "INSERT INTO model_usage
                 (snapshot_id, model_name, input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for model in &snapshot.models {
                insert_model.execute(params![
                    snapshot_id,
                    model.model,
                    model.usage.input_tokens as i64,
                    model.usage.output_tokens as i64,
                    model.usage.cache_read_tokens as i64,
                    model.usage.cache_creation_tokens as i64,
                ])?;
            }

            let mut insert_day = tx.prepare(
                "INSERT INTO daily_activities (snapshot_id, date, session_count, total_tokens)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for activity in &snapshot.daily_activities {
                insert_day.execute(params![
                    snapshot_id,
                    activity.date,
                    activity.session_count as i64,
                    activity.total_tokens as i64,
                ])?;
            }
        }

        tx.commit().context("Failed to commit snapshot")?;

        tracing::info!(
            snapshot_id,
            models = snapshot.models.len(),
            days = snapshot.daily_activities.len(),
            "Saved stats snapshot"
        );
        Ok(snapshot_id)
    }

    /// Snapshot headers, newest first, optionally limited to a `YYYY-MM-DD` range
    pub fn history(&self, start: Option<&str>, end: Option<&str>, limit: usize) -> Result<Vec<SnapshotRecord>> {
        if let Some(start) = start {
            parse_date(start)?;
        }
        if let Some(end) = end {
            parse_date(end)?;
        }

        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, total_sessions, total_tokens, created_at
             FROM stats_snapshots
             WHERE (?1 IS NULL OR DATE(timestamp) >= ?1)
               AND (?2 IS NULL OR DATE(timestamp) <= ?2)
             ORDER BY timestamp DESC
             LIMIT ?3",
        )?;

        let records = stmt
            .query_map(params![start, end, limit as i64], |row| {
                Ok(SnapshotRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    total_sessions: row.get::<_, i64>(2)? as u64,
                    total_tokens: row.get::<_, i64>(3)? as u64,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        tracing::debug!(count = records.len(), "Queried snapshot history");
        Ok(records)
    }

    pub fn snapshot(&self, snapshot_id: i64) -> Result<Option<SnapshotRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                "SELECT id, timestamp, total_sessions, total_tokens, created_at
                 FROM stats_snapshots WHERE id = ?1",
                params![snapshot_id],
                |row| {
                    Ok(SnapshotRecord {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        total_sessions: row.get::<_, i64>(2)? as u64,
                        total_tokens: row.get::<_, i64>(3)? as u64,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Model rows of one snapshot, largest `input + output` first
    pub fn model_usage_for(&self, snapshot_id: i64) -> Result<Vec<ModelUsage>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT model_name, input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens
             FROM model_usage
             WHERE snapshot_id = ?1
             ORDER BY (input_tokens + output_tokens) DESC, id ASC",
        )?;

        let rows = stmt
            .query_map(params![snapshot_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    TokenUsage::new(
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                        row.get::<_, i64>(4)? as u64,
                    ),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(model, usage)| ModelUsage::new(model, usage).map_err(Into::into))
            .collect()
    }

    /// Daily rows of one snapshot, newest date first; model split is not stored
    pub fn daily_activities_for(&self, snapshot_id: i64) -> Result<Vec<DailyActivity>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT date, session_count, total_tokens
             FROM daily_activities
             WHERE snapshot_id = ?1
             ORDER BY date DESC",
        )?;

        let rows = stmt
            .query_map(params![snapshot_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(date, sessions, tokens)| DailyActivity::new(date, sessions, tokens, Vec::new()).map_err(Into::into))
            .collect()
    }

    /// Delete snapshots older than `days` days; returns the number of snapshots removed
    pub fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        self.cleanup_before(Local::now() - Duration::days(i64::from(days)))
    }

    pub fn cleanup_before(&self, cutoff: DateTime<Local>) -> Result<usize> {
        let conn = self.connect()?;
        let deleted = conn
            .execute(
                "DELETE FROM stats_snapshots WHERE timestamp < ?1",
                params![format_timestamp(&cutoff)],
            )
            .context("Failed to delete old snapshots")?;

        tracing::info!(deleted, cutoff = %cutoff, "Cleaned up old snapshots");
        Ok(deleted)
    }

    /// Run a store operation on the blocking thread pool
    pub async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&SnapshotStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .context("Snapshot store task failed")?
    }
}

fn format_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.naive_local().format(TIMESTAMP_FORMAT).to_string()
}
