use anyhow::Result;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::SnapshotStore;
use crate::usage::StatsReader;

const CLEANUP_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

/// Periodically captures the stats cache into the snapshot store
#[derive(Debug, Clone)]
pub struct SnapshotScheduler {
    reader: StatsReader,
    store: SnapshotStore,
    interval: Duration,
    retention_days: u32,
}

impl SnapshotScheduler {
    pub fn new(reader: StatsReader, store: SnapshotStore, interval: Duration, retention_days: u32) -> Self {
        Self {
            reader,
            store,
            interval,
            retention_days,
        }
    }

    /// Read the cache once and store it; `None` when there was nothing to read
    pub async fn capture_once(&self) -> Result<Option<i64>> {
        let Some(snapshot) = self.reader.snapshot().await else {
            tracing::debug!("No stats cache available, skipping snapshot");
            return Ok(None);
        };
        let id = self.store.run(move |store| store.save_snapshot(&snapshot)).await?;
        Ok(Some(id))
    }

    pub async fn cleanup(&self) -> Result<usize> {
        let days = self.retention_days;
        self.store.run(move |store| store.cleanup_older_than(days)).await
    }

    /// Run until aborted: clean up at startup and once a day, capture every interval
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.interval.as_secs(),
                retention_days = self.retention_days,
                "Snapshot scheduler started"
            );

            if let Err(e) = self.cleanup().await {
                tracing::error!(error = %format!("{e:#}"), "Snapshot cleanup failed");
            }
            let mut last_cleanup = Instant::now();

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if let Err(e) = self.capture_once().await {
                    tracing::error!(error = %format!("{e:#}"), "Failed to capture snapshot");
                }

                if last_cleanup.elapsed() >= CLEANUP_EVERY {
                    if let Err(e) = self.cleanup().await {
                        tracing::error!(error = %format!("{e:#}"), "Snapshot cleanup failed");
                    }
                    last_cleanup = Instant::now();
                }
            }
        })
    }
}
