use std::path::{Path, PathBuf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::hub::{BroadcastHub, BroadcastReport, Envelope, HubError};
use crate::usage::StatsReader;

/// Turns a settled file change into a `stats_update` broadcast
#[derive(Clone)]
pub struct ChangeDispatcher {
    reader: StatsReader,
    hub: BroadcastHub,
}

impl ChangeDispatcher {
    pub fn new(reader: StatsReader, hub: BroadcastHub) -> Self {
        Self { reader, hub }
    }

    /// Build the update for `path`.
    ///
    /// Only the stats cache carries a parsed document; any other path, or a
    /// cache that cannot be read, yields `stats: null`.
    pub async fn build_update(&self, path: &Path) -> Envelope {
        let stats = if self.reader.is_stats_cache(path) {
            self.reader.read_stats_cache().await
        } else {
            None
        };
        Envelope::stats_update(&path.to_string_lossy(), stats)
    }

    pub async fn dispatch(&self, path: &Path) -> Result<BroadcastReport, HubError> {
        tracing::info!(path = %path.display(), "Dispatching stats update");
        let envelope = self.build_update(path).await;
        self.hub.broadcast(envelope).await
    }

    /// Run the dispatcher on `handle` and return the thread-safe entry point into it.
    ///
    /// Changes are dispatched one at a time in submission order.
    pub fn spawn(self, handle: &Handle) -> ChangeSubmitter {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        handle.spawn(async move {
            while let Some(path) = rx.recv().await {
                match self.dispatch(&path).await {
                    Ok(report) => tracing::debug!(
                        delivered = report.delivered,
                        pruned = report.pruned.len(),
                        "Stats update delivered"
                    ),
                    Err(e) => {
                        tracing::warn!(error = %e, "Stopping change dispatcher");
                        break;
                    }
                }
            }
        });

        ChangeSubmitter { tx: Some(tx) }
    }
}

/// Cross-thread handoff from the watcher worker into the async runtime
#[derive(Clone, Default)]
pub struct ChangeSubmitter {
    tx: Option<mpsc::UnboundedSender<PathBuf>>,
}

impl ChangeSubmitter {
    /// A submitter with no runtime behind it; every change is dropped
    pub fn unattached() -> Self {
        Self { tx: None }
    }

    /// Queue `path` for dispatch. Returns `false` when the change was dropped.
    pub fn submit(&self, path: &Path) -> bool {
        let Some(tx) = &self.tx else {
            tracing::warn!(path = %path.display(), "No async runtime registered, dropping change notification");
            return false;
        };
        if tx.send(path.to_path_buf()).is_err() {
            tracing::warn!(path = %path.display(), "Dispatcher is not running, dropping change notification");
            return false;
        }
        true
    }

    /// Adapt into a watcher callback
    pub fn into_callback(self) -> impl Fn(&Path) -> anyhow::Result<()> + Send + 'static {
        move |path: &Path| {
            self.submit(path);
            Ok(())
        }
    }
}
