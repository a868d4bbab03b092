use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use super::debounce::{spawn_worker, WorkerMsg};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("file watcher is already running")]
    AlreadyRunning,
    #[error("watch root does not exist: {}", .0.display())]
    RootNotFound(PathBuf),
    #[error("failed to watch directory: {0}")]
    Notify(#[from] notify::Error),
    #[error("failed to start debounce worker: {0}")]
    Worker(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce: Duration,
    /// Allowed file extensions, without the leading dot
    pub extensions: Vec<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            extensions: vec!["json".to_string(), "jsonl".to_string()],
        }
    }
}

struct Running {
    watcher: RecommendedWatcher,
    events: Sender<WorkerMsg>,
    worker: JoinHandle<()>,
    done: Receiver<()>,
}

/// Recursive directory watch with per-file debouncing.
///
/// The OS notification thread only forwards filtered paths to a single
/// worker thread, which owns the debounce state and runs the callback.
pub struct DebouncedWatcher {
    root: PathBuf,
    options: WatchOptions,
    running: Option<Running>,
}

impl DebouncedWatcher {
    pub fn new(root: impl Into<PathBuf>, options: WatchOptions) -> Self {
        Self {
            root: root.into(),
            options,
            running: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start watching `root` recursively.
    ///
    /// `callback` runs on the worker thread once a file has been quiet for the
    /// debounce period. Errors and panics it raises are logged and swallowed.
    pub fn start<F>(&mut self, callback: F) -> Result<(), WatchError>
    where
        F: Fn(&Path) -> anyhow::Result<()> + Send + 'static,
    {
        if self.running.is_some() {
            return Err(WatchError::AlreadyRunning);
        }
        if !self.root.is_dir() {
            return Err(WatchError::RootNotFound(self.root.clone()));
        }

        let (events, rx) = mpsc::channel();
        let (worker, done) = spawn_worker(rx, self.options.debounce, Box::new(callback))?;

        let extensions = normalize_extensions(&self.options.extensions);
        let forward = events.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in relevant_paths(&event, &extensions) {
                    let _ = forward.send(WorkerMsg::Event(path));
                }
            }
            Err(e) => tracing::error!(error = %e, "File watch error"),
        })
        .and_then(|mut watcher| {
            watcher.watch(&self.root, RecursiveMode::Recursive)?;
            Ok(watcher)
        });

        let watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                let _ = events.send(WorkerMsg::Shutdown);
                let _ = worker.join();
                return Err(e.into());
            }
        };

        self.running = Some(Running {
            watcher,
            events,
            worker,
            done,
        });

        tracing::info!(
            root = %self.root.display(),
            debounce_ms = self.options.debounce.as_millis() as u64,
            "File watcher started"
        );
        Ok(())
    }

    /// Cancel the OS watch and pending deadlines, then wait up to 5s for the worker
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            tracing::debug!("File watcher is not running");
            return;
        };

        let Running {
            watcher,
            events,
            worker,
            done,
        } = running;

        drop(watcher);
        let _ = events.send(WorkerMsg::Shutdown);

        match done.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join().is_err() {
                    tracing::error!("Debounce worker panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_secs = STOP_TIMEOUT.as_secs(),
                    "Debounce worker did not exit in time, detaching"
                );
            }
        }

        tracing::info!(root = %self.root.display(), "File watcher stopped");
    }
}

impl Drop for DebouncedWatcher {
    fn drop(&mut self) {
        if self.running.is_some() {
            self.stop();
        }
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// File paths of `event` that should feed the debouncer
pub fn relevant_paths(event: &Event, extensions: &[String]) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(CreateKind::Folder)
        | EventKind::Access(_)
        | EventKind::Remove(_)
        | EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        _ => {}
    }

    event
        .paths
        .iter()
        .filter(|path| !path.is_dir())
        .filter(|path| has_allowed_extension(path, extensions))
        .cloned()
        .collect()
}
