use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type ChangeCallback = Box<dyn Fn(&Path) -> anyhow::Result<()> + Send + 'static>;

pub enum WorkerMsg {
    Event(PathBuf),
    Shutdown,
}

/// Per-path quiet-period deadlines.
///
/// A path is either absent (idle) or has exactly one pending deadline. A new
/// event for a pending path replaces its deadline, so a file that keeps
/// changing never fires until it has been quiet for the whole period.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
        }
    }

    pub fn record(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now + self.quiet);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every path whose deadline has passed, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<(PathBuf, Instant)> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, deadline)| (path.clone(), *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);

        for (path, _) in &due {
            self.pending.remove(path);
        }
        due.into_iter().map(|(path, _)| path).collect()
    }

    /// Drop every pending deadline without firing; returns how many were dropped
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Spawn the thread that owns the deadline map and runs the callback.
///
/// The returned receiver yields once the worker has exited.
pub fn spawn_worker(
    events: Receiver<WorkerMsg>,
    quiet: Duration,
    callback: ChangeCallback,
) -> std::io::Result<(JoinHandle<()>, Receiver<()>)> {
    let (done_tx, done_rx) = mpsc::channel();

    let handle = thread::Builder::new()
        .name("tokmon-debounce".to_string())
        .spawn(move || {
            let mut debouncer = Debouncer::new(quiet);
            run_worker(&events, &mut debouncer, &callback);
            let _ = done_tx.send(());
        })?;

    Ok((handle, done_rx))
}

fn run_worker(events: &Receiver<WorkerMsg>, debouncer: &mut Debouncer, callback: &ChangeCallback) {
    loop {
        let msg = match debouncer.next_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    None
                } else {
                    match events.recv_timeout(deadline - now) {
                        Ok(msg) => Some(msg),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => Some(WorkerMsg::Shutdown),
                    }
                }
            }
            None => Some(events.recv().unwrap_or(WorkerMsg::Shutdown)),
        };

        match msg {
            Some(WorkerMsg::Event(path)) => {
                tracing::debug!(path = %path.display(), "File change detected");
                debouncer.record(path, Instant::now());
            }
            Some(WorkerMsg::Shutdown) => {
                let cancelled = debouncer.cancel_all();
                tracing::debug!(cancelled, "Debounce worker shutting down");
                break;
            }
            None => {
                for path in debouncer.take_due(Instant::now()) {
                    invoke(callback, &path);
                }
            }
        }
    }
}

fn invoke(callback: &ChangeCallback, path: &Path) {
    tracing::info!(path = %path.display(), "File change settled");
    match panic::catch_unwind(AssertUnwindSafe(|| callback(path))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(path = %path.display(), error = %format!("{e:#}"), "Change callback failed");
        }
        Err(_) => {
            tracing::error!(path = %path.display(), "Change callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn counting_callback() -> (ChangeCallback, Arc<Mutex<Vec<PathBuf>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ChangeCallback = Box::new(move |path: &Path| {
            sink.lock().unwrap().push(path.to_path_buf());
            Ok(())
        });
        (callback, seen)
    }

    #[test]
    fn test_record_replaces_deadline() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let t0 = Instant::now();
        debouncer.record(PathBuf::from("a.json"), t0);
        debouncer.record(PathBuf::from("a.json"), t0 + Duration::from_millis(400));

        assert_eq!(debouncer.pending(), 1);
        assert_eq!(debouncer.next_deadline(), Some(t0 + Duration::from_millis(900)));
        assert!(debouncer.take_due(t0 + Duration::from_millis(600)).is_empty());
        assert_eq!(
            debouncer.take_due(t0 + Duration::from_millis(900)),
            vec![PathBuf::from("a.json")]
        );
        assert_eq!(debouncer.pending(), 0);
    }

    #[test]
    fn test_paths_are_independent() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        debouncer.record(PathBuf::from("b.json"), t0 + Duration::from_millis(50));
        debouncer.record(PathBuf::from("a.json"), t0);

        let due = debouncer.take_due(t0 + Duration::from_millis(200));
        assert_eq!(due, vec![PathBuf::from("a.json"), PathBuf::from("b.json")]);
    }

    #[test]
    fn test_cancel_all() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        debouncer.record(PathBuf::from("a.json"), t0);
        debouncer.record(PathBuf::from("b.jsonl"), t0);
        assert_eq!(debouncer.cancel_all(), 2);
        assert!(debouncer.next_deadline().is_none());
        assert!(debouncer.take_due(t0 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_rapid_events_fire_once() {
        let (tx, rx) = mpsc::channel();
        let (callback, seen) = counting_callback();
        let (handle, _done) = spawn_worker(rx, Duration::from_millis(100), callback).unwrap();

        for _ in 0..5 {
            tx.send(WorkerMsg::Event(PathBuf::from("stats-cache.json"))).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(400));
        tx.send(WorkerMsg::Shutdown).unwrap();
        handle.join().unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_separated_events_fire_twice() {
        let (tx, rx) = mpsc::channel();
        let (callback, seen) = counting_callback();
        let (handle, _done) = spawn_worker(rx, Duration::from_millis(50), callback).unwrap();

        tx.send(WorkerMsg::Event(PathBuf::from("history.jsonl"))).unwrap();
        thread::sleep(Duration::from_millis(300));
        tx.send(WorkerMsg::Event(PathBuf::from("history.jsonl"))).unwrap();
        thread::sleep(Duration::from_millis(300));
        tx.send(WorkerMsg::Shutdown).unwrap();
        handle.join().unwrap();

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_shutdown_drops_pending_without_firing() {
        let (tx, rx) = mpsc::channel();
        let (callback, seen) = counting_callback();
        let (handle, done) = spawn_worker(rx, Duration::from_secs(10), callback).unwrap();

        tx.send(WorkerMsg::Event(PathBuf::from("a.json"))).unwrap();
        tx.send(WorkerMsg::Shutdown).unwrap();
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_callback_keeps_worker_alive() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback: ChangeCallback = Box::new(move |path: &Path| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => anyhow::bail!("cannot read {}", path.display()),
                1 => panic!("callback blew up"),
                _ => Ok(()),
            }
        });

        let (tx, rx) = mpsc::channel();
        let (handle, _done) = spawn_worker(rx, Duration::from_millis(20), callback).unwrap();

        for _ in 0..3 {
            tx.send(WorkerMsg::Event(PathBuf::from("a.json"))).unwrap();
            thread::sleep(Duration::from_millis(150));
        }
        tx.send(WorkerMsg::Shutdown).unwrap();
        handle.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dropped_sender_stops_worker() {
        let (tx, rx) = mpsc::channel::<WorkerMsg>();
        let (callback, _seen) = counting_callback();
        let (handle, done) = spawn_worker(rx, Duration::from_millis(50), callback).unwrap();
        drop(tx);
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }
}
