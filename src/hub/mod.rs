//! Subscriber registry and fan-out delivery.
//!
//! A single actor task owns every subscriber and its metadata. [`BroadcastHub`]
//! is a cheap handle that sends commands to it, so the active set is only ever
//! mutated from that one task. The actor never awaits a transport: each
//! subscriber has a writer task that owns its [`Transport`] and drains a queue
//! in order. Callers wait for delivery acknowledgments outside the actor, so
//! a stalled peer only delays the caller that is waiting on it.

pub mod envelope;
pub mod transport;

use chrono::{DateTime, Local};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use envelope::{Envelope, MessageType};
pub use transport::{DeliveryError, Transport};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A delivery not acknowledged within this window counts as failed
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq)]
pub enum HubError {
    #[error("broadcast hub has shut down")]
    Closed,
}

/// Subscriber metadata exposed to callers
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: String,
    pub connected_at: DateTime<Local>,
    pub last_heartbeat: DateTime<Local>,
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: Vec<String>,
}

/// One accepted connection.
///
/// Unlike the bare id, a subscription stops matching once a newer connection
/// takes over the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    token: u64,
}

/// Subscriber address; without a token any holder of the id matches
#[derive(Debug, Clone)]
struct Target {
    id: String,
    token: Option<u64>,
}

impl Target {
    fn any(id: &str) -> Self {
        Self {
            id: id.to_string(),
            token: None,
        }
    }
}

impl From<&Subscription> for Target {
    fn from(subscription: &Subscription) -> Self {
        Self {
            id: subscription.id.clone(),
            token: Some(subscription.token),
        }
    }
}

struct Outgoing {
    envelope: Envelope,
    ack: oneshot::Sender<Delivery>,
}

struct Delivery {
    result: Result<(), DeliveryError>,
    connected: bool,
}

/// A queued delivery whose acknowledgment is still outstanding
struct Pending {
    target: Target,
    ack: oneshot::Receiver<Delivery>,
}

enum Outcome {
    Delivered,
    Failed { connected: bool },
    /// The writer stopped first; the subscriber is already gone
    Dropped,
    TimedOut,
}

impl Pending {
    async fn outcome(self) -> (Target, Outcome) {
        let outcome = match tokio::time::timeout(SEND_TIMEOUT, self.ack).await {
            Ok(Ok(Delivery { result: Ok(()), .. })) => Outcome::Delivered,
            Ok(Ok(Delivery {
                result: Err(e),
                connected,
            })) => {
                tracing::error!(client_id = %self.target.id, error = %e, "Failed to send message");
                Outcome::Failed { connected }
            }
            Ok(Err(_)) => Outcome::Dropped,
            Err(_) => {
                tracing::warn!(
                    client_id = %self.target.id,
                    timeout_secs = SEND_TIMEOUT.as_secs(),
                    "Delivery timed out"
                );
                Outcome::TimedOut
            }
        };
        (self.target, outcome)
    }
}

/// A removed subscriber whose writer is still shutting down
struct Closing {
    id: String,
    writer: JoinHandle<()>,
}

impl Closing {
    async fn wait(self) {
        if let Err(e) = self.writer.await {
            if e.is_panic() {
                tracing::error!(client_id = %self.id, "Subscriber writer panicked");
            }
        }
    }
}

struct Accepted {
    subscription: Subscription,
    replaced: Option<Closing>,
    connected: Option<Pending>,
}

enum Command {
    Subscribe {
        transport: Box<dyn Transport>,
        id: Option<String>,
        reply: oneshot::Sender<Accepted>,
    },
    Send {
        target: Target,
        envelope: Envelope,
        reply: oneshot::Sender<Option<Pending>>,
    },
    Broadcast {
        envelope: Envelope,
        reply: oneshot::Sender<Vec<Pending>>,
    },
    Heartbeat {
        target: Target,
        reply: oneshot::Sender<Option<Pending>>,
    },
    Tick {
        target: Target,
        reply: oneshot::Sender<Option<Pending>>,
    },
    Remove {
        target: Target,
        reply: oneshot::Sender<Option<Closing>>,
    },
    Prune {
        targets: Vec<Target>,
        reply: oneshot::Sender<Vec<Closing>>,
    },
    List {
        reply: oneshot::Sender<Vec<SubscriberInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<(Vec<JoinHandle<()>>, Vec<Closing>)>,
    },
}

/// Handle to the hub actor. Cloning shares the same subscriber set.
#[derive(Clone)]
pub struct BroadcastHub {
    commands: mpsc::UnboundedSender<Command>,
}

impl BroadcastHub {
    /// Spawn the hub actor on the current tokio runtime
    pub fn new(heartbeat_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = HubActor {
            subscribers: HashMap::new(),
            heartbeat_interval,
            next_token: 0,
            commands: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Self { commands: tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Register a subscriber and deliver the `connected` acknowledgment.
    ///
    /// Returns the assigned id, generated when `id` is `None`.
    pub async fn accept(&self, transport: impl Transport, id: Option<String>) -> Result<String, HubError> {
        Ok(self.subscribe(transport, id).await?.id)
    }

    /// Like [`accept`](Self::accept), returning a handle bound to this connection
    pub async fn subscribe(&self, transport: impl Transport, id: Option<String>) -> Result<Subscription, HubError> {
        let transport: Box<dyn Transport> = Box::new(transport);
        let accepted = self
            .request(|reply| Command::Subscribe { transport, id, reply })
            .await?;

        if let Some(old) = accepted.replaced {
            old.wait().await;
        }
        if let Some(pending) = accepted.connected {
            self.settle(pending).await?;
        }
        Ok(accepted.subscription)
    }

    /// Deliver to one subscriber; `false` when it is unknown or delivery failed
    pub async fn send(&self, id: &str, envelope: Envelope) -> Result<bool, HubError> {
        self.send_target(Target::any(id), envelope).await
    }

    /// Deliver only while `subscription` still owns its id
    pub async fn send_to(&self, subscription: &Subscription, envelope: Envelope) -> Result<bool, HubError> {
        self.send_target(subscription.into(), envelope).await
    }

    async fn send_target(&self, target: Target, envelope: Envelope) -> Result<bool, HubError> {
        match self.request(|reply| Command::Send { target, envelope, reply }).await? {
            Some(pending) => self.settle(pending).await,
            None => Ok(false),
        }
    }

    /// Deliver to every subscriber concurrently and prune those that failed
    pub async fn broadcast(&self, envelope: Envelope) -> Result<BroadcastReport, HubError> {
        let pending = self.request(|reply| Command::Broadcast { envelope, reply }).await?;
        if pending.is_empty() {
            return Ok(BroadcastReport::default());
        }

        let outcomes = join_all(pending.into_iter().map(Pending::outcome)).await;

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (target, outcome) in outcomes {
            match outcome {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Failed { .. } | Outcome::TimedOut => {
                    report.pruned.push(target.id.clone());
                    failed.push(target);
                }
                Outcome::Dropped => {}
            }
        }

        if !failed.is_empty() {
            tracing::warn!(count = failed.len(), "Pruning failed subscribers after broadcast");
            self.prune(failed).await?;
        }
        Ok(report)
    }

    /// Record a client heartbeat and answer with status ok
    pub async fn heartbeat(&self, id: &str) -> Result<bool, HubError> {
        self.heartbeat_target(Target::any(id)).await
    }

    pub async fn heartbeat_from(&self, subscription: &Subscription) -> Result<bool, HubError> {
        self.heartbeat_target(subscription.into()).await
    }

    async fn heartbeat_target(&self, target: Target) -> Result<bool, HubError> {
        match self.request(|reply| Command::Heartbeat { target, reply }).await? {
            Some(pending) => self.settle(pending).await,
            None => Ok(false),
        }
    }

    /// Idempotent; `true` when the subscriber was registered
    pub async fn remove(&self, id: &str) -> Result<bool, HubError> {
        self.remove_target(Target::any(id)).await
    }

    /// Remove `subscription` unless a newer connection already took its id
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<bool, HubError> {
        self.remove_target(subscription.into()).await
    }

    async fn remove_target(&self, target: Target) -> Result<bool, HubError> {
        match self.request(|reply| Command::Remove { target, reply }).await? {
            Some(closing) => {
                closing.wait().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn connections(&self) -> Result<Vec<SubscriberInfo>, HubError> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Stop every heartbeat timer, then close and drop all subscribers
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (timers, closings) = self.request(|reply| Command::Shutdown { reply }).await?;
        // no timer may fire against a closed transport
        join_all(timers).await;
        join_all(closings.into_iter().map(Closing::wait)).await;
        Ok(())
    }

    /// Wait for one delivery; prune the subscriber when it is disconnected or stalled
    async fn settle(&self, pending: Pending) -> Result<bool, HubError> {
        let (target, outcome) = pending.outcome().await;
        match outcome {
            Outcome::Delivered => Ok(true),
            Outcome::Failed { connected: false } | Outcome::TimedOut => {
                self.prune(vec![target]).await?;
                Ok(false)
            }
            Outcome::Failed { connected: true } | Outcome::Dropped => Ok(false),
        }
    }

    async fn prune(&self, targets: Vec<Target>) -> Result<(), HubError> {
        let closings = self.request(|reply| Command::Prune { targets, reply }).await?;
        join_all(closings.into_iter().map(Closing::wait)).await;
        Ok(())
    }
}

struct Subscriber {
    info: SubscriberInfo,
    token: u64,
    outbox: mpsc::UnboundedSender<Outgoing>,
    stop: oneshot::Sender<()>,
    writer: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

struct HubActor {
    subscribers: HashMap<String, Subscriber>,
    heartbeat_interval: Duration,
    next_token: u64,
    // weak so that dropping every hub handle stops the actor
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl HubActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Subscribe { transport, id, reply } => {
                    let _ = reply.send(self.subscribe(transport, id));
                }
                Command::Send { target, envelope, reply } => {
                    let _ = reply.send(self.enqueue(&target, envelope));
                }
                Command::Broadcast { envelope, reply } => {
                    let _ = reply.send(self.broadcast(envelope));
                }
                Command::Heartbeat { target, reply } => {
                    let pending = match self.lookup_mut(&target) {
                        Some(sub) => {
                            sub.info.last_heartbeat = Local::now();
                            tracing::debug!(client_id = %target.id, "Received heartbeat");
                            self.enqueue(&target, Envelope::heartbeat())
                        }
                        None => None,
                    };
                    let _ = reply.send(pending);
                }
                Command::Tick { target, reply } => {
                    let _ = reply.send(self.enqueue(&target, Envelope::heartbeat()));
                }
                Command::Remove { target, reply } => {
                    let _ = reply.send(self.detach(&target));
                }
                Command::Prune { targets, reply } => {
                    let closings = targets.iter().filter_map(|t| self.detach(t)).collect();
                    let _ = reply.send(closings);
                }
                Command::List { reply } => {
                    let _ = reply.send(self.subscribers.values().map(|s| s.info.clone()).collect());
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(self.shutdown());
                    break;
                }
            }
        }
        tracing::debug!("Broadcast hub stopped");
    }

    fn lookup(&self, target: &Target) -> Option<&Subscriber> {
        self.subscribers
            .get(&target.id)
            .filter(|sub| target.token.map_or(true, |token| token == sub.token))
    }

    fn lookup_mut(&mut self, target: &Target) -> Option<&mut Subscriber> {
        self.subscribers
            .get_mut(&target.id)
            .filter(|sub| target.token.map_or(true, |token| token == sub.token))
    }

    fn subscribe(&mut self, transport: Box<dyn Transport>, id: Option<String>) -> Accepted {
        let id = id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("client_{}", uuid::Uuid::new_v4().simple()));

        // A reconnecting client may reuse its id; the stale socket is closed
        let replaced = self.detach(&Target::any(&id));
        if replaced.is_some() {
            tracing::info!(client_id = %id, "Replaced existing subscriber with the same id");
        }

        self.next_token += 1;
        let subscription = Subscription {
            id: id.clone(),
            token: self.next_token,
        };

        let (outbox, stop, writer) = spawn_writer(id.clone(), transport);
        let heartbeat = self.spawn_heartbeat(Target::from(&subscription));
        let now = Local::now();
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                info: SubscriberInfo {
                    id: id.clone(),
                    connected_at: now,
                    last_heartbeat: now,
                },
                token: subscription.token,
                outbox,
                stop,
                writer,
                heartbeat,
            },
        );

        tracing::info!(client_id = %id, total = self.subscribers.len(), "Subscriber connected");

        let connected = self.enqueue(&Target::from(&subscription), Envelope::connected(&id));
        Accepted {
            subscription,
            replaced,
            connected,
        }
    }

    fn enqueue(&self, target: &Target, envelope: Envelope) -> Option<Pending> {
        let Some(sub) = self.lookup(target) else {
            tracing::debug!(client_id = %target.id, "Send to unknown subscriber");
            return None;
        };
        Self::enqueue_to(sub, envelope.stamped())
    }

    fn enqueue_to(sub: &Subscriber, envelope: Envelope) -> Option<Pending> {
        let (ack, rx) = oneshot::channel();
        sub.outbox.send(Outgoing { envelope, ack }).ok()?;
        Some(Pending {
            target: Target {
                id: sub.info.id.clone(),
                token: Some(sub.token),
            },
            ack: rx,
        })
    }

    fn broadcast(&self, envelope: Envelope) -> Vec<Pending> {
        if self.subscribers.is_empty() {
            tracing::debug!("No subscribers, skipping broadcast");
            return Vec::new();
        }

        let envelope = envelope.stamped();
        tracing::info!(kind = ?envelope.kind, subscribers = self.subscribers.len(), "Broadcasting");
        self.subscribers
            .values()
            .filter_map(|sub| Self::enqueue_to(sub, envelope.clone()))
            .collect()
    }

    /// Drop a subscriber from the active set and signal its writer to close
    fn detach(&mut self, target: &Target) -> Option<Closing> {
        self.lookup(target)?;
        let sub = self.subscribers.remove(&target.id)?;
        sub.heartbeat.abort();
        let _ = sub.stop.send(());
        tracing::info!(client_id = %target.id, remaining = self.subscribers.len(), "Subscriber disconnected");
        Some(Closing {
            id: target.id.clone(),
            writer: sub.writer,
        })
    }

    fn shutdown(&mut self) -> (Vec<JoinHandle<()>>, Vec<Closing>) {
        tracing::info!(subscribers = self.subscribers.len(), "Shutting down broadcast hub");

        let mut timers = Vec::new();
        let mut closings = Vec::new();
        for (id, sub) in self.subscribers.drain() {
            sub.heartbeat.abort();
            timers.push(sub.heartbeat);
            let _ = sub.stop.send(());
            closings.push(Closing { id, writer: sub.writer });
        }
        (timers, closings)
    }

    fn spawn_heartbeat(&self, target: Target) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(tx) = commands.upgrade() else { break };
                let hub = BroadcastHub { commands: tx };
                let tick = target.clone();
                // None once the subscriber has left the active set
                let Ok(Some(pending)) = hub.request(|reply| Command::Tick { target: tick, reply }).await else {
                    break;
                };
                if hub.settle(pending).await.is_err() {
                    break;
                }
            }
            tracing::debug!(client_id = %target.id, "Heartbeat timer stopped");
        })
    }
}

/// Own `transport` on a dedicated task and deliver queued envelopes in order.
///
/// Firing the returned stop signal abandons any in-flight send, then closes
/// the transport.
fn spawn_writer(
    id: String,
    mut transport: Box<dyn Transport>,
) -> (mpsc::UnboundedSender<Outgoing>, oneshot::Sender<()>, JoinHandle<()>) {
    let (outbox, mut queue) = mpsc::unbounded_channel::<Outgoing>();
    let (stop, mut stopped) = oneshot::channel::<()>();

    let writer = tokio::spawn(async move {
        loop {
            let outgoing = tokio::select! {
                biased;
                _ = &mut stopped => break,
                next = queue.recv() => match next {
                    Some(outgoing) => outgoing,
                    None => break,
                },
            };

            let result = tokio::select! {
                biased;
                _ = &mut stopped => break,
                result = transport.send(&outgoing.envelope) => result,
            };
            if result.is_ok() {
                tracing::debug!(client_id = %id, kind = ?outgoing.envelope.kind, "Message sent");
            }
            let connected = transport.is_connected();
            let _ = outgoing.ack.send(Delivery { result, connected });
        }

        if tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await.is_err() {
            tracing::warn!(client_id = %id, "Timed out closing subscriber transport");
        }
    });

    (outbox, stop, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Envelope>>>,
        closed: Arc<AtomicBool>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<MessageType> {
            self.sent.lock().unwrap().iter().map(|e| e.kind).collect()
        }

        fn count(&self, kind: MessageType) -> usize {
            self.kinds().into_iter().filter(|k| *k == kind).count()
        }
    }

    struct MockTransport {
        recorder: Recorder,
        fail: bool,
    }

    impl MockTransport {
        fn healthy() -> (Self, Recorder) {
            let recorder = Recorder::default();
            (Self { recorder: recorder.clone(), fail: false }, recorder)
        }

        fn broken() -> (Self, Recorder) {
            let recorder = Recorder::default();
            (Self { recorder: recorder.clone(), fail: true }, recorder)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, envelope: &Envelope) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Disconnected);
            }
            self.recorder.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.fail
        }

        async fn close(&mut self) {
            self.recorder.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_accept_sends_connected_with_assigned_id() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (transport, recorder) = MockTransport::healthy();

        let id = hub.accept(transport, None).await.unwrap();
        assert!(id.starts_with("client_"));

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::Connected);
        assert_eq!(sent[0].data["client_id"], id.as_str());
        assert!(sent[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn test_accept_keeps_given_id() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (transport, _recorder) = MockTransport::healthy();
        let id = hub.accept(transport, Some("dashboard".to_string())).await.unwrap();
        assert_eq!(id, "dashboard");

        let connections = hub.connections().await.unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].id, "dashboard");
    }

    #[tokio::test]
    async fn test_accept_replaces_duplicate_id() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (first, first_recorder) = MockTransport::healthy();
        let (second, _second_recorder) = MockTransport::healthy();
        hub.accept(first, Some("tab".to_string())).await.unwrap();
        hub.accept(second, Some("tab".to_string())).await.unwrap();

        assert!(first_recorder.closed.load(Ordering::SeqCst));
        assert_eq!(hub.connections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_healthy_subscribers_keeps_all() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let mut recorders = Vec::new();
        for _ in 0..3 {
            let (transport, recorder) = MockTransport::healthy();
            hub.accept(transport, None).await.unwrap();
            recorders.push(recorder);
        }

        let report = hub.broadcast(Envelope::stats_update("x", None)).await.unwrap();
        assert_eq!(report.delivered, 3);
        assert!(report.pruned.is_empty());
        assert_eq!(hub.connections().await.unwrap().len(), 3);
        assert!(recorders.iter().all(|p| p.count(MessageType::StatsUpdate) == 1));
    }

    #[tokio::test]
    async fn test_broadcast_prunes_failed_subscriber() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        for _ in 0..2 {
            let (transport, _recorder) = MockTransport::healthy();
            hub.accept(transport, None).await.unwrap();
        }
        let (broken, broken_recorder) = MockTransport::broken();
        // the connected ack fails too, which already prunes a disconnected transport
        let broken_id = hub.accept(broken, None).await.unwrap();
        assert!(broken_recorder.closed.load(Ordering::SeqCst));
        assert_eq!(hub.connections().await.unwrap().len(), 2);

        let report = hub.broadcast(Envelope::stats_update("x", None)).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert!(!report.pruned.contains(&broken_id));
    }

    #[tokio::test]
    async fn test_broadcast_removes_every_failure() {
        struct FlakyTransport {
            sends: usize,
        }

        #[async_trait]
        impl Transport for FlakyTransport {
            async fn send(&mut self, _envelope: &Envelope) -> Result<(), DeliveryError> {
                self.sends += 1;
                // the connected ack succeeds, later sends fail
                if self.sends > 1 {
                    return Err(DeliveryError::Transport("broken pipe".to_string()));
                }
                Ok(())
            }

            fn is_connected(&self) -> bool {
                true
            }

            async fn close(&mut self) {}
        }

        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (healthy, _recorder) = MockTransport::healthy();
        hub.accept(healthy, None).await.unwrap();
        let flaky_id = hub.accept(FlakyTransport { sends: 0 }, None).await.unwrap();
        assert_eq!(hub.connections().await.unwrap().len(), 2);

        let report = hub.broadcast(Envelope::stats_update("x", None)).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, vec![flaky_id]);
        assert_eq!(hub.connections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let report = hub.broadcast(Envelope::heartbeat()).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_send_to_one_subscriber() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (a, recorder_a) = MockTransport::healthy();
        let (b, recorder_b) = MockTransport::healthy();
        let id_a = hub.accept(a, None).await.unwrap();
        hub.accept(b, None).await.unwrap();

        assert!(hub.send(&id_a, Envelope::error("bad request")).await.unwrap());
        assert!(!hub.send("missing", Envelope::heartbeat()).await.unwrap());
        assert_eq!(recorder_a.count(MessageType::Error), 1);
        assert_eq!(recorder_b.count(MessageType::Error), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_metadata_and_replies() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (transport, recorder) = MockTransport::healthy();
        let id = hub.accept(transport, None).await.unwrap();
        let before = hub.connections().await.unwrap()[0].last_heartbeat;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(hub.heartbeat(&id).await.unwrap());

        let after = hub.connections().await.unwrap()[0].last_heartbeat;
        assert!(after > before);
        assert_eq!(recorder.count(MessageType::Heartbeat), 1);
        let last = recorder.sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.data["status"], "ok");

        assert!(!hub.heartbeat("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (transport, recorder) = MockTransport::healthy();
        let id = hub.accept(transport, None).await.unwrap();

        assert!(hub.remove(&id).await.unwrap());
        assert!(!hub.remove(&id).await.unwrap());
        assert!(recorder.closed.load(Ordering::SeqCst));
        assert!(hub.connections().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_heartbeat_until_removed() {
        let hub = BroadcastHub::new(Duration::from_secs(30));
        let (transport, recorder) = MockTransport::healthy();
        let id = hub.accept(transport, None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(recorder.count(MessageType::Heartbeat), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.count(MessageType::Heartbeat), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.count(MessageType::Heartbeat), 2);

        hub.remove(&id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(recorder.count(MessageType::Heartbeat), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let hub = BroadcastHub::new(Duration::from_secs(30));
        let (a, recorder_a) = MockTransport::healthy();
        let (b, recorder_b) = MockTransport::healthy();
        hub.accept(a, None).await.unwrap();
        hub.accept(b, None).await.unwrap();

        hub.shutdown().await.unwrap();
        assert!(recorder_a.closed.load(Ordering::SeqCst));
        assert!(recorder_b.closed.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(recorder_a.count(MessageType::Heartbeat), 0);
        assert!(matches!(hub.connections().await, Err(HubError::Closed)));
    }

    /// Acknowledges the `connected` message, then never completes another send
    struct StalledTransport {
        sends: usize,
        closed: Arc<AtomicBool>,
    }

    impl StalledTransport {
        fn new() -> (Self, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            (Self { sends: 0, closed: closed.clone() }, closed)
        }
    }

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send(&mut self, _envelope: &Envelope) -> Result<(), DeliveryError> {
            self.sends += 1;
            if self.sends > 1 {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_does_not_block_other_operations() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (slow, slow_closed) = StalledTransport::new();
        hub.accept(slow, Some("slow".to_string())).await.unwrap();
        let (healthy, healthy_recorder) = MockTransport::healthy();
        hub.accept(healthy, None).await.unwrap();

        let in_flight = tokio::spawn({
            let hub = hub.clone();
            async move { hub.broadcast(Envelope::stats_update("x", None)).await }
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while healthy_recorder.count(MessageType::StatsUpdate) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("broadcast never reached the healthy subscriber");

        let quick = Duration::from_secs(1);
        let (other, _other_recorder) = MockTransport::healthy();
        tokio::time::timeout(quick, hub.accept(other, None))
            .await
            .expect("accept blocked by a stalled subscriber")
            .unwrap();
        let connections = tokio::time::timeout(quick, hub.connections())
            .await
            .expect("connections blocked by a stalled subscriber")
            .unwrap();
        assert_eq!(connections.len(), 3);

        let removed = tokio::time::timeout(quick, hub.remove("slow"))
            .await
            .expect("remove blocked by a stalled subscriber")
            .unwrap();
        assert!(removed);
        assert!(slow_closed.load(Ordering::SeqCst));

        let report = in_flight.await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);
        assert!(report.pruned.is_empty());
        assert_eq!(healthy_recorder.count(MessageType::StatsUpdate), 1);
        assert_eq!(hub.connections().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_prunes_subscriber_that_never_acknowledges() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (slow, slow_closed) = StalledTransport::new();
        hub.accept(slow, Some("slow".to_string())).await.unwrap();
        let (healthy, healthy_recorder) = MockTransport::healthy();
        hub.accept(healthy, None).await.unwrap();

        let started = tokio::time::Instant::now();
        let report = hub.broadcast(Envelope::stats_update("x", None)).await.unwrap();
        assert!(started.elapsed() >= SEND_TIMEOUT);

        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, vec!["slow".to_string()]);
        assert!(slow_closed.load(Ordering::SeqCst));
        assert_eq!(healthy_recorder.count(MessageType::StatsUpdate), 1);
        assert_eq!(hub.connections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replaced_subscription_no_longer_matches() {
        let hub = BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL);
        let (first, first_recorder) = MockTransport::healthy();
        let (second, second_recorder) = MockTransport::healthy();
        let old = hub.subscribe(first, Some("tab".to_string())).await.unwrap();
        let new = hub.subscribe(second, Some("tab".to_string())).await.unwrap();
        assert_eq!(old.id, new.id);
        assert_ne!(old, new);

        // replies to the stale connection never reach the new socket
        assert!(!hub.send_to(&old, Envelope::pong(serde_json::json!({"seq": 1}))).await.unwrap());
        assert!(!hub.heartbeat_from(&old).await.unwrap());
        assert_eq!(second_recorder.count(MessageType::Pong), 0);
        assert_eq!(second_recorder.count(MessageType::Heartbeat), 0);
        assert_eq!(first_recorder.count(MessageType::Pong), 0);

        // and its cleanup leaves the new subscriber registered
        assert!(!hub.unsubscribe(&old).await.unwrap());
        assert_eq!(hub.connections().await.unwrap().len(), 1);

        assert!(hub.send_to(&new, Envelope::pong(serde_json::json!({"seq": 2}))).await.unwrap());
        assert_eq!(second_recorder.count(MessageType::Pong), 1);
        assert!(hub.unsubscribe(&new).await.unwrap());
        assert!(second_recorder.closed.load(Ordering::SeqCst));
    }
}
