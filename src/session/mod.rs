//! # Session Manager
//!
//! Composes the [`ConnectionSupervisor`](crate::supervisor), the [`NodeRegistry`] and the
//! [`AckTracker`] behind one actor task.
//!
//! ```text
//!  SessionHandle ──requests──▶ ┌──────────────┐ ──frames──▶ Supervisor ──▶ Transport
//!                              │ session loop │
//!  SessionEvents ◀──events──── └──────────────┘ ◀──LinkEvent── Supervisor ◀── radio
//!                                  ▲     │
//!                             1s tick  registry / tracker (owned, no locks)
//! ```
//!
//! The loop is the only place the registry and tracker are touched and the only producer of
//! [`SessionEvent`]s, so the event stream is totally ordered. Node table writes happen on the
//! blocking pool every `flush_interval` and once more at shutdown; a failed write leaves the
//! table dirty so the next flush tries again.
//!
//! At shutdown every message still in flight is reported as `DeliveryCancelled` and the radio
//! is told to end the API session before the link is closed.
//!
//! ```rust,no_run
//! use meshsession::config::Config;
//! use meshsession::meshtastic::Destination;
//! use meshsession::registry::MemoryNodeStore;
//! use meshsession::session::{Session, SessionEvent};
//! use meshsession::transport::MockTransport;
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::default();
//! let (session, mut events) = Session::spawn(
//!     (&config).into(),
//!     MockTransport::new(),
//!     Arc::new(MemoryNodeStore::new()),
//! );
//! let id = session.send_message(Destination::Broadcast, "hello mesh").await?;
//! while let Some(ev) = events.recv().await {
//!     if let SessionEvent::DeliveryConfirmed { message_id, .. } = ev {
//!         if message_id == id {
//!             break;
//!         }
//!     }
//! }
//! session.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod events;

pub use events::{ReceivedMessage, SendOptions, SessionEvent, SessionEvents};

use crate::config::Config;
use crate::delivery::{
    AckTracker, FailureReason, MessageStatus, RetryPolicy, TrackerAction, TrackerConfig,
};
use crate::error::{PersistenceError, SessionError};
use crate::logutil::{hex_snippet, preview};
use crate::meshtastic::{
    self, Destination, InboundEvent, LinkStatus, MessageId, NodeId, NodeSighting,
};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::{NodeRecord, NodeRegistry, NodeStore, Observation};
use crate::supervisor::{
    ConnectionState, LinkEvent, Supervisor, SupervisorConfig, SupervisorHandle,
};
use crate::transport::Transport;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

/// Longest text accepted for one packet, leaving room for protocol overhead.
pub const MAX_TEXT_BYTES: usize = 200;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tracker: TrackerConfig,
    /// Channel used when a send does not name one.
    pub channel: u32,
    pub supervisor: SupervisorConfig,
    pub flush_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionConfig {
    fn from(c: &Config) -> Self {
        Self {
            tracker: TrackerConfig {
                default_policy: RetryPolicy {
                    max_attempts: c.delivery.max_attempts,
                    retry_interval: c.delivery.retry_interval(),
                },
                history_limit: c.delivery.history_limit,
            },
            channel: c.delivery.channel,
            supervisor: SupervisorConfig::from(c),
            flush_interval: c.storage.flush_interval(),
        }
    }
}

enum Request {
    Send {
        destination: Destination,
        text: String,
        options: SendOptions,
        reply: oneshot::Sender<Result<MessageId, SessionError>>,
    },
    Cancel(MessageId, oneshot::Sender<bool>),
    Status(MessageId, oneshot::Sender<Option<MessageStatus>>),
    InFlight(oneshot::Sender<Vec<MessageStatus>>),
    Reconnect,
    Disconnect,
    Connect,
    Nodes(oneshot::Sender<Vec<NodeRecord>>),
    Node(NodeId, oneshot::Sender<Option<NodeRecord>>),
    NodeCount(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to a running session. Every call fails with
/// [`SessionError::Closed`] once the session has shut down.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    metrics: Arc<Metrics>,
}

impl SessionHandle {
    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Request,
    ) -> Result<R, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Send `text` with the configured retry policy. The returned id identifies the
    /// `DeliveryConfirmed` / `DeliveryFailed` event that will follow.
    pub async fn send_message(
        &self,
        destination: Destination,
        text: &str,
    ) -> Result<MessageId, SessionError> {
        self.send_message_with(destination, text, SendOptions::default())
            .await
    }

    pub async fn send_message_with(
        &self,
        destination: Destination,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId, SessionError> {
        let text = text.to_string();
        self.call(|reply| Request::Send {
            destination,
            text,
            options,
            reply,
        })
        .await?
    }

    /// Stop retrying a message. Returns false when it had already finished.
    pub async fn cancel_message(&self, id: MessageId) -> Result<bool, SessionError> {
        self.call(|reply| Request::Cancel(id, reply)).await
    }

    pub async fn message_status(
        &self,
        id: MessageId,
    ) -> Result<Option<MessageStatus>, SessionError> {
        self.call(|reply| Request::Status(id, reply)).await
    }

    /// Messages still waiting for an outcome.
    pub async fn in_flight(&self) -> Result<Vec<MessageStatus>, SessionError> {
        self.call(Request::InFlight).await
    }

    pub async fn request_reconnect(&self) -> Result<(), SessionError> {
        self.requests
            .send(Request::Reconnect)
            .map_err(|_| SessionError::Closed)
    }

    /// Close the link and stay disconnected until [`connect`](Self::connect). Messages keep
    /// their timers meanwhile.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.requests
            .send(Request::Disconnect)
            .map_err(|_| SessionError::Closed)
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        self.requests
            .send(Request::Connect)
            .map_err(|_| SessionError::Closed)
    }

    /// All known nodes, most recently seen first.
    pub async fn nodes(&self) -> Result<Vec<NodeRecord>, SessionError> {
        self.call(Request::Nodes).await
    }

    pub async fn node(&self, id: NodeId) -> Result<Option<NodeRecord>, SessionError> {
        self.call(|reply| Request::Node(id, reply)).await
    }

    pub async fn node_count(&self) -> Result<usize, SessionError> {
        self.call(Request::NodeCount).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes without consuming the event stream.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cancel whatever is still in flight, close the link, write the node table and stop.
    /// Later calls return `Closed`.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.call(Request::Shutdown).await
    }
}

pub struct Session;

impl Session {
    /// Start a session on `transport`. Nodes from `store` are loaded before any frame is
    /// processed; they are known but never reported as discovered.
    pub fn spawn<T: Transport>(
        config: SessionConfig,
        transport: T,
        store: Arc<dyn NodeStore>,
    ) -> (SessionHandle, SessionEvents) {
        let metrics = Arc::new(Metrics::new());
        let (supervisor, link_events) =
            Supervisor::new(transport, config.supervisor.clone(), metrics.clone())
                .with_keepalive(|| meshtastic::encode_heartbeat(rand::random()))
                .spawn();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            requests: req_tx,
            state: supervisor.subscribe(),
            metrics: metrics.clone(),
        };
        let actor = SessionActor {
            tracker: AckTracker::new(config.tracker.clone()),
            config,
            registry: NodeRegistry::new(),
            supervisor,
            link_events,
            requests: req_rx,
            events: ev_tx,
            metrics,
            store,
            link_up: false,
            config_request: None,
            flush_task: None,
        };
        tokio::spawn(actor.run());
        (handle, ev_rx)
    }
}

struct SessionActor {
    config: SessionConfig,
    registry: NodeRegistry,
    tracker: AckTracker,
    supervisor: SupervisorHandle,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<SessionEvent>,
    metrics: Arc<Metrics>,
    store: Arc<dyn NodeStore>,
    /// Connected, as last reported on the link event stream.
    link_up: bool,
    /// Outstanding `want_config_id`.
    config_request: Option<u32>,
    flush_task: Option<JoinHandle<Result<(), PersistenceError>>>,
}

impl SessionActor {
    async fn run(mut self) {
        self.load_nodes().await;

        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let flush_every = self.config.flush_interval;
        let mut flush = interval_at(Instant::now() + flush_every, flush_every);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reply = loop {
            tokio::select! {
                req = self.requests.recv() => match req {
                    Some(req) => {
                        if let Some(reply) = self.handle_request(req) {
                            break Some(reply);
                        }
                    }
                    None => {
                        debug!("all session handles dropped");
                        break None;
                    }
                },
                ev = self.link_events.recv() => match ev {
                    Some(ev) => self.on_link_event(ev),
                    None => {
                        error!("connection supervisor stopped unexpectedly");
                        break None;
                    }
                },
                _ = tick.tick() => self.drive_tracker(),
                _ = flush.tick() => self.flush_nodes().await,
            }
        };

        for action in self.tracker.cancel_all() {
            self.apply(action);
        }
        if self.link_up {
            self.supervisor.send_frame(meshtastic::encode_disconnect());
        }
        self.supervisor.shutdown().await;
        // report the supervisor's final state change; late frames are dropped
        while let Ok(ev) = self.link_events.try_recv() {
            if let LinkEvent::StateChanged(s) = ev {
                self.emit(SessionEvent::ConnectionStateChanged(s));
            }
        }
        self.final_flush().await;
        info!("session stopped");
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn emit(&self, event: SessionEvent) {
        trace!("event {:?}", event);
        let _ = self.events.send(event);
    }

    async fn load_nodes(&mut self) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(Ok(records)) => {
                let n = self.registry.restore(records);
                if n > 0 {
                    info!("loaded {} known nodes", n);
                }
            }
            Ok(Err(e)) => warn!("could not load node table: {}", e),
            Err(e) => warn!("node table load task failed: {}", e),
        }
    }

    /// Returns the reply channel when the request asks the session to stop.
    fn handle_request(&mut self, req: Request) -> Option<oneshot::Sender<()>> {
        match req {
            Request::Send {
                destination,
                text,
                options,
                reply,
            } => {
                let _ = reply.send(self.send(destination, &text, options));
            }
            Request::Cancel(id, reply) => {
                let action = self.tracker.cancel(id);
                let cancelled = action.is_some();
                if let Some(action) = action {
                    self.apply(action);
                }
                let _ = reply.send(cancelled);
            }
            Request::Status(id, reply) => {
                let _ = reply.send(self.tracker.status(id));
            }
            Request::InFlight(reply) => {
                let _ = reply.send(self.tracker.in_flight());
            }
            Request::Reconnect => self.supervisor.reconnect(),
            Request::Disconnect => self.supervisor.disconnect(),
            Request::Connect => self.supervisor.connect(),
            Request::Nodes(reply) => {
                let _ = reply.send(self.registry.list());
            }
            Request::Node(id, reply) => {
                let _ = reply.send(self.registry.get(id).cloned());
            }
            Request::NodeCount(reply) => {
                let _ = reply.send(self.registry.count());
            }
            Request::Shutdown(reply) => return Some(reply),
        }
        None
    }

    fn send(
        &mut self,
        destination: Destination,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if text.len() > MAX_TEXT_BYTES {
            return Err(SessionError::MessageTooLarge {
                len: text.len(),
                max: MAX_TEXT_BYTES,
            });
        }
        let defaults = self.tracker.default_policy();
        let policy = RetryPolicy {
            max_attempts: options.max_attempts.unwrap_or(defaults.max_attempts),
            retry_interval: options.retry_interval.unwrap_or(defaults.retry_interval),
        };
        let channel = options.channel.unwrap_or(self.config.channel);
        let (id, action) = self.tracker.register(
            destination,
            channel,
            text,
            Some(policy),
            Instant::now(),
            self.link_up,
        );
        if let Some(action) = action {
            self.apply(action);
        }
        Ok(id)
    }

    fn apply(&mut self, action: TrackerAction) {
        match action {
            TrackerAction::Transmit { id, attempt, frame } => {
                if attempt == 1 {
                    self.metrics.inc_sent();
                } else {
                    self.metrics.inc_retries();
                }
                trace!("queue id={} attempt {}", id, attempt);
                if !self.supervisor.send_frame(frame) {
                    warn!("supervisor gone; frame for id={} not queued", id);
                }
            }
            TrackerAction::Confirmed {
                id,
                attempts,
                latency,
            } => {
                self.metrics.inc_acked(latency);
                self.emit(SessionEvent::DeliveryConfirmed {
                    message_id: id,
                    attempts,
                    latency,
                });
            }
            TrackerAction::Failed {
                id,
                attempts,
                reason,
            } => {
                match reason {
                    FailureReason::Expired => self.metrics.inc_expired(),
                    FailureReason::Rejected(_) => self.metrics.inc_rejected(),
                }
                self.emit(SessionEvent::DeliveryFailed {
                    message_id: id,
                    attempts,
                    reason,
                });
            }
            TrackerAction::Cancelled { id } => {
                self.metrics.inc_cancelled();
                self.emit(SessionEvent::DeliveryCancelled { message_id: id });
            }
        }
    }

    fn drive_tracker(&mut self) {
        for action in self.tracker.tick(Instant::now(), self.link_up) {
            self.apply(action);
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged(state) => {
                self.link_up = state == ConnectionState::Connected;
                self.emit(SessionEvent::ConnectionStateChanged(state));
            }
            LinkEvent::Established { restored } => {
                self.request_radio_state();
                if restored {
                    self.emit(SessionEvent::ConnectionRestored);
                }
                // release anything held while the link was down
                self.drive_tracker();
            }
            LinkEvent::Frame(frame) => {
                self.metrics.inc_frames_in();
                match meshtastic::decode_frame(&frame) {
                    Ok(events) => {
                        for ev in events {
                            self.dispatch(ev);
                        }
                    }
                    Err(e) => {
                        self.metrics.inc_frames_dropped();
                        debug!(
                            "dropping undecodable frame ({}): {}",
                            e,
                            hex_snippet(&frame, 32)
                        );
                    }
                }
            }
        }
    }

    fn request_radio_state(&mut self) {
        let id = rand::random::<u32>().max(1);
        self.config_request = Some(id);
        debug!("requesting radio state (want_config_id={})", id);
        self.supervisor
            .send_frame(meshtastic::encode_want_config(id));
    }

    fn dispatch(&mut self, event: InboundEvent) {
        let now = Instant::now();
        match event {
            InboundEvent::TextMessage {
                sender,
                to,
                channel,
                text,
                timestamp,
            } => {
                let local = self.registry.local_node();
                if Some(sender.id) == local {
                    trace!("ignoring echo of our own text");
                    return;
                }
                self.observe(&sender);
                if let (Destination::Node(dest), Some(me)) = (to, local) {
                    if dest != me {
                        trace!("text for {} not addressed to us", dest);
                        return;
                    }
                }
                let from_name = self.registry.get(sender.id).map(|r| r.label());
                debug!(
                    "text from {} on ch{}: '{}'",
                    sender.id,
                    channel,
                    preview(&text, 60)
                );
                self.emit(SessionEvent::MessageReceived(ReceivedMessage {
                    from: sender.id,
                    from_name,
                    to,
                    channel,
                    text,
                    timestamp,
                    signal: sender.signal,
                }));
            }
            InboundEvent::Ack { message_id, from } => {
                trace!("ack for id={} from {}", message_id, from);
                if let Some(action) = self.tracker.on_ack(message_id, now) {
                    self.apply(action);
                }
            }
            InboundEvent::UncorrelatedAck { from } => {
                if let Some(action) = self.tracker.on_uncorrelated_ack(from, now) {
                    self.apply(action);
                }
            }
            InboundEvent::Nak {
                message_id,
                from,
                reason,
            } => {
                debug!("routing error {:?} for id={} from {}", reason, message_id, from);
                if let Some(action) = self.tracker.on_nak(message_id, reason, now) {
                    self.apply(action);
                }
            }
            InboundEvent::NodeSeen(sighting) => self.observe(&sighting),
            InboundEvent::MyInfo { node } => {
                if self.registry.local_node() != Some(node) {
                    info!("local radio is {}", node);
                }
                self.registry.set_local_node(node);
            }
            InboundEvent::DeviceTelemetry(t) => {
                self.emit(SessionEvent::DeviceTelemetry(t));
            }
            InboundEvent::LinkStatus(status) => {
                if let LinkStatus::ConfigComplete { request_id } = status {
                    if self.config_request == Some(request_id) {
                        self.config_request = None;
                        info!("radio state received; {} nodes known", self.registry.count());
                    }
                }
                self.supervisor.link_status(status);
            }
        }
    }

    fn observe(&mut self, sighting: &NodeSighting) {
        let kind = self.registry.observe_detailed(sighting, Utc::now());
        let Some(record) = self.registry.get(sighting.id).cloned() else {
            return;
        };
        match kind {
            Observation::Discovered => {
                info!("discovered node {} ({})", record.id, record.label());
                self.emit(SessionEvent::NodeDiscovered(record));
            }
            Observation::Updated => self.emit(SessionEvent::NodeUpdated(record)),
            Observation::Ignored => {}
        }
    }

    async fn flush_nodes(&mut self) {
        if let Some(task) = self.flush_task.take() {
            if !task.is_finished() {
                trace!("node table write still running; deferring");
                self.flush_task = Some(task);
                return;
            }
            self.reap_flush(task).await;
        }
        let Some(snapshot) = self.registry.take_dirty_snapshot() else {
            return;
        };
        let store = self.store.clone();
        self.flush_task = Some(tokio::task::spawn_blocking(move || -> Result<(), PersistenceError> {
            store.save(&snapshot)?;
            trace!("node table written ({} nodes)", snapshot.len());
            Ok(())
        }));
    }

    /// Collect a finished write; on failure the table is flagged for the next flush.
    async fn reap_flush(&mut self, task: JoinHandle<Result<(), PersistenceError>>) {
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(PersistenceError::Internal(e.to_string())),
        };
        if let Err(e) = result {
            warn!("node table write failed, will retry: {}", e);
            self.registry.mark_dirty();
        }
    }

    async fn final_flush(&mut self) {
        if let Some(task) = self.flush_task.take() {
            self.reap_flush(task).await;
        }
        if let Some(snapshot) = self.registry.take_dirty_snapshot() {
            let store = self.store.clone();
            match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
                Ok(Ok(())) => debug!("node table written at shutdown"),
                Ok(Err(e)) => warn!("node table write at shutdown failed: {}", e),
                Err(e) => warn!("node table write task failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::radio;
    use crate::registry::MemoryNodeStore;
    use crate::transport::MockTransport;

    fn config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.tracker.default_policy = RetryPolicy {
            max_attempts: 3,
            retry_interval: Duration::from_secs(10),
        };
        config.supervisor.min_backoff = Duration::from_secs(1);
        config.supervisor.keepalive_interval = None;
        config
    }

    async fn next_event(events: &mut SessionEvents) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(3600), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("session stopped")
    }

    async fn wait_connected(events: &mut SessionEvents) {
        loop {
            if next_event(events).await
                == SessionEvent::ConnectionStateChanged(ConnectionState::Connected)
            {
                return;
            }
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn rejects_empty_and_oversize_text() {
        let (session, _events) =
            Session::spawn(config(), MockTransport::new(), Arc::new(MemoryNodeStore::new()));
        assert_eq!(
            session.send_message(Destination::Broadcast, "  ").await,
            Err(SessionError::EmptyMessage)
        );
        let long = "x".repeat(MAX_TEXT_BYTES + 1);
        assert!(matches!(
            session.send_message(Destination::Broadcast, &long).await,
            Err(SessionError::MessageTooLarge { .. })
        ));
        session.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn requests_radio_state_on_connect() {
        let mock = MockTransport::new();
        let (session, mut events) =
            Session::spawn(config(), mock.clone(), Arc::new(MemoryNodeStore::new()));
        wait_connected(&mut events).await;
        for _ in 0..10 {
            if !mock.sent_config_requests().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mock.sent_config_requests().len(), 1);
        session.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn own_node_is_not_discovered() {
        let mock = MockTransport::new();
        let (session, mut events) =
            Session::spawn(config(), mock.clone(), Arc::new(MemoryNodeStore::new()));
        wait_connected(&mut events).await;
        mock.inject(radio::my_info(NodeId(1)));
        mock.inject(radio::node_db_entry(NodeId(1), "Me", 0));
        mock.inject(radio::node_db_entry(NodeId(2), "Peer", 0));
        match next_event(&mut events).await {
            SessionEvent::NodeDiscovered(rec) => assert_eq!(rec.id, NodeId(2)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.node_count().await.unwrap(), 1);
        session.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn calls_after_shutdown_are_closed() {
        let (session, _events) =
            Session::spawn(config(), MockTransport::new(), Arc::new(MemoryNodeStore::new()));
        session.shutdown().await.unwrap();
        assert_eq!(session.node_count().await, Err(SessionError::Closed));
        assert_eq!(
            session.send_message(Destination::Broadcast, "late").await,
            Err(SessionError::Closed)
        );
    }
}
