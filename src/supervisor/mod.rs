//! # Connection Supervisor
//!
//! A single task that owns the [`Transport`] and whatever [`LinkHandle`] is currently open.
//! Everything else talks to it through a [`SupervisorHandle`]:
//!
//! - outbound frames are queued on its command channel and written one at a time, so a retry
//!   and a fresh send can never interleave on the wire;
//! - inbound frames and state transitions come back, in order, on one [`LinkEvent`] channel;
//! - the current [`ConnectionState`] is also published on a `watch` channel for cheap reads.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──open ok──▶ Connected
//! Connected ──read/write failure, dead or stale link──▶ Reconnecting ──open ok──▶ Connected
//! Reconnecting ──open fails──▶ Reconnecting (after backoff)
//! ```
//!
//! There is no terminal failure state: the supervisor keeps trying until it is told to
//! disconnect or shut down. Frames queued while no link is open stay queued and go out after
//! the next successful open.
//!
//! A link counts as healthy once the radio has sent a frame on it or it has stayed up for
//! [`HEALTHY_UPTIME`]. Only a healthy link resets the backoff and earns an immediate reopen
//! when it is lost; a device that opens and then fails straight away is retried on the
//! backoff schedule like a failed open.

mod backoff;

pub use backoff::Backoff;

use crate::config::Config;
use crate::error::TransportError;
use crate::meshtastic::LinkStatus;
use crate::metrics::Metrics;
use crate::transport::{LinkHandle, Transport};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};

/// Frames kept while the link is down; the oldest is dropped beyond this.
const OUTBOX_LIMIT: usize = 64;

/// Times a frame may fail to write before it is discarded.
const MAX_WRITE_FAILURES: u8 = 2;

/// Uptime after which a link that never received a frame still counts as healthy.
pub const HEALTHY_UPTIME: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub open_timeout: Duration,
    pub io_timeout: Duration,
    pub liveness_interval: Duration,
    pub stale_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(c: &Config) -> Self {
        Self {
            min_backoff: c.reconnect.min_backoff(),
            max_backoff: c.reconnect.max_backoff(),
            multiplier: c.reconnect.multiplier,
            open_timeout: c.device.open_timeout(),
            io_timeout: c.device.io_timeout(),
            liveness_interval: c.reconnect.liveness_interval(),
            stale_timeout: c.reconnect.stale_timeout(),
            keepalive_interval: c.reconnect.keepalive_interval(),
        }
    }
}

/// Emitted by the supervisor, in the order things happened on the link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(ConnectionState),
    /// A link is ready for use. `restored` is false only for the very first connection;
    /// it is also set when the radio reports a reboot behind an open link.
    Established { restored: bool },
    Frame(Vec<u8>),
}

enum Command {
    Send(Vec<u8>),
    Reconnect,
    Disconnect,
    Connect,
    LinkStatus(LinkStatus),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SupervisorHandle {
    /// Queue a frame for the link. Returns false once the supervisor has stopped.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.commands.send(Command::Send(frame)).is_ok()
    }

    /// Drop the current link (if any) and open a new one right away.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Close the link and stay disconnected until [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Forward a link notification decoded from the radio.
    pub fn link_status(&self, status: LinkStatus) {
        let _ = self.commands.send(Command::LinkStatus(status));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close the link and stop the task. Resolves once it has stopped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

type KeepaliveFn = Box<dyn FnMut() -> Vec<u8> + Send>;

/// Builder for the supervisor task.
pub struct Supervisor<T: Transport> {
    transport: T,
    config: SupervisorConfig,
    metrics: Arc<Metrics>,
    keepalive: Option<KeepaliveFn>,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(transport: T, config: SupervisorConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            transport,
            config,
            metrics,
            keepalive: None,
        }
    }

    /// Frame written every `keepalive_interval` while connected.
    pub fn with_keepalive(mut self, frame: impl FnMut() -> Vec<u8> + Send + 'static) -> Self {
        self.keepalive = Some(Box::new(frame));
        self
    }

    pub fn spawn(self) -> (SupervisorHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let backoff = Backoff::new(
            self.config.min_backoff,
            self.config.max_backoff,
            self.config.multiplier,
        );
        let task = SupervisorTask {
            transport: self.transport,
            config: self.config,
            metrics: self.metrics,
            keepalive: self.keepalive,
            commands: cmd_rx,
            events: ev_tx,
            state: state_tx,
            outbox: VecDeque::new(),
            backoff,
            ever_connected: false,
            recovering: false,
            healthy: false,
        };
        tokio::spawn(task.run());
        (
            SupervisorHandle {
                commands: cmd_tx,
                state: state_rx,
            },
            ev_rx,
        )
    }
}

struct Outgoing {
    frame: Vec<u8>,
    failures: u8,
}

enum LinkExit {
    Lost(String),
    Reconnect,
    Park,
    Shutdown(Option<oneshot::Sender<()>>),
}

enum WaitExit {
    Retry,
    Park,
    Shutdown(Option<oneshot::Sender<()>>),
}

struct SupervisorTask<T: Transport> {
    transport: T,
    config: SupervisorConfig,
    metrics: Arc<Metrics>,
    keepalive: Option<KeepaliveFn>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: watch::Sender<ConnectionState>,
    outbox: VecDeque<Outgoing>,
    backoff: Backoff,
    ever_connected: bool,
    /// A link was lost (or dropped on request) and has not come back yet.
    recovering: bool,
    /// The current (or last) link has proved itself; see [`HEALTHY_UPTIME`].
    healthy: bool,
}

impl<T: Transport> SupervisorTask<T> {
    async fn run(mut self) {
        let mut want_link = true;
        let mut hold_off: Option<Duration> = None;
        loop {
            if !want_link {
                self.set_state(ConnectionState::Disconnected);
                match self.park().await {
                    WaitExit::Retry => want_link = true,
                    WaitExit::Park => {}
                    WaitExit::Shutdown(reply) => return self.finish(reply),
                }
                continue;
            }

            self.set_state(if self.recovering {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });
            if let Some(delay) = hold_off.take() {
                match self.wait_backoff(delay).await {
                    WaitExit::Retry => {}
                    WaitExit::Park => {
                        self.recovering = false;
                        want_link = false;
                        continue;
                    }
                    WaitExit::Shutdown(reply) => return self.finish(reply),
                }
            }
            match self.open().await {
                Ok(mut link) => {
                    self.healthy = false;
                    let restored = self.ever_connected;
                    if restored {
                        self.metrics.inc_reconnects();
                    }
                    self.ever_connected = true;
                    self.recovering = false;
                    info!("link to {} established", self.transport.describe());
                    self.set_state(ConnectionState::Connected);
                    self.emit(LinkEvent::Established { restored });

                    let exit = self.run_link(&mut link).await;
                    link.close().await;
                    match exit {
                        LinkExit::Lost(reason) => {
                            self.recovering = true;
                            if self.healthy {
                                warn!("link to {} lost: {}", self.transport.describe(), reason);
                            } else {
                                let delay = self.backoff.next_delay();
                                warn!(
                                    "link to {} lost before it became healthy: {}; reopening in {:?}",
                                    self.transport.describe(),
                                    reason,
                                    delay
                                );
                                hold_off = Some(delay);
                            }
                        }
                        LinkExit::Reconnect => {
                            info!("reconnect requested");
                            self.recovering = true;
                        }
                        LinkExit::Park => {
                            info!("disconnected on request");
                            self.recovering = false;
                            want_link = false;
                        }
                        LinkExit::Shutdown(reply) => return self.finish(reply),
                    }
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        "open {} failed: {}; next attempt in {:?}",
                        self.transport.describe(),
                        e,
                        delay
                    );
                    match self.wait_backoff(delay).await {
                        WaitExit::Retry => {}
                        WaitExit::Park => {
                            self.recovering = false;
                            want_link = false;
                        }
                        WaitExit::Shutdown(reply) => return self.finish(reply),
                    }
                }
            }
        }
    }

    fn finish(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.set_state(ConnectionState::Disconnected);
        if !self.outbox.is_empty() {
            debug!("supervisor stopping with {} unsent frames", self.outbox.len());
        }
        info!("connection supervisor stopped");
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if *self.state.borrow() == next {
            return;
        }
        debug!("connection state -> {}", next);
        self.state.send_replace(next);
        self.emit(LinkEvent::StateChanged(next));
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn enqueue(&mut self, frame: Vec<u8>) {
        if self.outbox.len() >= OUTBOX_LIMIT {
            warn!("outbox full, dropping oldest queued frame");
            self.outbox.pop_front();
        }
        self.outbox.push_back(Outgoing { frame, failures: 0 });
    }

    async fn open(&mut self) -> Result<LinkHandle, TransportError> {
        match timeout(self.config.open_timeout, self.transport.open()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Io(format!(
                "open timed out after {:?}",
                self.config.open_timeout
            ))),
        }
    }

    /// Write every queued frame. On failure the frame stays queued for the next link.
    async fn flush(&mut self, link: &mut LinkHandle) -> Result<(), TransportError> {
        while let Some(next) = self.outbox.front_mut() {
            let result = match timeout(self.config.io_timeout, link.send_frame(&next.frame)).await
            {
                Ok(r) => r,
                Err(_) => Err(TransportError::Io(format!(
                    "write timed out after {:?}",
                    self.config.io_timeout
                ))),
            };
            match result {
                Ok(()) => {
                    trace!("wrote frame of {} bytes", next.frame.len());
                    self.outbox.pop_front();
                }
                Err(e) => {
                    next.failures += 1;
                    if next.failures >= MAX_WRITE_FAILURES {
                        warn!("discarding frame after {} failed writes", next.failures);
                        self.outbox.pop_front();
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn mark_healthy(&mut self) {
        if !self.healthy {
            trace!("link healthy; backoff reset");
            self.healthy = true;
            self.backoff.reset();
        }
    }

    async fn run_link(&mut self, link: &mut LinkHandle) -> LinkExit {
        if let Err(e) = self.flush(link).await {
            return LinkExit::Lost(e.to_string());
        }
        let start = Instant::now();
        let mut liveness = ticker(start, self.config.liveness_interval);
        let mut keepalive = self.config.keepalive_interval.map(|d| ticker(start, d));
        let proven = tokio::time::sleep_until(start + HEALTHY_UPTIME);
        tokio::pin!(proven);
        let mut last_rx = start;

        loop {
            tokio::select! {
                frame = link.next_frame() => match frame {
                    Some(Ok(frame)) => {
                        last_rx = Instant::now();
                        self.mark_healthy();
                        self.emit(LinkEvent::Frame(frame));
                    }
                    Some(Err(e)) => return LinkExit::Lost(e.to_string()),
                    None => return LinkExit::Lost("inbound stream ended".into()),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(frame)) => {
                        self.enqueue(frame);
                        if let Err(e) = self.flush(link).await {
                            return LinkExit::Lost(e.to_string());
                        }
                    }
                    Some(Command::Reconnect) => return LinkExit::Reconnect,
                    Some(Command::Disconnect) => return LinkExit::Park,
                    Some(Command::Connect) => {}
                    Some(Command::LinkStatus(LinkStatus::Rebooted)) => {
                        info!("radio rebooted; link kept, state must be requested again");
                        self.emit(LinkEvent::Established { restored: true });
                    }
                    Some(Command::LinkStatus(LinkStatus::ConfigComplete { request_id })) => {
                        debug!("radio config replay {} complete", request_id);
                    }
                    Some(Command::Shutdown(reply)) => return LinkExit::Shutdown(Some(reply)),
                    None => return LinkExit::Shutdown(None),
                },
                _ = &mut proven, if !self.healthy => self.mark_healthy(),
                _ = liveness.tick() => {
                    if !link.is_alive() {
                        return LinkExit::Lost("link reports dead".into());
                    }
                    let quiet = last_rx.elapsed();
                    if quiet >= self.config.stale_timeout {
                        return LinkExit::Lost(format!("no inbound traffic for {}s", quiet.as_secs()));
                    }
                }
                _ = tick_opt(&mut keepalive) => {
                    if let Some(make) = self.keepalive.as_mut() {
                        let frame = make();
                        self.enqueue(frame);
                        if let Err(e) = self.flush(link).await {
                            return LinkExit::Lost(e.to_string());
                        }
                        trace!("keepalive sent");
                    }
                }
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) -> WaitExit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return WaitExit::Retry,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(frame)) => self.enqueue(frame),
                    Some(Command::Reconnect) | Some(Command::Connect) => return WaitExit::Retry,
                    Some(Command::Disconnect) => return WaitExit::Park,
                    Some(Command::LinkStatus(_)) => {}
                    Some(Command::Shutdown(reply)) => return WaitExit::Shutdown(Some(reply)),
                    None => return WaitExit::Shutdown(None),
                },
            }
        }
    }

    async fn park(&mut self) -> WaitExit {
        loop {
            match self.commands.recv().await {
                Some(Command::Send(frame)) => self.enqueue(frame),
                Some(Command::Reconnect) | Some(Command::Connect) => return WaitExit::Retry,
                Some(Command::Disconnect) | Some(Command::LinkStatus(_)) => {}
                Some(Command::Shutdown(reply)) => return WaitExit::Shutdown(Some(reply)),
                None => return WaitExit::Shutdown(None),
            }
        }
    }
}

fn ticker(start: Instant, period: Duration) -> Interval {
    let mut i = interval_at(start + period, period);
    i.set_missed_tick_behavior(MissedTickBehavior::Delay);
    i
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
