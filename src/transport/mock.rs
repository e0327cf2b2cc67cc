//! In-process transport for tests and `--mock` runs.
//!
//! The transport and every clone of it share one state, so a test keeps a clone as a remote
//! control while the session owns the original: script open failures, inject inbound frames,
//! kill the link and inspect what was written.
use super::{FrameResult, Link, LinkHandle, Transport};
use crate::error::TransportError;
use crate::meshtastic::{self, radio, Destination, NodeId};
use async_trait::async_trait;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const INBOUND_QUEUE: usize = 256;

#[derive(Default)]
struct MockState {
    open_script: VecDeque<TransportError>,
    open_attempts: usize,
    sent: Vec<Vec<u8>>,
    inbound: Option<mpsc::Sender<FrameResult>>,
    alive: Option<Arc<AtomicBool>>,
    fail_writes: bool,
    echo: Option<EchoRadio>,
}

/// Minimal radio behaviour: answers config requests and acks every text packet.
#[derive(Debug, Clone, Copy)]
struct EchoRadio {
    local: NodeId,
    neighbour: NodeId,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that behaves like a radio with one neighbour: it replies to config requests
    /// with `local` as our node and acknowledges every text packet from its destination
    /// (or from `neighbour` for broadcasts).
    pub fn echo_radio(local: NodeId, neighbour: NodeId) -> Self {
        let mock = Self::default();
        mock.lock().echo = Some(EchoRadio { local, neighbour });
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // a panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make the next `n` calls to `open()` fail with `error`; later opens succeed.
    pub fn fail_next_opens(&self, n: usize, error: TransportError) {
        let mut st = self.lock();
        for _ in 0..n {
            st.open_script.push_back(error.clone());
        }
    }

    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.lock().inbound.is_some()
    }

    /// Deliver a frame on the current link. Returns false when no link is open.
    pub fn inject(&self, frame: Vec<u8>) -> bool {
        let st = self.lock();
        match &st.inbound {
            Some(tx) => tx.try_send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Report a read failure on the current link and end its stream.
    pub fn fail_link(&self, error: TransportError) {
        let mut st = self.lock();
        if let Some(alive) = st.alive.take() {
            alive.store(false, Ordering::Release);
        }
        if let Some(tx) = st.inbound.take() {
            let _ = tx.try_send(Err(error));
        }
    }

    /// Make the current link report dead through `is_alive()` without any stream error,
    /// like a port whose device vanished during sleep.
    pub fn go_silent(&self) {
        if let Some(alive) = &self.lock().alive {
            alive.store(false, Ordering::Release);
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Text packets written so far, in order.
    pub fn sent_texts(&self) -> Vec<(meshtastic::MessageId, Destination, String)> {
        self.lock()
            .sent
            .iter()
            .filter_map(|f| meshtastic::outbound_text(f))
            .collect()
    }

    /// Config request ids written so far.
    pub fn sent_config_requests(&self) -> Vec<u32> {
        self.lock()
            .sent
            .iter()
            .filter_map(|f| meshtastic::outbound_want_config(f))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<LinkHandle, TransportError> {
        let mut st = self.lock();
        st.open_attempts += 1;
        if let Some(e) = st.open_script.pop_front() {
            debug!("mock open #{} fails: {}", st.open_attempts, e);
            return Err(e);
        }
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let alive = Arc::new(AtomicBool::new(true));
        st.inbound = Some(tx);
        st.alive = Some(alive.clone());
        debug!("mock open #{} ok", st.open_attempts);
        let link = MockLink {
            state: self.state.clone(),
            alive,
        };
        Ok(LinkHandle::new(Box::new(link), rx))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

struct MockLink {
    state: Arc<Mutex<MockState>>,
    alive: Arc<AtomicBool>,
}

impl MockLink {
    fn is_current(&self, st: &MockState) -> bool {
        st.alive
            .as_ref()
            .map(|a| Arc::ptr_eq(a, &self.alive))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Link for MockLink {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if !self.alive.load(Ordering::Acquire) || !self.is_current(&st) {
            return Err(TransportError::Io("mock link is down".into()));
        }
        if st.fail_writes {
            return Err(TransportError::Io("mock write failure".into()));
        }
        st.sent.push(frame.to_vec());
        if let (Some(echo), Some(tx)) = (st.echo, st.inbound.as_ref()) {
            for reply in echo.replies(frame) {
                let _ = tx.try_send(Ok(reply));
            }
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::Release);
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_current(&st) {
            st.inbound = None;
            st.alive = None;
        }
    }
}

impl EchoRadio {
    fn replies(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        if let Some(id) = meshtastic::outbound_want_config(frame) {
            return vec![
                radio::my_info(self.local),
                radio::node_info(self.neighbour, "Mock Neighbour", "MOCK"),
                radio::config_complete(id),
            ];
        }
        if let Some((id, dest, _)) = meshtastic::outbound_text(frame) {
            let from = match dest {
                Destination::Node(n) => n,
                Destination::Broadcast => self.neighbour,
            };
            return vec![radio::ack(from, id)];
        }
        Vec::new()
    }
}
