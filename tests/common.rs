//! Session fixtures shared by the integration tests.
//!
//! Every test runs on a paused clock (`start_paused = true`), so retry intervals and reconnect
//! backoff elapse instantly while their ordering is preserved.
#![allow(dead_code)]

use meshsession::delivery::RetryPolicy;
use meshsession::registry::{MemoryNodeStore, NodeStore};
use meshsession::session::{Session, SessionConfig, SessionEvent, SessionEvents, SessionHandle};
use meshsession::supervisor::ConnectionState;
use meshsession::transport::MockTransport;
use std::sync::Arc;
use std::time::Duration;

/// 3 attempts 10s apart, fast reconnects, no heartbeat frames.
pub fn session_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.tracker.default_policy = RetryPolicy {
        max_attempts: 3,
        retry_interval: Duration::from_secs(10),
    };
    config.supervisor.min_backoff = Duration::from_secs(1);
    config.supervisor.max_backoff = Duration::from_secs(8);
    config.supervisor.keepalive_interval = None;
    config
}

pub fn start(mock: &MockTransport) -> (SessionHandle, SessionEvents) {
    start_with(session_config(), mock, Arc::new(MemoryNodeStore::new()))
}

pub fn start_with(
    config: SessionConfig,
    mock: &MockTransport,
    store: Arc<dyn NodeStore>,
) -> (SessionHandle, SessionEvents) {
    Session::spawn(config, mock.clone(), store)
}

pub async fn next_event(events: &mut SessionEvents) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(3600), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session event stream closed")
}

/// Skip events until one matches. Returns it along with everything skipped on the way.
pub async fn wait_for(
    events: &mut SessionEvents,
    pred: impl Fn(&SessionEvent) -> bool,
) -> (SessionEvent, Vec<SessionEvent>) {
    let mut skipped = Vec::new();
    loop {
        let ev = next_event(events).await;
        if pred(&ev) {
            return (ev, skipped);
        }
        skipped.push(ev);
    }
}

/// Wait for a transition into `state`; returns the events seen before it.
pub async fn wait_state(events: &mut SessionEvents, state: ConnectionState) -> Vec<SessionEvent> {
    let target = SessionEvent::ConnectionStateChanged(state);
    wait_for(events, |e| *e == target).await.1
}

/// Let every task run until the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Poll `cond` on the paused clock until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub fn drain(events: &mut SessionEvents) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}
