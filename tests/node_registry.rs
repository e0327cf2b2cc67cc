//! Node discovery, merging and persistence through a running session.
mod common;

use chrono::{TimeZone, Utc};
use common::*;
use meshsession::meshtastic::{radio, NodeId};
use meshsession::error::PersistenceError;
use meshsession::registry::{JsonNodeStore, MemoryNodeStore, NodeRecord, NodeStore};
use meshsession::session::SessionEvent;
use meshsession::supervisor::ConnectionState;
use meshsession::transport::MockTransport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn discoveries(events: &[SessionEvent]) -> HashMap<NodeId, usize> {
    let mut out = HashMap::new();
    for ev in events {
        if let SessionEvent::NodeDiscovered(rec) = ev {
            *out.entry(rec.id).or_insert(0) += 1;
        }
    }
    out
}

/// In-memory store whose first `failures` saves return an error.
struct FlakyStore {
    inner: MemoryNodeStore,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyStore {
    fn failing(failures: usize) -> Self {
        Self {
            inner: MemoryNodeStore::new(),
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl NodeStore for FlakyStore {
    fn load(&self) -> Result<Vec<NodeRecord>, PersistenceError> {
        self.inner.load()
    }

    fn save(&self, nodes: &[NodeRecord]) -> Result<(), PersistenceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PersistenceError::Internal("disk full".into()));
        }
        self.inner.save(nodes)
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn each_node_is_discovered_once() {
    let mock = MockTransport::new();
    let (session, mut events) = start(&mock);
    wait_state(&mut events, ConnectionState::Connected).await;

    assert!(mock.inject(radio::node_info(NodeId(2), "Two", "TWO")));
    assert!(mock.inject(radio::text(NodeId(2), None, "hi all")));
    assert!(mock.inject(radio::node_info(NodeId(3), "Three", "THR")));
    assert!(mock.inject(radio::node_info(NodeId(2), "Two", "TWO")));
    assert!(mock.inject(radio::device_metrics(NodeId(3), 80, 4.1)));
    settle().await;

    let seen = drain(&mut events);
    let found = discoveries(&seen);
    assert_eq!(found.get(&NodeId(2)), Some(&1));
    assert_eq!(found.get(&NodeId(3)), Some(&1));
    let updates = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::NodeUpdated(_)))
        .count();
    assert_eq!(updates, 3);

    let msg = seen
        .iter()
        .find_map(|e| match e {
            SessionEvent::MessageReceived(m) => Some(m.clone()),
            _ => None,
        })
        .expect("message event");
    assert_eq!(msg.from, NodeId(2));
    assert_eq!(msg.from_name.as_deref(), Some("Two"));
    assert!(!msg.is_direct());

    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::DeviceTelemetry(t) if t.node == NodeId(3) && t.battery_level == Some(80)
    )));

    let nodes = session.nodes().await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(session.node_count().await.unwrap(), 2);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn last_seen_is_monotonic_across_replays() {
    let mock = MockTransport::new();
    let (session, mut events) = start(&mock);
    wait_state(&mut events, ConnectionState::Connected).await;

    assert!(mock.inject(radio::node_info(NodeId(5), "Node Five", "N5")));
    settle().await;
    let first = session.node(NodeId(5)).await.unwrap().expect("node 5 known");

    // node database replay with a last_heard from years ago
    assert!(mock.inject(radio::node_db_entry(NodeId(5), "Five", 1_600_000_000)));
    settle().await;
    let after = session.node(NodeId(5)).await.unwrap().expect("node 5 known");
    assert_eq!(after.last_seen, first.last_seen);
    assert_eq!(
        after.first_seen,
        Utc.timestamp_opt(1_600_000_000, 0).unwrap()
    );
    assert_eq!(after.display_name.as_deref(), Some("Five"));
    assert_eq!(after.short_name.as_deref(), Some("N5"));

    assert!(mock.inject(radio::node_info(NodeId(5), "Five", "N5")));
    settle().await;
    let latest = session.node(NodeId(5)).await.unwrap().expect("node 5 known");
    assert!(latest.last_seen >= after.last_seen);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn own_radio_is_not_listed() {
    let local = NodeId(0x0000_0001);
    let neighbour = NodeId(0x0000_0002);
    let mock = MockTransport::echo_radio(local, neighbour);
    let (session, mut events) = start(&mock);

    let (ev, _) = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::NodeDiscovered(_))
    })
    .await;
    match ev {
        SessionEvent::NodeDiscovered(rec) => {
            assert_eq!(rec.id, neighbour);
            assert_eq!(rec.label(), "Mock Neighbour");
        }
        other => panic!("unexpected {:?}", other),
    }
    // our own node's packets are never recorded
    assert!(mock.inject(radio::node_info(local, "Me", "ME")));
    settle().await;
    assert!(session.node(local).await.unwrap().is_none());
    assert!(!discoveries(&drain(&mut events)).contains_key(&local));
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn persisted_nodes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.json");
    let store = Arc::new(JsonNodeStore::new(&path));

    let mock = MockTransport::new();
    let (session, mut events) = start_with(session_config(), &mock, store.clone());
    wait_state(&mut events, ConnectionState::Connected).await;
    assert!(mock.inject(radio::node_info(NodeId(7), "Seven", "SVN")));
    wait_for(&mut events, |e| matches!(e, SessionEvent::NodeDiscovered(_))).await;
    session.shutdown().await.unwrap();

    let saved = JsonNodeStore::new(&path).load().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].label(), "Seven");

    let mock = MockTransport::new();
    let (session, mut events) = start_with(session_config(), &mock, store);
    assert_eq!(session.node_count().await.unwrap(), 1);
    let known = session.node(NodeId(7)).await.unwrap().expect("restored");
    assert_eq!(known.short_name.as_deref(), Some("SVN"));

    wait_state(&mut events, ConnectionState::Connected).await;
    assert!(mock.inject(radio::node_info(NodeId(7), "Seven", "SVN")));
    let (_, skipped) = wait_for(&mut events, |e| matches!(e, SessionEvent::NodeUpdated(_))).await;
    assert!(discoveries(&skipped).is_empty());
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn node_table_is_flushed_periodically() {
    let store = Arc::new(MemoryNodeStore::new());
    let mut config = session_config();
    config.flush_interval = Duration::from_secs(5);

    let mock = MockTransport::new();
    let (session, mut events) = start_with(config, &mock, store.clone());
    wait_state(&mut events, ConnectionState::Connected).await;
    assert_eq!(store.save_count(), 0);

    assert!(mock.inject(radio::node_info(NodeId(9), "Nine", "NIN")));
    wait_until(|| store.save_count() >= 1).await;
    assert_eq!(store.nodes().len(), 1);

    // nothing changed, nothing written
    let writes = store.save_count();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(store.save_count(), writes);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn corrupt_node_table_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.json");
    std::fs::write(&path, "{ not json").unwrap();

    let mock = MockTransport::new();
    let (session, mut events) =
        start_with(session_config(), &mock, Arc::new(JsonNodeStore::new(&path)));
    wait_state(&mut events, ConnectionState::Connected).await;
    assert_eq!(session.node_count().await.unwrap(), 0);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_table_write_is_retried_on_next_flush() {
    let store = Arc::new(FlakyStore::failing(1));
    let mut config = session_config();
    config.flush_interval = Duration::from_secs(5);

    let mock = MockTransport::new();
    let (session, mut events) = start_with(config, &mock, store.clone());
    wait_state(&mut events, ConnectionState::Connected).await;
    assert!(mock.inject(radio::node_info(NodeId(9), "Nine", "NIN")));

    wait_until(|| store.inner.save_count() == 1).await;
    assert_eq!(store.attempts(), 2);
    assert_eq!(store.inner.nodes().len(), 1);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_table_write_is_retried_at_shutdown() {
    let store = Arc::new(FlakyStore::failing(1));
    let mut config = session_config();
    config.flush_interval = Duration::from_secs(5);

    let mock = MockTransport::new();
    let (session, mut events) = start_with(config, &mock, store.clone());
    wait_state(&mut events, ConnectionState::Connected).await;
    assert!(mock.inject(radio::node_info(NodeId(9), "Nine", "NIN")));

    wait_until(|| store.attempts() == 1).await;
    assert_eq!(store.inner.save_count(), 0);
    session.shutdown().await.unwrap();
    assert_eq!(store.attempts(), 2);
    assert_eq!(store.inner.nodes()[0].id, NodeId(9));
}
