mod common;

use common::*;
use meshsession::meshtastic::{radio, Destination, NodeId};
use meshsession::session::SessionEvent;
use meshsession::supervisor::ConnectionState;
use meshsession::transport::MockTransport;

const ME: NodeId = NodeId(0x0000_0001);
const ALICE: NodeId = NodeId(0x0000_0a11);

fn texts(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::MessageReceived(m) => Some(m.text.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn only_broadcasts_and_our_dms_are_delivered() {
    let mock = MockTransport::new();
    let (session, mut events) = start(&mock);
    wait_state(&mut events, ConnectionState::Connected).await;

    assert!(mock.inject(radio::my_info(ME)));
    assert!(mock.inject(radio::text(ALICE, None, "hello everyone")));
    assert!(mock.inject(radio::text(ALICE, Some(NodeId(3)), "psst, node 3")));
    assert!(mock.inject(radio::text(ALICE, Some(ME), "hi you")));
    // our own transmission echoed back by the radio
    assert!(mock.inject(radio::text(ME, None, "echo")));
    settle().await;

    let seen = drain(&mut events);
    assert_eq!(texts(&seen), vec!["hello everyone", "hi you"]);
    let dm = seen
        .iter()
        .find_map(|e| match e {
            SessionEvent::MessageReceived(m) if m.is_direct() => Some(m.clone()),
            _ => None,
        })
        .expect("direct message");
    assert_eq!(dm.from, ALICE);
    assert_eq!(dm.to, Destination::Node(ME));
    assert!(dm.signal.is_some());
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn undecodable_frames_are_dropped_without_disrupting_the_session() {
    let mock = MockTransport::new();
    let (session, mut events) = start(&mock);
    wait_state(&mut events, ConnectionState::Connected).await;

    assert!(mock.inject(Vec::new()));
    assert!(mock.inject(vec![0xff, 0xff, 0xff]));
    assert!(mock.inject(radio::text(ALICE, None, "still here")));
    settle().await;

    assert_eq!(texts(&drain(&mut events)), vec!["still here"]);
    let m = session.metrics();
    assert_eq!(m.frames_in, 3);
    assert_eq!(m.frames_dropped, 2);
    assert_eq!(session.connection_state(), ConnectionState::Connected);
    session.shutdown().await.unwrap();
}
