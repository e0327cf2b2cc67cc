//! # Acknowledgment Tracker
//!
//! Owns every outbound message from registration until it reaches a terminal state and
//! decides when frames go out. The tracker never touches the transport or the clock itself:
//! every call takes `now`, and the frames to write are returned as [`TrackerAction`]s for the
//! caller to hand to the link.
//!
//! ```text
//! Pending ──(first send)──▶ AwaitingAck ──(ack)──────────────▶ Acked
//!                            │  ▲
//!                            │  └─(interval elapsed, attempts left: resend same id)
//!                            ├─(interval elapsed, no attempts left)─▶ Expired
//!                            └─(permanent routing error)─────────▶ Rejected
//! Pending | AwaitingAck ──(cancel)──▶ Cancelled
//! ```
//!
//! While the link is down nothing is transmitted: `Pending` entries wait, due resends are
//! held and go out on the first tick after the link is back, with attempt counts intact.
//! An entry whose final interval runs out still expires on schedule.
//!
//! Terminal entries move to a bounded history so a late duplicate ack is recognised and
//! dropped, and [`AckTracker::status`] can still answer for recently finished messages.

use crate::logutil::preview;
use crate::meshtastic::{self, Destination, MessageId, MessageIdGenerator, NodeId, RoutingError};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Why a message was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Every attempt went unacknowledged.
    Expired,
    /// The mesh reported an error that a resend cannot fix.
    Rejected(RoutingError),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Expired => f.write_str("no acknowledgment"),
            FailureReason::Rejected(e) => write!(f, "rejected ({:?})", e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    AwaitingAck,
    Acked,
    Failed(FailureReason),
    Cancelled,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryState::Pending | DeliveryState::AwaitingAck)
    }
}

/// Point-in-time view of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStatus {
    pub id: MessageId,
    pub destination: Destination,
    pub state: DeliveryState,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Per-message retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub default_policy: RetryPolicy,
    pub history_limit: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_policy: RetryPolicy {
                max_attempts: 5,
                retry_interval: Duration::from_secs(10),
            },
            history_limit: 256,
        }
    }
}

/// Something the caller must do or report.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerAction {
    /// Write `frame` to the link. `attempt` is 1 for the first transmission.
    Transmit {
        id: MessageId,
        attempt: u32,
        frame: Vec<u8>,
    },
    Confirmed {
        id: MessageId,
        attempts: u32,
        latency: Duration,
    },
    Failed {
        id: MessageId,
        attempts: u32,
        reason: FailureReason,
    },
    Cancelled {
        id: MessageId,
    },
}

#[derive(Debug)]
struct OutboundMessage {
    id: MessageId,
    destination: Destination,
    preview: String,
    frame: Vec<u8>,
    policy: RetryPolicy,
    state: DeliveryState,
    attempts: u32,
    first_sent: Option<Instant>,
    last_sent: Option<Instant>,
}

impl OutboundMessage {
    fn status(&self) -> MessageStatus {
        MessageStatus {
            id: self.id,
            destination: self.destination,
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.policy.max_attempts,
        }
    }

    fn transmit(&mut self, now: Instant) -> TrackerAction {
        self.attempts += 1;
        self.state = DeliveryState::AwaitingAck;
        self.last_sent = Some(now);
        if self.first_sent.is_none() {
            self.first_sent = Some(now);
        }
        TrackerAction::Transmit {
            id: self.id,
            attempt: self.attempts,
            frame: self.frame.clone(),
        }
    }
}

#[derive(Debug)]
pub struct AckTracker {
    config: TrackerConfig,
    ids: MessageIdGenerator,
    /// Live entries in registration order.
    live: Vec<OutboundMessage>,
    history: HashMap<MessageId, MessageStatus>,
    history_order: VecDeque<MessageId>,
}

impl AckTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_ids(config, MessageIdGenerator::new())
    }

    pub fn with_ids(config: TrackerConfig, ids: MessageIdGenerator) -> Self {
        Self {
            config,
            ids,
            live: Vec::new(),
            history: HashMap::new(),
            history_order: VecDeque::new(),
        }
    }

    pub fn default_policy(&self) -> RetryPolicy {
        self.config.default_policy
    }

    /// Take ownership of a new message. When the link is up the first transmission is
    /// returned right away; otherwise the message waits as `Pending`.
    pub fn register(
        &mut self,
        destination: Destination,
        channel: u32,
        text: &str,
        policy: Option<RetryPolicy>,
        now: Instant,
        link_up: bool,
    ) -> (MessageId, Option<TrackerAction>) {
        let mut policy = policy.unwrap_or(self.config.default_policy);
        policy.max_attempts = policy.max_attempts.max(1);
        let id = self.ids.next_id();
        let mut msg = OutboundMessage {
            id,
            destination,
            preview: preview(text, 40),
            frame: meshtastic::encode_text(id, destination, channel, text),
            policy,
            state: DeliveryState::Pending,
            attempts: 0,
            first_sent: None,
            last_sent: None,
        };
        let action = link_up.then(|| msg.transmit(now));
        debug!(
            "registered id={} to={} attempts<={} interval={:?} '{}'{}",
            id,
            destination,
            policy.max_attempts,
            policy.retry_interval,
            msg.preview,
            if link_up { "" } else { " (link down, pending)" }
        );
        self.live.push(msg);
        (id, action)
    }

    /// Advance retry timers.
    pub fn tick(&mut self, now: Instant, link_up: bool) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        let mut finished = Vec::new();
        for (idx, msg) in self.live.iter_mut().enumerate() {
            match msg.state {
                DeliveryState::Pending => {
                    if link_up {
                        actions.push(msg.transmit(now));
                    }
                }
                DeliveryState::AwaitingAck => {
                    let due = msg
                        .last_sent
                        .map(|t| now.saturating_duration_since(t) >= msg.policy.retry_interval)
                        .unwrap_or(true);
                    if !due {
                        continue;
                    }
                    if msg.attempts >= msg.policy.max_attempts {
                        msg.state = DeliveryState::Failed(FailureReason::Expired);
                        warn!(
                            "id={} to={} expired after {} attempts ('{}')",
                            msg.id, msg.destination, msg.attempts, msg.preview
                        );
                        actions.push(TrackerAction::Failed {
                            id: msg.id,
                            attempts: msg.attempts,
                            reason: FailureReason::Expired,
                        });
                        finished.push(idx);
                    } else if link_up {
                        let action = msg.transmit(now);
                        debug!(
                            "resend id={} to={} attempt {}/{}",
                            msg.id, msg.destination, msg.attempts, msg.policy.max_attempts
                        );
                        actions.push(action);
                    }
                }
                _ => {}
            }
        }
        self.retire(finished);
        actions
    }

    /// Ack carrying our packet id. Returns the confirmation, or `None` when the id is unknown,
    /// already terminal or not yet sent.
    pub fn on_ack(&mut self, id: MessageId, now: Instant) -> Option<TrackerAction> {
        let Some(idx) = self.live.iter().position(|m| m.id == id) else {
            if self.history.contains_key(&id) {
                debug!("duplicate ack for id={} ignored", id);
            } else {
                debug!("ack for unknown id={}", id);
            }
            return None;
        };
        self.confirm(idx, now)
    }

    /// Ack without a packet id from `from`: the oldest message awaiting an ack from that node
    /// takes it.
    pub fn on_uncorrelated_ack(&mut self, from: NodeId, now: Instant) -> Option<TrackerAction> {
        let idx = self.live.iter().position(|m| {
            m.state == DeliveryState::AwaitingAck && m.destination == Destination::Node(from)
        })?;
        self.confirm(idx, now)
    }

    fn confirm(&mut self, idx: usize, now: Instant) -> Option<TrackerAction> {
        let msg = &mut self.live[idx];
        if msg.state != DeliveryState::AwaitingAck {
            return None;
        }
        msg.state = DeliveryState::Acked;
        let latency = msg
            .first_sent
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        info!(
            "delivered id={} to={} attempts={} latency_ms={} ('{}')",
            msg.id,
            msg.destination,
            msg.attempts,
            latency.as_millis(),
            msg.preview
        );
        let action = TrackerAction::Confirmed {
            id: msg.id,
            attempts: msg.attempts,
            latency,
        };
        self.retire(vec![idx]);
        Some(action)
    }

    /// Routing error reported for one of our packets.
    pub fn on_nak(
        &mut self,
        id: MessageId,
        reason: RoutingError,
        now: Instant,
    ) -> Option<TrackerAction> {
        let idx = self.live.iter().position(|m| m.id == id)?;
        let msg = &mut self.live[idx];
        if msg.state != DeliveryState::AwaitingAck {
            return None;
        }
        if reason.is_transient() {
            // give the mesh a full interval before the next try
            msg.last_sent = Some(now);
            warn!(
                "transient routing error {:?} for id={} to={}; retrying ({}/{})",
                reason, msg.id, msg.destination, msg.attempts, msg.policy.max_attempts
            );
            return None;
        }
        let failure = FailureReason::Rejected(reason);
        msg.state = DeliveryState::Failed(failure);
        warn!(
            "id={} to={} failed: {:?} ('{}')",
            msg.id, msg.destination, reason, msg.preview
        );
        let action = TrackerAction::Failed {
            id: msg.id,
            attempts: msg.attempts,
            reason: failure,
        };
        self.retire(vec![idx]);
        Some(action)
    }

    /// Best effort: a frame already written may still be delivered by the mesh.
    pub fn cancel(&mut self, id: MessageId) -> Option<TrackerAction> {
        let idx = self.live.iter().position(|m| m.id == id)?;
        self.live[idx].state = DeliveryState::Cancelled;
        debug!("cancelled id={}", id);
        self.retire(vec![idx]);
        Some(TrackerAction::Cancelled { id })
    }

    /// Cancel every live entry, oldest first.
    pub fn cancel_all(&mut self) -> Vec<TrackerAction> {
        let ids: Vec<MessageId> = self.live.iter().map(|m| m.id).collect();
        ids.into_iter().filter_map(|id| self.cancel(id)).collect()
    }

    pub fn status(&self, id: MessageId) -> Option<MessageStatus> {
        self.live
            .iter()
            .find(|m| m.id == id)
            .map(OutboundMessage::status)
            .or_else(|| self.history.get(&id).cloned())
    }

    /// Messages not yet terminal, in registration order.
    pub fn in_flight(&self) -> Vec<MessageStatus> {
        self.live.iter().map(OutboundMessage::status).collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.live.len()
    }

    /// Move entries at `indices` (any order) from live to history.
    fn retire(&mut self, mut indices: Vec<usize>) {
        indices.sort_unstable();
        for idx in indices.into_iter().rev() {
            let msg = self.live.remove(idx);
            self.history.insert(msg.id, msg.status());
            self.history_order.push_back(msg.id);
        }
        while self.history_order.len() > self.config.history_limit {
            if let Some(old) = self.history_order.pop_front() {
                self.history.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn tracker(max_attempts: u32, interval_secs: u64) -> AckTracker {
        AckTracker::with_ids(
            TrackerConfig {
                default_policy: RetryPolicy {
                    max_attempts,
                    retry_interval: Duration::from_secs(interval_secs),
                },
                history_limit: 8,
            },
            MessageIdGenerator::starting_at(100),
        )
    }

    fn transmits(actions: &[TrackerAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, TrackerAction::Transmit { .. }))
            .count()
    }

    /// Drive one-second ticks from `start` for `secs` seconds, collecting every action.
    fn run(t: &mut AckTracker, start: Instant, secs: u64, link_up: bool) -> Vec<TrackerAction> {
        (1..=secs)
            .flat_map(|s| t.tick(start + SECOND * s as u32, link_up))
            .collect()
    }

    #[test]
    fn unacked_message_expires_after_max_attempts() {
        let mut t = tracker(3, 10);
        let t0 = Instant::now();
        let (id, first) = t.register(Destination::Broadcast, 0, "hello", None, t0, true);
        assert!(matches!(first, Some(TrackerAction::Transmit { attempt: 1, .. })));

        let actions = run(&mut t, t0, 40, true);
        assert_eq!(transmits(&actions), 2, "two resends after the first send");
        let failed: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, TrackerAction::Failed { .. }))
            .collect();
        assert_eq!(
            failed,
            vec![&TrackerAction::Failed {
                id,
                attempts: 3,
                reason: FailureReason::Expired
            }]
        );
        assert_eq!(
            t.status(id).unwrap().state,
            DeliveryState::Failed(FailureReason::Expired)
        );
    }

    #[test]
    fn expiry_happens_at_attempts_times_interval() {
        let mut t = tracker(3, 10);
        let t0 = Instant::now();
        let (id, _) = t.register(Destination::Broadcast, 0, "x", None, t0, true);
        assert!(run(&mut t, t0, 29, true)
            .iter()
            .all(|a| !matches!(a, TrackerAction::Failed { .. })));
        let at_30 = t.tick(t0 + SECOND * 30, true);
        assert!(matches!(&at_30[..], [TrackerAction::Failed { id: f, .. }] if *f == id));
    }

    #[test]
    fn ack_after_first_attempt_stops_retries() {
        let mut t = tracker(3, 10);
        let t0 = Instant::now();
        let (id, _) = t.register(Destination::Node(NodeId(42)), 0, "hi", None, t0, true);
        let confirmed = t.on_ack(id, t0 + SECOND * 4).unwrap();
        assert_eq!(
            confirmed,
            TrackerAction::Confirmed {
                id,
                attempts: 1,
                latency: SECOND * 4
            }
        );
        assert!(run(&mut t, t0, 60, true).is_empty());
        assert_eq!(t.status(id).unwrap().state, DeliveryState::Acked);
    }

    #[test]
    fn duplicate_ack_is_ignored() {
        let mut t = tracker(3, 10);
        let t0 = Instant::now();
        let (id, _) = t.register(Destination::Broadcast, 0, "hi", None, t0, true);
        assert!(t.on_ack(id, t0).is_some());
        assert!(t.on_ack(id, t0 + SECOND).is_none());
        assert!(t.on_ack(MessageId(9999), t0).is_none());
    }

    #[test]
    fn link_down_holds_sends_and_keeps_counts() {
        let mut t = tracker(3, 10);
        let t0 = Instant::now();
        let (a, _) = t.register(Destination::Broadcast, 0, "a", None, t0, true);
        let (b, none) = t.register(Destination::Broadcast, 0, "b", None, t0, false);
        assert!(none.is_none());
        assert_eq!(t.status(b).unwrap().state, DeliveryState::Pending);

        // link down for 15s: the resend of `a` due at 10s is held
        assert_eq!(transmits(&run(&mut t, t0, 15, false)), 0);
        assert_eq!(t.status(a).unwrap().attempts, 1);

        let back = t.tick(t0 + SECOND * 16, true);
        assert_eq!(
            back.iter()
                .filter_map(|a| match a {
                    TrackerAction::Transmit { id, attempt, .. } => Some((*id, *attempt)),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            vec![(a, 2), (b, 1)]
        );
    }

    #[test]
    fn final_interval_expires_even_while_link_down() {
        let mut t = tracker(1, 10);
        let t0 = Instant::now();
        let (id, _) = t.register(Destination::Broadcast, 0, "a", None, t0, true);
        let actions = run(&mut t, t0, 10, false);
        assert!(matches!(&actions[..], [TrackerAction::Failed { id: f, attempts: 1, .. }] if *f == id));
    }

    #[test]
    fn frames_never_exceed_max_attempts() {
        let mut t = tracker(4, 2);
        let t0 = Instant::now();
        let (_, first) = t.register(Destination::Broadcast, 0, "a", None, t0, true);
        let mut sent = usize::from(first.is_some());
        // flap the link every few seconds
        for s in 1..=60u32 {
            sent += transmits(&t.tick(t0 + SECOND * s, s % 3 != 0));
        }
        assert!(sent <= 4);
        assert_eq!(t.in_flight_count(), 0);
    }

    #[test]
    fn resend_is_verbatim() {
        let mut t = tracker(2, 5);
        let t0 = Instant::now();
        let (_, first) = t.register(Destination::Broadcast, 1, "same", None, t0, true);
        let resend = t.tick(t0 + SECOND * 5, true);
        match (first, &resend[..]) {
            (
                Some(TrackerAction::Transmit { frame: f1, .. }),
                [TrackerAction::Transmit { frame: f2, .. }],
            ) => assert_eq!(&f1, f2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn permanent_nak_rejects_transient_nak_retries() {
        let mut t = tracker(3, 10);
        let t0 = Instant::now();
        let (a, _) = t.register(Destination::Node(NodeId(1)), 0, "a", None, t0, true);
        let (b, _) = t.register(Destination::Node(NodeId(1)), 0, "b", None, t0, true);

        assert!(t.on_nak(a, RoutingError::MaxRetransmit, t0 + SECOND * 8).is_none());
        // the nak pushed the next retry of `a` to 18s
        let at_10 = t.tick(t0 + SECOND * 10, true);
        assert!(at_10
            .iter()
            .all(|x| !matches!(x, TrackerAction::Transmit { id, .. } if *id == a)));

        let failed = t.on_nak(b, RoutingError::TooLarge, t0 + SECOND * 11).unwrap();
        assert_eq!(
            failed,
            TrackerAction::Failed {
                id: b,
                attempts: 2,
                reason: FailureReason::Rejected(RoutingError::TooLarge)
            }
        );
    }

    #[test]
    fn uncorrelated_ack_goes_to_oldest_for_destination() {
        let mut t = tracker(3, 10);
        let t0 = Instant::now();
        let (_, _) = t.register(Destination::Node(NodeId(2)), 0, "other", None, t0, true);
        let (first, _) = t.register(Destination::Node(NodeId(1)), 0, "1", None, t0, true);
        let (second, _) = t.register(Destination::Node(NodeId(1)), 0, "2", None, t0, true);
        let hit = t.on_uncorrelated_ack(NodeId(1), t0 + SECOND).unwrap();
        assert!(matches!(hit, TrackerAction::Confirmed { id, .. } if id == first));
        assert_eq!(t.status(second).unwrap().state, DeliveryState::AwaitingAck);
        assert!(t.on_uncorrelated_ack(NodeId(3), t0).is_none());
    }

    #[test]
    fn cancel_is_terminal() {
        let mut t = tracker(3, 10);
        let t0 = Instant::now();
        let (id, _) = t.register(Destination::Broadcast, 0, "x", None, t0, false);
        assert_eq!(t.cancel(id), Some(TrackerAction::Cancelled { id }));
        assert!(t.cancel(id).is_none());
        assert!(t.tick(t0 + SECOND, true).is_empty());
        assert_eq!(t.status(id).unwrap().state, DeliveryState::Cancelled);
    }

    #[test]
    fn cancel_all_finishes_only_live_entries() {
        let mut t = tracker(3, 10);
        let t0 = Instant::now();
        let (a, _) = t.register(Destination::Broadcast, 0, "a", None, t0, true);
        let (b, _) = t.register(Destination::Node(NodeId(9)), 0, "b", None, t0, true);
        let (c, _) = t.register(Destination::Broadcast, 0, "c", None, t0, true);
        t.on_ack(b, t0);
        assert_eq!(
            t.cancel_all(),
            vec![
                TrackerAction::Cancelled { id: a },
                TrackerAction::Cancelled { id: c }
            ]
        );
        assert_eq!(t.in_flight_count(), 0);
        assert!(t.cancel_all().is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let mut t = tracker(1, 1);
        let t0 = Instant::now();
        let ids: Vec<MessageId> = (0..12)
            .map(|_| t.register(Destination::Broadcast, 0, "x", None, t0, true).0)
            .collect();
        for id in &ids {
            t.on_ack(*id, t0);
        }
        assert!(t.status(ids[0]).is_none());
        assert_eq!(t.status(ids[11]).unwrap().state, DeliveryState::Acked);
    }

    #[test]
    fn ids_are_unique() {
        let mut t = tracker(1, 1);
        let t0 = Instant::now();
        let a = t.register(Destination::Broadcast, 0, "x", None, t0, false).0;
        let b = t.register(Destination::Broadcast, 0, "x", None, t0, false).0;
        assert_ne!(a, b);
    }
}
