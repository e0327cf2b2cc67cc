use crate::delivery::FailureReason;
use crate::meshtastic::{DeviceTelemetry, Destination, MessageId, NodeId, SignalQuality};
use crate::registry::NodeRecord;
use crate::supervisor::ConnectionState;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

/// Text message heard on the mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub from: NodeId,
    /// Sender's name as known when the message arrived.
    pub from_name: Option<String>,
    pub to: Destination,
    pub channel: u32,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub signal: Option<SignalQuality>,
}

impl ReceivedMessage {
    /// Addressed to us rather than broadcast.
    pub fn is_direct(&self) -> bool {
        !self.to.is_broadcast()
    }
}

/// Everything a session reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    /// A link is back after a loss (or the radio rebooted); the session has re-requested the
    /// radio's state.
    ConnectionRestored,
    MessageReceived(ReceivedMessage),
    NodeDiscovered(NodeRecord),
    NodeUpdated(NodeRecord),
    DeliveryConfirmed {
        message_id: MessageId,
        attempts: u32,
        latency: Duration,
    },
    DeliveryFailed {
        message_id: MessageId,
        attempts: u32,
        reason: FailureReason,
    },
    DeliveryCancelled {
        message_id: MessageId,
    },
    DeviceTelemetry(DeviceTelemetry),
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Per-message overrides for [`SessionHandle::send_message_with`](super::SessionHandle::send_message_with).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub channel: Option<u32>,
    pub max_attempts: Option<u32>,
    pub retry_interval: Option<Duration>,
}
