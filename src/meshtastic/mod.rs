//! # Meshtastic Radio Codec
//!
//! Turns the opaque frames carried by a [`Transport`](crate::transport::Transport) into typed
//! [`InboundEvent`]s, and builds the outbound frames the session writes (text packets,
//! heartbeats, config requests).
//!
//! ## Wire format
//!
//! Frames are protobuf `FromRadio` / `ToRadio` messages (see [`wire`]). On a serial link they
//! are additionally wrapped by the `0x94 0xC3` stream header implemented in [`framer`]; that
//! wrapping belongs to the transport, so everything in this module works on bare payloads.
//!
//! ## Decoding rules
//!
//! | Source                          | Events                                   |
//! |---------------------------------|------------------------------------------|
//! | `TEXT_MESSAGE_APP` packet       | `TextMessage` (sender sighting embedded) |
//! | `ROUTING_APP` with `request_id` | `NodeSeen` + `Ack` / `Nak`               |
//! | `NODEINFO_APP` packet           | `NodeSeen` with names                    |
//! | `TELEMETRY_APP` device metrics  | `NodeSeen` + `DeviceTelemetry`           |
//! | other / encrypted packet        | `NodeSeen`                               |
//! | node database entry             | `NodeSeen`                               |
//! | my-info                         | `MyInfo`                                 |
//! | config complete / rebooted      | `LinkStatus`                             |
//!
//! ```rust
//! use meshsession::meshtastic::{self, Destination, MessageId, NodeId};
//!
//! let frame = meshtastic::encode_text(MessageId(7), Destination::Node(NodeId(42)), 0, "hi");
//! assert!(!frame.is_empty());
//! ```

pub mod framer;
pub mod wire;

use crate::error::DecodeError;
use crate::logutil::hex_snippet;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, trace};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use wire::RoutingError;

/// Node number reserved for "everyone".
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

/// Hop limit written on outbound packets (firmware default).
pub const DEFAULT_HOP_LIMIT: u32 = 3;

/// Stable 32-bit identifier of a mesh participant, displayed as `!xxxxxxxx`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    /// Accepts `!9e9f4220`, `0x9e9f4220` or a plain decimal node number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = if let Some(hex) = s.strip_prefix('!') {
            u32::from_str_radix(hex, 16)
        } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else {
            s.parse::<u32>()
        };
        match parsed {
            Ok(BROADCAST_NUM) => Err(format!("'{}' is the broadcast address", s)),
            Ok(n) => Ok(NodeId(n)),
            Err(e) => Err(format!("invalid node id '{}': {}", s, e)),
        }
    }
}

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Broadcast,
    Node(NodeId),
}

impl Destination {
    pub fn to_wire(self) -> u32 {
        match self {
            Destination::Broadcast => BROADCAST_NUM,
            Destination::Node(id) => id.0,
        }
    }

    pub fn from_wire(num: u32) -> Self {
        if num == BROADCAST_NUM {
            Destination::Broadcast
        } else {
            Destination::Node(NodeId(num))
        }
    }

    pub fn is_broadcast(self) -> bool {
        matches!(self, Destination::Broadcast)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => f.write_str("broadcast"),
            Destination::Node(id) => id.fmt(f),
        }
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broadcast" | "^all" | "all" | "!ffffffff" => Ok(Destination::Broadcast),
            _ => s.parse::<NodeId>().map(Destination::Node),
        }
    }
}

/// Correlation id of an outbound packet; the radio echoes it back as `request_id` in acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Hands out packet ids: random non-zero start, then strictly increasing so an id is never
/// reused within a session.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: u32,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    pub fn starting_at(seed: u32) -> Self {
        Self { next: seed.max(1) }
    }

    pub fn next_id(&mut self) -> MessageId {
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        MessageId(id)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Link quality of the last packet heard from a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalQuality {
    pub snr: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
}

/// One observation of a node, as extracted from a single frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeSighting {
    pub id: NodeId,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub signal: Option<SignalQuality>,
    pub hops_away: Option<u32>,
    /// When the radio says it last heard the node; `None` means "now".
    pub heard_at: Option<DateTime<Utc>>,
}

impl NodeSighting {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Battery and airtime figures reported by a node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceTelemetry {
    pub node: NodeId,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

/// Radio-to-host link notifications, consumed by the connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// The radio finished replaying its state for a config request.
    ConfigComplete { request_id: u32 },
    /// The radio restarted; its node database and our config request are gone.
    Rebooted,
}

/// Typed event decoded from an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    TextMessage {
        sender: NodeSighting,
        to: Destination,
        channel: u32,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Ack {
        message_id: MessageId,
        from: NodeId,
    },
    /// Routing OK without a correlation id; matched by destination.
    UncorrelatedAck {
        from: NodeId,
    },
    Nak {
        message_id: MessageId,
        from: NodeId,
        reason: RoutingError,
    },
    NodeSeen(NodeSighting),
    MyInfo {
        node: NodeId,
    },
    DeviceTelemetry(DeviceTelemetry),
    LinkStatus(LinkStatus),
}

fn wire_time(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs as i64, 0).single()
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn sighting_from_packet(pkt: &wire::MeshPacket) -> NodeSighting {
    // rx_snr/rx_rssi are zero for packets generated by the local radio itself
    let signal = if pkt.rx_snr != 0.0 || pkt.rx_rssi != 0 {
        Some(SignalQuality {
            snr: pkt.rx_snr,
            rssi: (pkt.rx_rssi != 0).then_some(pkt.rx_rssi),
        })
    } else {
        None
    };
    let hops_away = (pkt.hop_start != 0 && pkt.hop_start >= pkt.hop_limit)
        .then(|| pkt.hop_start - pkt.hop_limit);
    NodeSighting {
        id: NodeId(pkt.from),
        signal,
        hops_away,
        heard_at: wire_time(pkt.rx_time),
        ..Default::default()
    }
}

/// Decode one `FromRadio` payload into zero or more events.
///
/// Packet types the session does not care about still yield a `NodeSeen` for the sender so
/// that last-seen times stay current.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<InboundEvent>, DecodeError> {
    use wire::from_radio::PayloadVariant as FR;
    use wire::mesh_packet::PayloadVariant as MP;

    if frame.is_empty() {
        return Err(DecodeError::Empty);
    }
    let msg = wire::FromRadio::decode(frame)?;
    let mut events = Vec::new();
    match msg.payload_variant {
        Some(FR::Packet(pkt)) => {
            let sighting = sighting_from_packet(&pkt);
            match &pkt.payload_variant {
                Some(MP::Decoded(data)) => decode_data(&pkt, data, sighting, &mut events)?,
                Some(MP::Encrypted(bytes)) => {
                    trace!(
                        "encrypted packet from {} ({} bytes) {}",
                        NodeId(pkt.from),
                        bytes.len(),
                        hex_snippet(bytes, 16)
                    );
                    events.push(InboundEvent::NodeSeen(sighting));
                }
                None => events.push(InboundEvent::NodeSeen(sighting)),
            }
        }
        Some(FR::MyInfo(info)) => {
            events.push(InboundEvent::MyInfo {
                node: NodeId(info.my_node_num),
            });
        }
        Some(FR::NodeInfo(info)) => {
            let user = info.user.unwrap_or_default();
            events.push(InboundEvent::NodeSeen(NodeSighting {
                id: NodeId(info.num),
                long_name: non_empty(&user.long_name),
                short_name: non_empty(&user.short_name),
                signal: (info.snr != 0.0).then_some(SignalQuality {
                    snr: info.snr,
                    rssi: None,
                }),
                hops_away: info.hops_away,
                heard_at: wire_time(info.last_heard),
            }));
        }
        Some(FR::ConfigCompleteId(id)) => {
            events.push(InboundEvent::LinkStatus(LinkStatus::ConfigComplete {
                request_id: id,
            }));
        }
        Some(FR::Rebooted(_)) => events.push(InboundEvent::LinkStatus(LinkStatus::Rebooted)),
        None => trace!("FromRadio id={} with unhandled payload", msg.id),
    }
    Ok(events)
}

fn decode_data(
    pkt: &wire::MeshPacket,
    data: &wire::Data,
    mut sighting: NodeSighting,
    events: &mut Vec<InboundEvent>,
) -> Result<(), DecodeError> {
    use wire::PortNum;

    let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
    match port {
        PortNum::TextMessageApp => {
            let text = String::from_utf8_lossy(&data.payload).into_owned();
            let timestamp = sighting.heard_at.unwrap_or_else(Utc::now);
            events.push(InboundEvent::TextMessage {
                sender: sighting,
                to: Destination::from_wire(pkt.to),
                channel: pkt.channel,
                text,
                timestamp,
            });
        }
        PortNum::RoutingApp => {
            let routing = wire::Routing::decode(data.payload.as_slice())?;
            let from = sighting.id;
            events.push(InboundEvent::NodeSeen(sighting));
            let reason = match routing.variant {
                Some(wire::routing::Variant::ErrorReason(code)) => {
                    RoutingError::try_from(code).unwrap_or(RoutingError::GotNak)
                }
                None => RoutingError::None,
            };
            let corr = if data.request_id != 0 {
                data.request_id
            } else {
                data.reply_id
            };
            match (corr, reason) {
                (0, RoutingError::None) => events.push(InboundEvent::UncorrelatedAck { from }),
                (0, other) => debug!("routing error {:?} from {} without id", other, from),
                (id, RoutingError::None) => events.push(InboundEvent::Ack {
                    message_id: MessageId(id),
                    from,
                }),
                (id, reason) => events.push(InboundEvent::Nak {
                    message_id: MessageId(id),
                    from,
                    reason,
                }),
            }
        }
        PortNum::NodeinfoApp => {
            let user = wire::User::decode(data.payload.as_slice())?;
            sighting.long_name = non_empty(&user.long_name);
            sighting.short_name = non_empty(&user.short_name);
            events.push(InboundEvent::NodeSeen(sighting));
        }
        PortNum::TelemetryApp => {
            let node = sighting.id;
            events.push(InboundEvent::NodeSeen(sighting));
            let telemetry = wire::Telemetry::decode(data.payload.as_slice())?;
            if let Some(wire::telemetry::Variant::DeviceMetrics(dm)) = telemetry.variant {
                events.push(InboundEvent::DeviceTelemetry(DeviceTelemetry {
                    node,
                    battery_level: dm.battery_level,
                    voltage: dm.voltage,
                    channel_utilization: dm.channel_utilization,
                    air_util_tx: dm.air_util_tx,
                    uptime_seconds: dm.uptime_seconds,
                }));
            }
        }
        other => {
            trace!(
                "packet from {} port={:?} len={}",
                sighting.id,
                other,
                data.payload.len()
            );
            events.push(InboundEvent::NodeSeen(sighting));
        }
    }
    Ok(())
}

fn encode_to_radio(variant: wire::to_radio::PayloadVariant) -> Vec<u8> {
    wire::ToRadio {
        payload_variant: Some(variant),
    }
    .encode_to_vec()
}

/// Build a reliable text packet. `want_ack` is always set, for broadcasts too: the radio then
/// reports an implicit ack once it hears a neighbour rebroadcast the packet.
pub fn encode_text(id: MessageId, to: Destination, channel: u32, text: &str) -> Vec<u8> {
    let pkt = wire::MeshPacket {
        to: to.to_wire(),
        channel,
        payload_variant: Some(wire::mesh_packet::PayloadVariant::Decoded(wire::Data {
            portnum: wire::PortNum::TextMessageApp as i32,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        })),
        id: id.0,
        hop_limit: DEFAULT_HOP_LIMIT,
        want_ack: true,
        ..Default::default()
    };
    encode_to_radio(wire::to_radio::PayloadVariant::Packet(pkt))
}

pub fn encode_want_config(request_id: u32) -> Vec<u8> {
    encode_to_radio(wire::to_radio::PayloadVariant::WantConfigId(request_id))
}

pub fn encode_heartbeat(nonce: u32) -> Vec<u8> {
    encode_to_radio(wire::to_radio::PayloadVariant::Heartbeat(wire::Heartbeat {
        nonce,
    }))
}

pub fn encode_disconnect() -> Vec<u8> {
    encode_to_radio(wire::to_radio::PayloadVariant::Disconnect(true))
}

/// Builders for `FromRadio` frames, as a radio would emit them. Used by the mock transport
/// and tests.
pub mod radio {
    use super::wire::{self, from_radio::PayloadVariant as FR, mesh_packet::PayloadVariant as MP};
    use super::{MessageId, NodeId, BROADCAST_NUM};
    use prost::Message;

    fn from_radio(variant: FR) -> Vec<u8> {
        wire::FromRadio {
            id: 0,
            payload_variant: Some(variant),
        }
        .encode_to_vec()
    }

    fn packet(from: NodeId, to: u32, port: wire::PortNum, payload: Vec<u8>) -> wire::MeshPacket {
        wire::MeshPacket {
            from: from.0,
            to,
            payload_variant: Some(MP::Decoded(wire::Data {
                portnum: port as i32,
                payload,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    pub fn text(from: NodeId, to: Option<NodeId>, text: &str) -> Vec<u8> {
        let to = to.map(|n| n.0).unwrap_or(BROADCAST_NUM);
        let mut pkt = packet(from, to, wire::PortNum::TextMessageApp, text.as_bytes().to_vec());
        pkt.rx_snr = 6.25;
        pkt.rx_rssi = -92;
        from_radio(FR::Packet(pkt))
    }

    pub fn routing(from: NodeId, request_id: MessageId, reason: wire::RoutingError) -> Vec<u8> {
        let routing = wire::Routing {
            variant: Some(wire::routing::Variant::ErrorReason(reason as i32)),
        };
        let mut pkt = packet(
            from,
            BROADCAST_NUM,
            wire::PortNum::RoutingApp,
            routing.encode_to_vec(),
        );
        if let Some(MP::Decoded(data)) = pkt.payload_variant.as_mut() {
            data.request_id = request_id.0;
        }
        from_radio(FR::Packet(pkt))
    }

    pub fn ack(from: NodeId, request_id: MessageId) -> Vec<u8> {
        routing(from, request_id, wire::RoutingError::None)
    }

    pub fn node_info(from: NodeId, long_name: &str, short_name: &str) -> Vec<u8> {
        let user = wire::User {
            id: from.to_string(),
            long_name: long_name.to_string(),
            short_name: short_name.to_string(),
        };
        let mut pkt = packet(
            from,
            BROADCAST_NUM,
            wire::PortNum::NodeinfoApp,
            user.encode_to_vec(),
        );
        pkt.rx_snr = -3.5;
        from_radio(FR::Packet(pkt))
    }

    pub fn node_db_entry(num: NodeId, long_name: &str, last_heard: u32) -> Vec<u8> {
        from_radio(FR::NodeInfo(wire::NodeInfo {
            num: num.0,
            user: Some(wire::User {
                id: num.to_string(),
                long_name: long_name.to_string(),
                short_name: String::new(),
            }),
            last_heard,
            ..Default::default()
        }))
    }

    pub fn device_metrics(from: NodeId, battery: u32, voltage: f32) -> Vec<u8> {
        let telemetry = wire::Telemetry {
            time: 0,
            variant: Some(wire::telemetry::Variant::DeviceMetrics(wire::DeviceMetrics {
                battery_level: Some(battery),
                voltage: Some(voltage),
                ..Default::default()
            })),
        };
        from_radio(FR::Packet(packet(
            from,
            BROADCAST_NUM,
            wire::PortNum::TelemetryApp,
            telemetry.encode_to_vec(),
        )))
    }

    pub fn my_info(node: NodeId) -> Vec<u8> {
        from_radio(FR::MyInfo(wire::MyNodeInfo {
            my_node_num: node.0,
        }))
    }

    pub fn config_complete(request_id: u32) -> Vec<u8> {
        from_radio(FR::ConfigCompleteId(request_id))
    }

    pub fn rebooted() -> Vec<u8> {
        from_radio(FR::Rebooted(true))
    }
}

/// Inspect an outbound `ToRadio` frame and return the text packet it carries, if any.
pub fn outbound_text(frame: &[u8]) -> Option<(MessageId, Destination, String)> {
    use wire::mesh_packet::PayloadVariant as MP;
    use wire::to_radio::PayloadVariant as TR;
    let msg = wire::ToRadio::decode(frame).ok()?;
    match msg.payload_variant? {
        TR::Packet(pkt) => match pkt.payload_variant? {
            MP::Decoded(data) if data.portnum == wire::PortNum::TextMessageApp as i32 => Some((
                MessageId(pkt.id),
                Destination::from_wire(pkt.to),
                String::from_utf8_lossy(&data.payload).into_owned(),
            )),
            _ => None,
        },
        _ => None,
    }
}

/// Return the `want_config_id` of an outbound config request frame.
pub fn outbound_want_config(frame: &[u8]) -> Option<u32> {
    match wire::ToRadio::decode(frame).ok()?.payload_variant? {
        wire::to_radio::PayloadVariant::WantConfigId(id) => Some(id),
        _ => None,
    }
}

/// True for a `ToRadio` frame asking the radio to drop the API session.
pub fn outbound_is_disconnect(frame: &[u8]) -> bool {
    matches!(
        wire::ToRadio::decode(frame).ok().and_then(|m| m.payload_variant),
        Some(wire::to_radio::PayloadVariant::Disconnect(true))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_parses_common_notations() {
        assert_eq!("!9e9f4220".parse::<NodeId>().unwrap(), NodeId(0x9e9f4220));
        assert_eq!("0x2A".parse::<NodeId>().unwrap(), NodeId(42));
        assert_eq!("42".parse::<NodeId>().unwrap(), NodeId(42));
        assert!("!zz".parse::<NodeId>().is_err());
        assert!("!ffffffff".parse::<NodeId>().is_err());
        assert_eq!(NodeId(0x9e9f4220).to_string(), "!9e9f4220");
    }

    #[test]
    fn destination_parses_broadcast_aliases() {
        assert_eq!(
            "broadcast".parse::<Destination>().unwrap(),
            Destination::Broadcast
        );
        assert_eq!("^all".parse::<Destination>().unwrap(), Destination::Broadcast);
        assert_eq!(
            "!0000002a".parse::<Destination>().unwrap(),
            Destination::Node(NodeId(42))
        );
    }

    #[test]
    fn id_generator_never_yields_zero() {
        let mut gen = MessageIdGenerator::starting_at(u32::MAX);
        assert_eq!(gen.next_id(), MessageId(u32::MAX));
        assert_eq!(gen.next_id(), MessageId(1));
        let mut gen = MessageIdGenerator::starting_at(0);
        assert_eq!(gen.next_id(), MessageId(1));
    }

    #[test]
    fn text_packet_carries_sender_signal() {
        let events = decode_frame(&radio::text(NodeId(7), None, "hello")).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            InboundEvent::TextMessage {
                sender, to, text, ..
            } => {
                assert_eq!(sender.id, NodeId(7));
                assert_eq!(*to, Destination::Broadcast);
                assert_eq!(text, "hello");
                let sig = sender.signal.expect("signal");
                assert_eq!(sig.rssi, Some(-92));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn routing_reply_maps_to_ack_or_nak() {
        let ack = decode_frame(&radio::ack(NodeId(42), MessageId(99))).unwrap();
        assert_eq!(
            ack[1],
            InboundEvent::Ack {
                message_id: MessageId(99),
                from: NodeId(42)
            }
        );
        let nak = decode_frame(&radio::routing(
            NodeId(42),
            MessageId(99),
            RoutingError::TooLarge,
        ))
        .unwrap();
        assert!(matches!(
            nak[1],
            InboundEvent::Nak {
                reason: RoutingError::TooLarge,
                ..
            }
        ));
    }

    #[test]
    fn node_db_entry_keeps_last_heard() {
        let events = decode_frame(&radio::node_db_entry(NodeId(5), "Base", 1_700_000_000)).unwrap();
        match &events[0] {
            InboundEvent::NodeSeen(s) => {
                assert_eq!(s.long_name.as_deref(), Some("Base"));
                assert_eq!(s.short_name, None);
                assert_eq!(s.heard_at.map(|t| t.timestamp()), Some(1_700_000_000));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn telemetry_yields_sighting_then_metrics() {
        let events = decode_frame(&radio::device_metrics(NodeId(3), 87, 4.01)).unwrap();
        assert!(matches!(events[0], InboundEvent::NodeSeen(_)));
        match &events[1] {
            InboundEvent::DeviceTelemetry(t) => assert_eq!(t.battery_level, Some(87)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode_frame(&[]).is_err());
        assert!(decode_frame(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn outbound_text_round_trips_id() {
        let frame = encode_text(MessageId(0xABCD), Destination::Node(NodeId(42)), 0, "hi");
        let (id, dest, text) = outbound_text(&frame).unwrap();
        assert_eq!(id, MessageId(0xABCD));
        assert_eq!(dest, Destination::Node(NodeId(42)));
        assert_eq!(text, "hi");
        assert_eq!(outbound_want_config(&encode_want_config(5)), Some(5));
        assert_eq!(outbound_text(&encode_heartbeat(1)), None);
    }
}
