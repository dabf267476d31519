//! Application messages and their JSON envelope
//!
//! On the wire every message is a JSON object
//! `{id, src, dst, type, time, ack_req, data}`, with a top-level `ack_id` on
//! acknowledgments. In memory the `type`/`data` pair becomes a tagged
//! [`Payload`]; each typed payload keeps unrecognised keys in an `extra` map
//! so fields added by newer peers survive decoding.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{epoch_seconds, GpsFix, BROADCAST_ID, UNKNOWN_SENDER_ID};
use crate::protocol::packet::MinimalPacket;
use crate::protocol::stats::Statistics;

/// Open key/value map carried alongside typed payload fields
pub type Extra = Map<String, Value>;

/// Counter range for message ids
pub const MESSAGE_COUNTER_MODULUS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Position,
    Heartbeat,
    Status,
    Alert,
    Command,
    Response,
    Ack,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Position => "position",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Status => "status",
            MessageType::Alert => "alert",
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GPS position report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub lat: f64,
    pub lon: f64,
    #[serde(rename = "alt", default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// km/h
    #[serde(rename = "spd", default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(rename = "crs", default, skip_serializing_if = "Option::is_none")]
    pub course: Option<f64>,
    #[serde(rename = "fix", default, skip_serializing_if = "Option::is_none")]
    pub fix_quality: Option<u8>,
    #[serde(rename = "sat", default, skip_serializing_if = "Option::is_none")]
    pub satellites: Option<u32>,
    /// Battery percentage
    #[serde(rename = "bat", default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl PositionReport {
    /// Report built from a fix; `None` without coordinates
    pub fn from_fix(fix: &GpsFix, battery: Option<f64>) -> Option<Self> {
        let position = fix.position()?;
        Some(Self {
            lat: position.lat,
            lon: position.lon,
            altitude: fix.altitude,
            speed: fix.speed_kmh,
            course: fix.course_deg,
            fix_quality: Some(fix.fix_quality),
            satellites: Some(fix.satellites),
            battery,
            extra: Extra::new(),
        })
    }
}

/// Periodic liveness report, sent without acknowledgment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "bat", default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(rename = "fix", default)]
    pub has_fix: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// GPS receiver state as reported in status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsState {
    Inactive,
    NoFix,
    Fixed,
}

/// Node status summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "id", default)]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsState>,
    #[serde(rename = "bat", default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Seconds since the node started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_stats: Option<Statistics>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceTransition {
    Enter,
    Exit,
}

/// Alert raised by the beacon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "lowercase")]
pub enum Alert {
    Geofence {
        status: FenceTransition,
        lat: f64,
        lon: f64,
        fence_id: String,
    },
    Battery {
        level: f64,
    },
    Waypoint {
        wp_id: String,
        lat: f64,
        lon: f64,
        distance: f64,
    },
}

/// Remote command; arguments stay untyped until the handler interprets them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(flatten)]
    pub args: Extra,
}

/// Answer to a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub response: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Typed message body, one variant per message type
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Position(PositionReport),
    Heartbeat(Heartbeat),
    Status(StatusReport),
    Alert(Alert),
    Command(CommandPayload),
    Response(ResponsePayload),
    Ack { ack_id: String },
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Position(_) => MessageType::Position,
            Payload::Heartbeat(_) => MessageType::Heartbeat,
            Payload::Status(_) => MessageType::Status,
            Payload::Alert(_) => MessageType::Alert,
            Payload::Command(_) => MessageType::Command,
            Payload::Response(_) => MessageType::Response,
            Payload::Ack { .. } => MessageType::Ack,
        }
    }

    fn to_data(&self) -> serde_json::Result<Value> {
        match self {
            Payload::Position(p) => serde_json::to_value(p),
            Payload::Heartbeat(h) => serde_json::to_value(h),
            Payload::Status(s) => serde_json::to_value(s),
            Payload::Alert(a) => serde_json::to_value(a),
            Payload::Command(c) => serde_json::to_value(c),
            Payload::Response(r) => serde_json::to_value(r),
            Payload::Ack { .. } => Ok(Value::Object(Map::new())),
        }
    }

    fn from_data(kind: MessageType, data: Value, ack_id: Option<String>) -> serde_json::Result<Self> {
        let data = match data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Ok(match kind {
            MessageType::Position => Payload::Position(serde_json::from_value(data)?),
            MessageType::Heartbeat => Payload::Heartbeat(serde_json::from_value(data)?),
            MessageType::Status => Payload::Status(serde_json::from_value(data)?),
            MessageType::Alert => Payload::Alert(serde_json::from_value(data)?),
            MessageType::Command => Payload::Command(serde_json::from_value(data)?),
            MessageType::Response => Payload::Response(serde_json::from_value(data)?),
            MessageType::Ack => Payload::Ack {
                ack_id: ack_id.ok_or_else(|| serde_json::Error::custom("ack without ack_id"))?,
            },
        })
    }
}

/// Wire form of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub src: String,
    pub dst: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub time: f64,
    #[serde(default)]
    pub ack_req: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// An application message; immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub src: String,
    pub dst: String,
    /// Epoch seconds at creation
    pub time: f64,
    pub ack_req: bool,
    pub payload: Payload,
}

impl Message {
    pub fn new(id: String, src: &str, dst: &str, payload: Payload, ack_req: bool) -> Self {
        Self {
            id,
            src: src.to_string(),
            dst: dst.to_string(),
            time: epoch_seconds(),
            ack_req,
            payload,
        }
    }

    /// Acknowledgment of `inbound`, addressed back to its sender
    pub fn ack_for(inbound: &Message, id: String, src: &str) -> Self {
        let dst = if inbound.src.is_empty() {
            UNKNOWN_SENDER_ID
        } else {
            inbound.src.as_str()
        };
        Self::new(
            id,
            src,
            dst,
            Payload::Ack {
                ack_id: inbound.id.clone(),
            },
            false,
        )
    }

    /// Position message standing in for a received minimal packet
    pub fn from_minimal(packet: &MinimalPacket) -> Self {
        Self {
            id: format!("minimal_{}", packet.timestamp),
            src: UNKNOWN_SENDER_ID.to_string(),
            dst: BROADCAST_ID.to_string(),
            time: packet.timestamp as f64,
            ack_req: false,
            payload: Payload::Position(PositionReport {
                lat: packet.latitude(),
                lon: packet.longitude(),
                ..Default::default()
            }),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// True when `node_id` should process this message
    pub fn is_addressed_to(&self, node_id: &str) -> bool {
        self.dst == node_id || self.dst == BROADCAST_ID
    }

    pub fn to_envelope(&self) -> serde_json::Result<Envelope> {
        let ack_id = match &self.payload {
            Payload::Ack { ack_id } => Some(ack_id.clone()),
            _ => None,
        };
        Ok(Envelope {
            id: self.id.clone(),
            src: self.src.clone(),
            dst: self.dst.clone(),
            kind: self.message_type(),
            time: self.time,
            ack_req: self.ack_req,
            ack_id,
            data: self.payload.to_data()?,
        })
    }

    pub fn from_envelope(envelope: Envelope) -> serde_json::Result<Self> {
        let payload = Payload::from_data(envelope.kind, envelope.data, envelope.ack_id)?;
        Ok(Self {
            id: envelope.id,
            src: envelope.src,
            dst: envelope.dst,
            time: envelope.time,
            ack_req: envelope.ack_req,
            payload,
        })
    }
}

/// Per-node message id source: `{node}_{epoch_seconds}_{counter}`
#[derive(Debug)]
pub struct MessageIdGenerator {
    node_id: String,
    counter: AtomicU32,
}

impl MessageIdGenerator {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            counter: AtomicU32::new(0),
        }
    }

    fn next_counter(&self) -> u32 {
        self.counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some((c + 1) % MESSAGE_COUNTER_MODULUS)
            })
            .unwrap_or(0)
    }

    pub fn next_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.node_id,
            epoch_seconds() as u64,
            self.next_counter()
        )
    }

    /// Id for an outbound acknowledgment
    pub fn next_ack_id(&self) -> String {
        format!("ack_{}", self.next_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn position_message() -> Message {
        Message {
            id: "BEACON_1700000000_1".to_string(),
            src: "BEACON".to_string(),
            dst: "SERVER".to_string(),
            time: 1_700_000_000.25,
            ack_req: true,
            payload: Payload::Position(PositionReport {
                lat: 51.5074,
                lon: -0.1278,
                altitude: Some(35.0),
                satellites: Some(8),
                battery: Some(87.5),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_envelope_wire_shape() {
        let value = serde_json::to_value(position_message().to_envelope().unwrap()).unwrap();
        assert_eq!(value["type"], "position");
        assert_eq!(value["ack_req"], true);
        assert_eq!(value["data"]["lat"], 51.5074);
        assert_eq!(value["data"]["sat"], 8);
        assert_eq!(value["data"]["bat"], 87.5);
        assert!(value.get("ack_id").is_none());
        assert!(value["data"].get("spd").is_none());
    }

    #[test]
    fn test_envelope_round_trip() {
        let message = position_message();
        let back = Message::from_envelope(message.to_envelope().unwrap()).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_ack_carries_top_level_ack_id() {
        let inbound = position_message();
        let ack = Message::ack_for(&inbound, "ack_SERVER_1_0".to_string(), "SERVER");
        assert_eq!(ack.dst, "BEACON");
        assert!(!ack.ack_req);

        let value = serde_json::to_value(ack.to_envelope().unwrap()).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["ack_id"], "BEACON_1700000000_1");
        assert_eq!(value["data"], json!({}));
    }

    #[test]
    fn test_ack_without_ack_id_rejected() {
        let envelope: Envelope = serde_json::from_value(json!({
            "id": "x", "src": "a", "dst": "b", "type": "ack", "time": 1.0, "data": {}
        }))
        .unwrap();
        assert!(Message::from_envelope(envelope).is_err());
    }

    #[test]
    fn test_unknown_fields_are_preserved() {
        let envelope: Envelope = serde_json::from_value(json!({
            "id": "x", "src": "a", "dst": "b", "type": "position", "time": 1.0,
            "ack_req": false,
            "data": {"lat": 1.0, "lon": 2.0, "alt": null, "hdg_mag": 12}
        }))
        .unwrap();
        let message = Message::from_envelope(envelope).unwrap();
        match message.payload {
            Payload::Position(report) => {
                assert_eq!(report.altitude, None);
                assert_eq!(report.extra.get("hdg_mag"), Some(&json!(12)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_alert_tagging() {
        let alert = Alert::Geofence {
            status: FenceTransition::Exit,
            lat: 1.0,
            lon: 2.0,
            fence_id: "main".to_string(),
        };
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["alert"], "geofence");
        assert_eq!(value["status"], "exit");

        let battery: Alert = serde_json::from_value(json!({"alert": "battery", "level": 15})).unwrap();
        assert_eq!(battery, Alert::Battery { level: 15.0 });
    }

    #[test]
    fn test_command_arguments_flattened() {
        let command: CommandPayload =
            serde_json::from_value(json!({"command": "power_save", "enable": true})).unwrap();
        assert_eq!(command.command, "power_save");
        assert_eq!(command.args.get("enable"), Some(&json!(true)));
    }

    #[test]
    fn test_missing_data_treated_as_empty() {
        let envelope: Envelope = serde_json::from_value(json!({
            "id": "x", "src": "a", "dst": "b", "type": "heartbeat", "time": 1.0
        }))
        .unwrap();
        let message = Message::from_envelope(envelope).unwrap();
        assert_eq!(message.payload, Payload::Heartbeat(Heartbeat::default()));
    }

    #[test]
    fn test_addressing() {
        let mut message = position_message();
        assert!(message.is_addressed_to("SERVER"));
        assert!(!message.is_addressed_to("OTHER"));
        message.dst = BROADCAST_ID.to_string();
        assert!(message.is_addressed_to("OTHER"));
    }

    #[test]
    fn test_from_minimal_packet() {
        let packet = MinimalPacket::new(51.5074, -0.1278, 1_700_000_000);
        let message = Message::from_minimal(&packet);
        assert_eq!(message.src, UNKNOWN_SENDER_ID);
        assert_eq!(message.dst, BROADCAST_ID);
        assert!(!message.ack_req);
        assert_eq!(message.message_type(), MessageType::Position);
    }

    #[test]
    fn test_id_generator_format_and_wrap() {
        let ids = MessageIdGenerator::new("BEACON");
        let first = ids.next_id();
        let parts: Vec<&str> = first.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "BEACON");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2], "0");

        ids.counter.store(MESSAGE_COUNTER_MODULUS - 1, Ordering::SeqCst);
        assert!(ids.next_id().ends_with("_9999"));
        assert!(ids.next_id().ends_with("_0"));
        assert!(ids.next_ack_id().starts_with("ack_BEACON_"));
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::Ack.to_string(), "ack");
        assert_eq!(
            serde_json::to_value(MessageType::Heartbeat).unwrap(),
            json!("heartbeat")
        );
    }
}
