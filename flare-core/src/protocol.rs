//! Flare wire protocol: frame types and version. Encoding is JSON, one object per line (see wire module).

use serde::{Deserialize, Deserializer, Serialize};

/// Current protocol version. Carried in every handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default hop budget for a locally originated message.
pub const DEFAULT_TTL: u8 = 3;

/// All frames exchanged over a transport channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame after connect: who the connecting side is.
    Handshake(Handshake),
    /// Reply to a handshake with the responder's identity, same shape.
    HandshakeResponse(Handshake),
    /// Application message (text, emergency, sos).
    Message(DataMessage),
    /// Liveness on an otherwise idle channel.
    Heartbeat {
        #[serde(default)]
        timestamp: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub device_id: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "protocol_version", default = "default_protocol_version")]
    pub protocol_version: String,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    pub message_id: String,
    pub message: String,
    #[serde(default)]
    pub sender_name: String,
    pub device_id: String,
    #[serde(default)]
    pub target_device_id: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub is_emergency: bool,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Out-of-range values from the wire are clamped into 0..=255.
    #[serde(default = "default_ttl", deserialize_with = "clamped_ttl")]
    pub ttl: u8,
    #[serde(default)]
    pub route_path: Vec<String>,
}

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

fn clamped_ttl<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
    Ok(match Option::<i64>::deserialize(d)? {
        Some(raw) => raw.clamp(0, i64::from(u8::MAX)) as u8,
        None => DEFAULT_TTL,
    })
}

/// Kind of message. Unknown strings on the wire read as `Text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    #[default]
    Text,
    Emergency,
    Sos,
    Handshake,
    HandshakeResponse,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Emergency => "emergency",
            MessageType::Sos => "sos",
            MessageType::Handshake => "handshake",
            MessageType::HandshakeResponse => "handshake_response",
            MessageType::Heartbeat => "heartbeat",
        }
    }

    /// Emergency and SOS messages are flooded regardless of target.
    pub fn is_emergency(&self) -> bool {
        matches!(self, MessageType::Emergency | MessageType::Sos)
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "emergency" => MessageType::Emergency,
            "sos" => MessageType::Sos,
            "handshake" => MessageType::Handshake,
            "handshake_response" => MessageType::HandshakeResponse,
            "heartbeat" => MessageType::Heartbeat,
            _ => MessageType::Text,
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_field_names_match_wire() {
        let frame = Frame::Handshake(Handshake {
            device_id: "d1".into(),
            mac_address: "aa:bb:cc:dd:ee:ff".into(),
            user_name: "ana".into(),
            device_name: "phone".into(),
            timestamp: 42,
            protocol_version: PROTOCOL_VERSION.into(),
        });
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "handshake");
        assert_eq!(v["deviceId"], "d1");
        assert_eq!(v["macAddress"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(v["userName"], "ana");
        assert_eq!(v["deviceName"], "phone");
        assert_eq!(v["timestamp"], 42);
        assert_eq!(v["protocol_version"], "1.0");
    }

    #[test]
    fn data_message_nulls_are_explicit() {
        let frame = Frame::Message(DataMessage {
            message_id: "m1".into(),
            message: "help".into(),
            sender_name: "ana".into(),
            device_id: "d1".into(),
            target_device_id: None,
            message_type: MessageType::Sos,
            timestamp: 7,
            is_emergency: true,
            latitude: None,
            longitude: None,
            ttl: 3,
            route_path: vec!["d1".into()],
        });
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "message");
        assert!(v["targetDeviceId"].is_null());
        assert!(v["latitude"].is_null());
        assert_eq!(v["messageType"], "sos");
        assert_eq!(v["isEmergency"], true);
        assert_eq!(v["routePath"][0], "d1");
    }

    #[test]
    fn unknown_message_type_reads_as_text() {
        let json = r#"{"type":"message","messageId":"m","message":"x","deviceId":"d","messageType":"sticker"}"#;
        match serde_json::from_str::<Frame>(json).unwrap() {
            Frame::Message(m) => {
                assert_eq!(m.message_type, MessageType::Text);
                assert_eq!(m.ttl, DEFAULT_TTL);
                assert!(m.route_path.is_empty());
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }
}
