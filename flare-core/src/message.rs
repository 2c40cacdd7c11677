//! Message envelope: the in-memory form of a data message, with hop bookkeeping.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::{now_millis, DeviceId, LocalIdentity};
use crate::protocol::{DataMessage, Frame, MessageType};

/// Coordinates attached by the application; the core never acquires location itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub sender_id: DeviceId,
    pub sender_name: String,
    /// None means broadcast.
    pub target_id: Option<DeviceId>,
    pub message_type: MessageType,
    pub payload: String,
    /// Milliseconds since the Unix epoch, set by the originator.
    pub timestamp: u64,
    pub ttl: u8,
    /// Hops traversed so far; starts with the sender and never repeats an id.
    pub route_path: Vec<DeviceId>,
    pub is_emergency: bool,
    pub location: Option<Location>,
}

impl MessageEnvelope {
    /// New locally originated message with a fresh id and route path `[self]`.
    pub fn outbound(
        local: &LocalIdentity,
        target_id: Option<DeviceId>,
        message_type: MessageType,
        payload: impl Into<String>,
        ttl: u8,
    ) -> Self {
        let sender_id = local.canonical_id();
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            route_path: vec![sender_id.clone()],
            sender_id,
            sender_name: local.user_name.clone(),
            target_id,
            is_emergency: message_type.is_emergency(),
            message_type,
            payload: payload.into(),
            timestamp: now_millis(),
            ttl,
            location: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_id.is_none()
    }

    /// Only broadcast and emergency traffic is relayed; direct messages never are.
    pub fn is_forwardable(&self) -> bool {
        self.is_broadcast() || self.is_emergency
    }

    /// SHA-256 over type and payload. Combined with the sender id it forms the dedup key.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.message_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.payload.as_bytes());
        hasher.finalize().into()
    }

    /// Build from a wire message. `sender_id` is the already resolved canonical sender.
    pub fn from_wire(msg: DataMessage, sender_id: DeviceId) -> Self {
        let location = match (msg.latitude, msg.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
            }),
            _ => None,
        };
        let mut route_path: Vec<DeviceId> = Vec::with_capacity(msg.route_path.len());
        for hop in msg.route_path {
            let hop = DeviceId::new(hop);
            if !route_path.contains(&hop) {
                route_path.push(hop);
            }
        }
        if route_path.is_empty() {
            route_path.push(sender_id.clone());
        }
        Self {
            message_id: msg.message_id,
            sender_id,
            sender_name: msg.sender_name,
            target_id: msg
                .target_device_id
                .filter(|t| !t.is_empty())
                .map(DeviceId::new),
            is_emergency: msg.is_emergency || msg.message_type.is_emergency(),
            message_type: msg.message_type,
            payload: msg.message,
            timestamp: msg.timestamp.max(0) as u64,
            ttl: msg.ttl,
            route_path,
            location,
        }
    }

    pub fn to_wire(&self) -> DataMessage {
        DataMessage {
            message_id: self.message_id.clone(),
            message: self.payload.clone(),
            sender_name: self.sender_name.clone(),
            device_id: self.sender_id.to_string(),
            target_device_id: self.target_id.as_ref().map(|t| t.to_string()),
            message_type: self.message_type,
            timestamp: self.timestamp as i64,
            is_emergency: self.is_emergency,
            latitude: self.location.map(|l| l.latitude),
            longitude: self.location.map(|l| l.longitude),
            ttl: self.ttl,
            route_path: self.route_path.iter().map(|h| h.to_string()).collect(),
        }
    }

    pub fn to_frame(&self) -> Frame {
        Frame::Message(self.to_wire())
    }
}

/// Delivery status as recorded in the message store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
    Received,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Received => "received",
        }
    }
}

/// A locally originated message whose send failed; retried on the next successful send.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub payload: MessageEnvelope,
    /// Milliseconds since the Unix epoch.
    pub enqueued_at: u64,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_TTL;

    fn local() -> LocalIdentity {
        LocalIdentity::new("ana", "pixel").with_hardware_id("aa:aa:aa:aa:aa:01")
    }

    #[test]
    fn outbound_route_starts_with_sender() {
        let env = MessageEnvelope::outbound(&local(), None, MessageType::Sos, "help", DEFAULT_TTL);
        assert_eq!(env.route_path, vec![DeviceId::from("aa:aa:aa:aa:aa:01")]);
        assert!(env.is_emergency);
        assert!(env.is_forwardable());
    }

    #[test]
    fn direct_text_is_not_forwardable() {
        let env = MessageEnvelope::outbound(
            &local(),
            Some(DeviceId::from("bb")),
            MessageType::Text,
            "hi",
            DEFAULT_TTL,
        );
        assert!(!env.is_forwardable());
    }

    #[test]
    fn content_hash_ignores_id_and_route() {
        let a = MessageEnvelope::outbound(&local(), None, MessageType::Text, "same", 3);
        let mut b = MessageEnvelope::outbound(&local(), None, MessageType::Text, "same", 3);
        b.route_path.push(DeviceId::from("relay"));
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.content_hash(), b.content_hash());
        let c = MessageEnvelope::outbound(&local(), None, MessageType::Emergency, "same", 3);
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn from_wire_drops_repeated_hops() {
        let env = MessageEnvelope::outbound(&local(), None, MessageType::Text, "x", 3)
            .with_location(Location {
                latitude: 1.5,
                longitude: -2.0,
            });
        let mut wire = env.to_wire();
        wire.route_path = vec!["a".into(), "b".into(), "a".into()];
        let back = MessageEnvelope::from_wire(wire, env.sender_id.clone());
        assert_eq!(back.route_path, vec![DeviceId::from("a"), DeviceId::from("b")]);
        assert_eq!(back.location, env.location);
    }
}
