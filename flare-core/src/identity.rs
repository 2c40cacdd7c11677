//! Device identity: canonical identifiers, the local device, and known peers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// MAC reported by platforms that hide the real hardware address. Never a usable identifier.
pub const PLACEHOLDER_MAC: &str = "02:00:00:00:00:00";

/// Canonical device identifier: a hardware identifier when one is known, else an ephemeral id.
/// Ordering is plain byte-wise string order, which makes it usable as a role tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    /// Fresh ephemeral id for a device with no known hardware identifier.
    pub fn ephemeral() -> Self {
        DeviceId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Normalise a claimed hardware identifier. Returns None for empty, placeholder or all-zero MACs.
pub fn normalize_hardware_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower == PLACEHOLDER_MAC || lower == "00:00:00:00:00:00" {
        return None;
    }
    Some(lower)
}

/// This device. The ephemeral id is generated once per process; the hardware id comes
/// from the platform's device-info query when available.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    ephemeral_id: DeviceId,
    hardware_id: Option<String>,
    pub user_name: String,
    pub device_name: String,
}

impl LocalIdentity {
    pub fn new(user_name: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            ephemeral_id: DeviceId::ephemeral(),
            hardware_id: None,
            user_name: user_name.into(),
            device_name: device_name.into(),
        }
    }

    /// Attach the hardware identifier reported by the platform. Placeholders are ignored.
    pub fn with_hardware_id(mut self, raw: &str) -> Self {
        self.hardware_id = normalize_hardware_id(raw);
        self
    }

    pub fn ephemeral_id(&self) -> &DeviceId {
        &self.ephemeral_id
    }

    pub fn hardware_id(&self) -> Option<&str> {
        self.hardware_id.as_deref()
    }

    /// Identifier other devices will resolve us to: hardware id when known, else ephemeral.
    pub fn canonical_id(&self) -> DeviceId {
        match &self.hardware_id {
            Some(hw) => DeviceId::new(hw.clone()),
            None => self.ephemeral_id.clone(),
        }
    }
}

/// How a peer was first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    DirectLink,
    AccessPoint,
    Handshake,
}

/// A peer as the directory knows it. Marked disconnected, never deleted, when its link drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub display_name: String,
    pub discovery_method: DiscoveryMethod,
    pub is_connected: bool,
    /// Milliseconds since the Unix epoch.
    pub last_seen: u64,
}

/// Milliseconds since the Unix epoch (0 if the clock is before 1970).
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
