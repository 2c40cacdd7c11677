//! Types shared with the platform peer/link and access-point services.
//! The services themselves live with the host; the core only sees their events and results.

use serde::{Deserialize, Serialize};

use crate::identity::DeviceId;

/// Outcome of a platform primitive or capability query.
/// `Unsupported` is final for that operation and is never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability<T> {
    Available(T),
    Failed(String),
    Unsupported,
}

impl<T> Capability<T> {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Available,
    Invited,
    Connected,
    Failed,
    Unavailable,
}

/// One entry of a platform peer-list snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformPeer {
    /// Address the platform and the transport know this peer by.
    pub address: String,
    /// Hardware identifier, when the platform exposes one.
    pub hardware_id: Option<String>,
    /// Identifier the peer advertises for itself (its ephemeral id when it has no hardware id).
    pub device_id: Option<String>,
    pub name: String,
    pub status: PeerStatus,
}

/// Connection-state notification from the link layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkInfo {
    pub connected: bool,
    /// Set when the platform (or an already hosting peer) decided ownership.
    pub group_owner: Option<bool>,
    /// Address of the group owner, the transport target for a client.
    pub owner_address: Option<String>,
    pub peer_address: Option<String>,
    pub peer_id: Option<DeviceId>,
}

/// Raw notifications the arbitrator consumes, after debouncing.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    PeersChanged(Vec<PlatformPeer>),
    LinkChanged(LinkInfo),
    AccessPointStarted,
    AccessPointJoined { host_address: String },
    AccessPointStopped,
}

impl PlatformEvent {
    /// Events of the same kind coalesce inside the debounce window.
    pub fn kind(&self) -> EventKind {
        match self {
            PlatformEvent::PeersChanged(_) => EventKind::Peers,
            PlatformEvent::LinkChanged(_) => EventKind::Link,
            PlatformEvent::AccessPointStarted
            | PlatformEvent::AccessPointJoined { .. }
            | PlatformEvent::AccessPointStopped => EventKind::AccessPoint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Peers,
    Link,
    AccessPoint,
}

/// Local device facts returned by the request-device-info primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub hardware_id: Option<String>,
    pub name: String,
}
