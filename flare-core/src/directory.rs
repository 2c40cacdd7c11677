//! Peer directory: platform peer records, address-to-hardware-id resolution, connected set.

use std::collections::HashMap;

use crate::identity::{normalize_hardware_id, DeviceId, DeviceIdentity, DiscoveryMethod};
use crate::platform::{PeerStatus, PlatformPeer};

/// Platform-level view of one peer. Replaced wholesale on every peer-list event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: String,
    pub status: PeerStatus,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    records: HashMap<String, PeerRecord>,
    hardware_by_address: HashMap<String, String>,
    identities: HashMap<DeviceId, DeviceIdentity>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a peer-list snapshot. Records and the resolution table are rebuilt;
    /// identities are created or updated but never removed.
    pub fn refresh(&mut self, peers: &[PlatformPeer], method: DiscoveryMethod, now: u64) {
        self.records.clear();
        self.hardware_by_address.clear();
        for peer in peers {
            self.records.insert(
                peer.address.clone(),
                PeerRecord {
                    address: peer.address.clone(),
                    status: peer.status,
                },
            );
            let hw = peer.hardware_id.as_deref().and_then(normalize_hardware_id);
            if let Some(hw) = &hw {
                self.hardware_by_address
                    .insert(peer.address.clone(), hw.clone());
            }
            let advertised = peer
                .device_id
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string);
            let Some(id) = hw.or(advertised).map(DeviceId::new) else {
                continue;
            };
            let identity = self
                .identities
                .entry(id.clone())
                .or_insert_with(|| DeviceIdentity {
                    id,
                    display_name: peer.name.clone(),
                    discovery_method: method,
                    is_connected: false,
                    last_seen: now,
                });
            if !peer.name.is_empty() {
                identity.display_name = peer.name.clone();
            }
            if peer.status == PeerStatus::Connected {
                identity.is_connected = true;
            }
            identity.last_seen = now;
        }
    }

    pub fn record(&self, address: &str) -> Option<&PeerRecord> {
        self.records.get(address)
    }

    /// Hardware identifier for a transport address, from the latest snapshot.
    pub fn resolve(&self, address: &str) -> Option<DeviceId> {
        self.hardware_by_address
            .get(address)
            .map(|hw| DeviceId::new(hw.clone()))
    }

    /// Canonical identifier for a remote device. Priority: directory resolution of the
    /// transport address, then the claimed hardware id, then the claimed ephemeral id.
    pub fn canonical_id(
        &self,
        address: Option<&str>,
        claimed_hardware_id: Option<&str>,
        claimed_id: &str,
    ) -> DeviceId {
        if let Some(id) = address.and_then(|a| self.resolve(a)) {
            return id;
        }
        if let Some(hw) = claimed_hardware_id.and_then(normalize_hardware_id) {
            return DeviceId::new(hw);
        }
        let claimed = claimed_id.trim();
        if !claimed.is_empty() {
            return DeviceId::new(claimed);
        }
        DeviceId::new(address.unwrap_or("unknown"))
    }

    /// Mark a device connected. Returns true if it was not connected before; repeated
    /// registration only refreshes name and last-seen.
    pub fn register_connected(
        &mut self,
        id: DeviceId,
        display_name: &str,
        method: DiscoveryMethod,
        now: u64,
    ) -> bool {
        let identity = self
            .identities
            .entry(id.clone())
            .or_insert_with(|| DeviceIdentity {
                id,
                display_name: display_name.to_string(),
                discovery_method: method,
                is_connected: false,
                last_seen: now,
            });
        if !display_name.is_empty() {
            identity.display_name = display_name.to_string();
        }
        identity.last_seen = now;
        let newly = !identity.is_connected;
        identity.is_connected = true;
        newly
    }

    pub fn touch(&mut self, id: &DeviceId, now: u64) {
        if let Some(identity) = self.identities.get_mut(id) {
            identity.last_seen = now;
        }
    }

    /// Returns true if the device was connected.
    pub fn mark_disconnected(&mut self, id: &DeviceId) -> bool {
        match self.identities.get_mut(id) {
            Some(identity) if identity.is_connected => {
                identity.is_connected = false;
                true
            }
            _ => false,
        }
    }

    /// Link teardown: every connected identity becomes disconnected. Returns those ids.
    pub fn mark_all_disconnected(&mut self) -> Vec<DeviceId> {
        let mut out = Vec::new();
        for identity in self.identities.values_mut() {
            if identity.is_connected {
                identity.is_connected = false;
                out.push(identity.id.clone());
            }
        }
        out.sort();
        out
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.identities.get(id).is_some_and(|i| i.is_connected)
    }

    pub fn connected(&self) -> Vec<DeviceId> {
        let mut out: Vec<DeviceId> = self
            .identities
            .values()
            .filter(|i| i.is_connected)
            .map(|i| i.id.clone())
            .collect();
        out.sort();
        out
    }

    pub fn identity(&self, id: &DeviceId) -> Option<&DeviceIdentity> {
        self.identities.get(id)
    }

    pub fn identities(&self) -> Vec<DeviceIdentity> {
        let mut out: Vec<DeviceIdentity> = self.identities.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
