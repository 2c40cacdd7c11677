//! Platform link primitives the supervisor drives. Every call reports a `Capability` so a
//! missing facility is a value, never a panic.

use async_trait::async_trait;
use flare_core::{Capability, DeviceInfo};
use std::sync::Arc;

/// Peer-to-peer link facility (Wi-Fi Direct style). Events come back on the
/// platform event channel handed to the implementation at construction.
#[async_trait]
pub trait LinkService: Send + Sync {
    async fn discover(&self) -> Capability<()>;
    /// Releases discovery resources before returning.
    async fn stop_discovery(&self);
    async fn connect(&self, address: &str) -> Capability<()>;
    /// Form a group with this device as owner.
    async fn create_link(&self) -> Capability<()>;
    async fn remove_link(&self);
    async fn request_device_info(&self) -> Capability<DeviceInfo>;
}

/// Hotspot-style fallback facility.
#[async_trait]
pub trait AccessPointService: Send + Sync {
    fn name(&self) -> &'static str;
    async fn create(&self) -> Capability<()>;
    async fn stop(&self);
    /// Addresses of currently joined clients.
    async fn clients(&self) -> Vec<String>;
}

/// Strategy for platforms that cannot host an access point from user space.
pub struct UnsupportedAccessPoint;

#[async_trait]
impl AccessPointService for UnsupportedAccessPoint {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn create(&self) -> Capability<()> {
        Capability::Unsupported
    }

    async fn stop(&self) {}

    async fn clients(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Capability query done once at startup; the chosen strategy is kept for the session.
pub fn select_access_point() -> (Arc<dyn AccessPointService>, bool) {
    // No user-space hotspot API on Linux without NetworkManager privileges.
    (Arc::new(UnsupportedAccessPoint), false)
}
