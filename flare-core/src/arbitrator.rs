//! Connection arbitrator: decides connection mode and host/client role from platform events.
//! Host-driven like the rest of the core: the host feeds `ArbiterEvent`s and performs the
//! returned `ArbiterAction`s. Only this type mutates `ConnectionState`.

use std::collections::HashSet;
use std::time::Duration;

use crate::identity::DeviceId;
use crate::platform::{Capability, LinkInfo, PeerStatus, PlatformEvent, PlatformPeer};

/// Delay before each discovery retry. Its length is the retry budget.
pub const DISCOVERY_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    #[default]
    None,
    DirectLink,
    AccessPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    Host,
    Client,
}

/// Snapshot readers get; one per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub mode: ConnectionMode,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Discovering,
    LinkFormed,
    RoleAssigned(Role),
    TransportEstablished,
    Active,
}

/// Role both ends derive independently from the same pair of identifiers:
/// the smaller identifier (byte-wise) is the client.
pub fn derive_role(local: &DeviceId, remote: &DeviceId) -> Role {
    if local.as_str().as_bytes() < remote.as_str().as_bytes() {
        Role::Client
    } else {
        Role::Host
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterEvent {
    Start,
    Stop,
    /// Ask the platform to form a group with us as owner instead of waiting for a peer.
    CreateGroup,
    DiscoveryResult(Capability<()>),
    /// The retry timer scheduled by `ScheduleDiscoveryRetry` fired.
    RetryDiscovery,
    Platform(PlatformEvent),
    ConnectResult {
        address: String,
        result: Capability<()>,
    },
    AccessPointResult(Capability<()>),
    TransportEstablished,
    TransportFailed,
    HandshakeCompleted(DeviceId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterAction {
    Discover,
    ScheduleDiscoveryRetry(Duration),
    StopDiscovery,
    /// Explicit platform connect to a discovered peer.
    Connect { address: String },
    /// Platform create-link: become group owner without a specific peer.
    CreateLink,
    RemoveLink,
    StartAccessPoint,
    StopAccessPoint,
    /// Transport: listen as host.
    OpenHost,
    /// Transport: connect as client.
    ConnectTransport { address: String },
    CloseTransport,
    MarkPeersDisconnected,
    /// Reported to the caller; never retried by the arbitrator.
    Failure(LinkFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    DiscoveryExhausted(String),
    Unsupported(&'static str),
    AccessPointFailed(String),
}

pub struct ConnectionArbitrator {
    local_id: DeviceId,
    state: ConnectionState,
    phase: Phase,
    discovery_retries: usize,
    /// Address we explicitly connected to, if the current attempt is ours.
    initiated: Option<String>,
    attempted: HashSet<String>,
    link_peer: Option<DeviceId>,
    access_point_capable: bool,
    stopped: bool,
}

impl ConnectionArbitrator {
    pub fn new(local_id: DeviceId) -> Self {
        Self {
            local_id,
            state: ConnectionState::default(),
            phase: Phase::Idle,
            discovery_retries: 0,
            initiated: None,
            attempted: HashSet::new(),
            link_peer: None,
            access_point_capable: false,
            stopped: true,
        }
    }

    /// Whether the access-point strategy selected at startup can create a group.
    pub fn set_access_point_capable(&mut self, capable: bool) {
        self.access_point_capable = capable;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn link_peer(&self) -> Option<&DeviceId> {
        self.link_peer.as_ref()
    }

    pub fn handle(&mut self, event: ArbiterEvent) -> Vec<ArbiterAction> {
        match event {
            ArbiterEvent::Start => self.on_start(),
            ArbiterEvent::Stop => self.on_stop(),
            ArbiterEvent::CreateGroup => {
                if !self.stopped && self.state.mode == ConnectionMode::None {
                    vec![ArbiterAction::CreateLink]
                } else {
                    vec![]
                }
            }
            ArbiterEvent::DiscoveryResult(result) => self.on_discovery_result(result),
            ArbiterEvent::RetryDiscovery => {
                if self.phase == Phase::Discovering {
                    vec![ArbiterAction::Discover]
                } else {
                    vec![]
                }
            }
            ArbiterEvent::Platform(PlatformEvent::PeersChanged(peers)) => {
                self.on_peers_changed(&peers)
            }
            ArbiterEvent::Platform(PlatformEvent::LinkChanged(info)) => self.on_link_changed(info),
            ArbiterEvent::Platform(PlatformEvent::AccessPointStarted) => {
                self.on_access_point_formed(Role::Host, None)
            }
            ArbiterEvent::Platform(PlatformEvent::AccessPointJoined { host_address }) => {
                self.on_access_point_formed(Role::Client, Some(host_address))
            }
            ArbiterEvent::Platform(PlatformEvent::AccessPointStopped) => {
                if self.state.mode == ConnectionMode::AccessPoint {
                    self.teardown(true)
                } else {
                    vec![]
                }
            }
            ArbiterEvent::ConnectResult { address, result } => {
                self.on_connect_result(address, result)
            }
            ArbiterEvent::AccessPointResult(result) => match result {
                Capability::Available(()) => vec![],
                Capability::Failed(reason) => {
                    vec![ArbiterAction::Failure(LinkFailure::AccessPointFailed(reason))]
                }
                Capability::Unsupported => {
                    self.access_point_capable = false;
                    vec![ArbiterAction::Failure(LinkFailure::Unsupported(
                        "access point",
                    ))]
                }
            },
            ArbiterEvent::TransportEstablished => {
                if matches!(self.phase, Phase::RoleAssigned(_)) {
                    self.phase = Phase::TransportEstablished;
                }
                vec![]
            }
            ArbiterEvent::TransportFailed => {
                if self.phase == Phase::Idle || self.phase == Phase::Discovering {
                    vec![]
                } else {
                    self.teardown(true)
                }
            }
            ArbiterEvent::HandshakeCompleted(peer) => {
                if matches!(
                    self.phase,
                    Phase::RoleAssigned(_) | Phase::TransportEstablished
                ) {
                    self.phase = Phase::Active;
                }
                if self.link_peer.is_none() && self.phase == Phase::Active {
                    self.link_peer = Some(peer);
                }
                vec![]
            }
        }
    }

    fn on_start(&mut self) -> Vec<ArbiterAction> {
        self.stopped = false;
        if self.phase != Phase::Idle {
            return vec![];
        }
        self.phase = Phase::Discovering;
        self.discovery_retries = 0;
        vec![ArbiterAction::Discover]
    }

    fn on_stop(&mut self) -> Vec<ArbiterAction> {
        self.stopped = true;
        // Release the link while the platform can still tell the peer.
        let mut actions = self.teardown(false);
        actions.push(ArbiterAction::StopDiscovery);
        actions
    }

    fn on_discovery_result(&mut self, result: Capability<()>) -> Vec<ArbiterAction> {
        if self.phase != Phase::Discovering {
            return vec![];
        }
        match result {
            Capability::Available(()) => vec![],
            Capability::Failed(reason) => {
                if let Some(delay) = DISCOVERY_RETRY_DELAYS.get(self.discovery_retries) {
                    self.discovery_retries += 1;
                    return vec![ArbiterAction::ScheduleDiscoveryRetry(*delay)];
                }
                self.phase = Phase::Idle;
                let mut actions = vec![ArbiterAction::Failure(LinkFailure::DiscoveryExhausted(
                    reason,
                ))];
                if self.access_point_capable {
                    actions.push(ArbiterAction::StartAccessPoint);
                }
                actions
            }
            Capability::Unsupported => {
                self.phase = Phase::Idle;
                let mut actions = vec![ArbiterAction::Failure(LinkFailure::Unsupported(
                    "peer discovery",
                ))];
                if self.access_point_capable {
                    actions.push(ArbiterAction::StartAccessPoint);
                }
                actions
            }
        }
    }

    fn on_peers_changed(&mut self, peers: &[PlatformPeer]) -> Vec<ArbiterAction> {
        if self.phase != Phase::Discovering || self.initiated.is_some() {
            return vec![];
        }
        let available = || peers.iter().filter(|p| p.status == PeerStatus::Available);
        if available().all(|p| self.attempted.contains(&p.address)) {
            // Every candidate failed once; start another round.
            self.attempted.clear();
        }
        let Some(target) = available().find(|p| !self.attempted.contains(&p.address)) else {
            return vec![];
        };
        let address = target.address.clone();
        self.attempted.insert(address.clone());
        self.initiated = Some(address.clone());
        vec![ArbiterAction::Connect { address }]
    }

    fn on_connect_result(&mut self, address: String, result: Capability<()>) -> Vec<ArbiterAction> {
        if self.initiated.as_deref() != Some(address.as_str()) {
            return vec![];
        }
        match result {
            Capability::Available(()) => vec![],
            Capability::Failed(_) => {
                self.initiated = None;
                vec![]
            }
            Capability::Unsupported => {
                self.initiated = None;
                let mut actions = vec![ArbiterAction::Failure(LinkFailure::Unsupported(
                    "direct link connect",
                ))];
                if self.access_point_capable && self.state.mode == ConnectionMode::None {
                    actions.push(ArbiterAction::StartAccessPoint);
                }
                actions
            }
        }
    }

    fn on_link_changed(&mut self, info: LinkInfo) -> Vec<ArbiterAction> {
        if !info.connected {
            if self.state.mode == ConnectionMode::DirectLink {
                return self.teardown(true);
            }
            return vec![];
        }
        if self.stopped || self.state.mode != ConnectionMode::None {
            // Already linked: further members join the existing group without a role change.
            return vec![];
        }
        self.phase = Phase::LinkFormed;
        self.state.mode = ConnectionMode::DirectLink;
        let role = match (info.group_owner, &info.peer_id) {
            (Some(true), _) => Role::Host,
            (Some(false), _) => Role::Client,
            (None, Some(peer)) => derive_role(&self.local_id, peer),
            (None, None) if self.initiated.is_some() => Role::Client,
            (None, None) => Role::Host,
        };
        self.link_peer = info.peer_id.clone();
        self.assign_role(role, info.owner_address.or(info.peer_address))
    }

    fn on_access_point_formed(&mut self, role: Role, host: Option<String>) -> Vec<ArbiterAction> {
        if self.stopped || self.state.mode == ConnectionMode::DirectLink {
            return vec![];
        }
        self.state.mode = ConnectionMode::AccessPoint;
        self.phase = Phase::LinkFormed;
        self.assign_role(role, host)
    }

    fn assign_role(&mut self, role: Role, remote_address: Option<String>) -> Vec<ArbiterAction> {
        match role {
            Role::Host => {
                self.state.role = Role::Host;
                self.phase = Phase::RoleAssigned(Role::Host);
                vec![ArbiterAction::OpenHost]
            }
            Role::Client => match remote_address {
                Some(address) => {
                    self.state.role = Role::Client;
                    self.phase = Phase::RoleAssigned(Role::Client);
                    vec![ArbiterAction::ConnectTransport { address }]
                }
                None => self.teardown(true),
            },
            Role::None => self.teardown(true),
        }
    }

    /// Back to Idle: close transport, release the link, mark peers disconnected.
    /// With `restart`, discovery begins again unless the session was stopped.
    fn teardown(&mut self, restart: bool) -> Vec<ArbiterAction> {
        let mut actions = vec![ArbiterAction::CloseTransport];
        match self.state.mode {
            ConnectionMode::DirectLink => actions.push(ArbiterAction::RemoveLink),
            ConnectionMode::AccessPoint if self.state.role == Role::Host => {
                actions.push(ArbiterAction::StopAccessPoint)
            }
            _ => {}
        }
        actions.push(ArbiterAction::MarkPeersDisconnected);
        self.state = ConnectionState::default();
        self.phase = Phase::Idle;
        self.initiated = None;
        self.link_peer = None;
        self.attempted.clear();
        if restart && !self.stopped {
            self.phase = Phase::Discovering;
            self.discovery_retries = 0;
            actions.push(ArbiterAction::Discover);
        }
        actions
    }
}
