//! LAN rendezvous: UDP multicast beacons stand in for the platform peer list, and
//! link_request/link_accept datagrams stand in for group formation. The same socket
//! carries message frames when no stream connection is up.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flare_core::identity::normalize_hardware_id;
use flare_core::{
    Capability, ConnectionState, DeviceId, DeviceInfo, LinkInfo, LocalIdentity, PeerStatus,
    PlatformEvent, PlatformPeer, Role, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::platform::LinkService;
use crate::transport::{Targets, Transport, TransportError};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);
const INVITE_TIMEOUT: Duration = Duration::from_secs(5);
const SYS_CLASS_NET: &str = "/sys/class/net";

/// Rendezvous datagrams. Anything that does not parse as one is a message line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Rendezvous {
    Beacon {
        protocol_version: String,
        device_id: String,
        #[serde(default)]
        hardware_id: Option<String>,
        name: String,
    },
    LinkRequest {
        device_id: String,
        hosting: bool,
    },
    LinkAccept {
        device_id: String,
        hosting: bool,
        /// Set by a linked client: the address of its group owner.
        #[serde(default)]
        owner: Option<String>,
    },
    LinkRelease {
        device_id: String,
    },
}

#[derive(Debug, Clone)]
struct Advert {
    device_id: String,
    hardware_id: Option<String>,
    name: String,
}

struct LanPeer {
    device_id: String,
    hardware_id: Option<String>,
    name: String,
    last_seen: Instant,
}

#[derive(Default)]
struct Table {
    peers: HashMap<IpAddr, LanPeer>,
    /// Addresses we are linked with: the owner when client, joined clients when host.
    members: BTreeSet<IpAddr>,
    invited: HashMap<IpAddr, oneshot::Sender<()>>,
}

impl Table {
    fn snapshot(&self) -> Vec<PlatformPeer> {
        let mut out: Vec<PlatformPeer> = self
            .peers
            .iter()
            .map(|(ip, p)| PlatformPeer {
                address: ip.to_string(),
                hardware_id: p.hardware_id.clone(),
                device_id: Some(p.device_id.clone()),
                name: p.name.clone(),
                status: if self.members.contains(ip) {
                    PeerStatus::Connected
                } else if self.invited.contains_key(ip) {
                    PeerStatus::Invited
                } else {
                    PeerStatus::Available
                },
            })
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    fn peer_id(&self, ip: &IpAddr, fallback: &str) -> DeviceId {
        let p = self.peers.get(ip);
        match p.and_then(|p| p.hardware_id.as_deref()).and_then(normalize_hardware_id) {
            Some(hw) => DeviceId::new(hw),
            None => DeviceId::new(p.map(|p| p.device_id.as_str()).unwrap_or(fallback)),
        }
    }
}

struct Shared {
    discovery_port: u16,
    advert: OnceLock<Advert>,
    table: Mutex<Table>,
    state: watch::Receiver<ConnectionState>,
    events: mpsc::UnboundedSender<PlatformEvent>,
    datagrams: mpsc::UnboundedSender<(SocketAddr, String)>,
}

pub struct LanLink {
    shared: Arc<Shared>,
    configured_hardware_id: Option<String>,
    device_name: String,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LanLink {
    pub fn new(
        discovery_port: u16,
        configured_hardware_id: Option<String>,
        device_name: String,
        state: watch::Receiver<ConnectionState>,
        events: mpsc::UnboundedSender<PlatformEvent>,
        datagrams: mpsc::UnboundedSender<(SocketAddr, String)>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                discovery_port,
                advert: OnceLock::new(),
                table: Mutex::new(Table::default()),
                state,
                events,
                datagrams,
            }),
            configured_hardware_id,
            device_name,
            socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Set what the beacons advertise. Only the first call takes effect.
    pub fn advertise_as(&self, local: &LocalIdentity) {
        let _ = self.shared.advert.set(Advert {
            device_id: local.canonical_id().to_string(),
            hardware_id: local.hardware_id().map(str::to_string),
            name: local.user_name.clone(),
        });
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), self.shared.discovery_port)
    }

    async fn send_to(&self, msg: &Rendezvous, to: SocketAddr) -> bool {
        let Some(socket) = self.socket.lock().await.clone() else {
            return false;
        };
        send_rendezvous(&socket, msg, to).await
    }
}

#[async_trait]
impl LinkService for LanLink {
    async fn discover(&self) -> Capability<()> {
        let Some(advert) = self.shared.advert.get().cloned() else {
            return Capability::Failed("local identity not advertised yet".into());
        };
        let mut slot = self.socket.lock().await;
        if slot.is_some() {
            // Already running: hand the current peer list to whoever asked again.
            let snapshot = self.shared.table.lock().await.snapshot();
            if !snapshot.is_empty() {
                let _ = self.shared.events.send(PlatformEvent::PeersChanged(snapshot));
            }
            return Capability::Available(());
        }
        let socket = match make_multicast_socket(self.shared.discovery_port) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(port = self.shared.discovery_port, error = %e, "rendezvous socket failed");
                return Capability::Failed(e.to_string());
            }
        };
        info!(port = self.shared.discovery_port, "rendezvous started");
        let group = self.group_addr();
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(beacon_loop(socket.clone(), advert, group)));
        tasks.push(tokio::spawn(recv_loop(socket.clone(), self.shared.clone())));
        tasks.push(tokio::spawn(peer_timeout_loop(self.shared.clone())));
        *slot = Some(socket);
        Capability::Available(())
    }

    async fn stop_discovery(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for t in tasks {
            t.abort();
            let _ = t.await;
        }
        self.socket.lock().await.take();
        let mut table = self.shared.table.lock().await;
        table.peers.clear();
        table.invited.clear();
        debug!("rendezvous stopped");
    }

    async fn connect(&self, address: &str) -> Capability<()> {
        let Some(advert) = self.shared.advert.get() else {
            return Capability::Failed("local identity not advertised yet".into());
        };
        let ip: IpAddr = match address.parse() {
            Ok(ip) => ip,
            Err(e) => return Capability::Failed(format!("bad address {address}: {e}")),
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.shared.table.lock().await;
            table.invited.insert(ip, tx);
            let _ = self
                .shared
                .events
                .send(PlatformEvent::PeersChanged(table.snapshot()));
        }
        let request = Rendezvous::LinkRequest {
            device_id: advert.device_id.clone(),
            hosting: self.shared.state.borrow().role == Role::Host,
        };
        let to = SocketAddr::new(ip, self.shared.discovery_port);
        if !self.send_to(&request, to).await {
            self.shared.table.lock().await.invited.remove(&ip);
            return Capability::Failed("rendezvous socket not running".into());
        }
        let answered = matches!(tokio::time::timeout(INVITE_TIMEOUT, rx).await, Ok(Ok(())));
        if answered {
            return Capability::Available(());
        }
        let mut table = self.shared.table.lock().await;
        table.invited.remove(&ip);
        let _ = self
            .shared
            .events
            .send(PlatformEvent::PeersChanged(table.snapshot()));
        Capability::Failed(format!("{address} did not answer"))
    }

    async fn create_link(&self) -> Capability<()> {
        if self.socket.lock().await.is_none() {
            return Capability::Failed("rendezvous socket not running".into());
        }
        // A group of one: we own it and peers that link to us become clients.
        let _ = self.shared.events.send(PlatformEvent::LinkChanged(LinkInfo {
            connected: true,
            group_owner: Some(true),
            ..LinkInfo::default()
        }));
        Capability::Available(())
    }

    async fn remove_link(&self) {
        let Some(advert) = self.shared.advert.get() else {
            return;
        };
        let members: Vec<IpAddr> = {
            let mut table = self.shared.table.lock().await;
            let members = std::mem::take(&mut table.members).into_iter().collect();
            let _ = self
                .shared
                .events
                .send(PlatformEvent::PeersChanged(table.snapshot()));
            members
        };
        let release = Rendezvous::LinkRelease {
            device_id: advert.device_id.clone(),
        };
        for ip in members {
            self.send_to(&release, SocketAddr::new(ip, self.shared.discovery_port))
                .await;
        }
    }

    async fn request_device_info(&self) -> Capability<DeviceInfo> {
        if let Some(raw) = &self.configured_hardware_id {
            return Capability::Available(DeviceInfo {
                hardware_id: normalize_hardware_id(raw),
                name: self.device_name.clone(),
            });
        }
        match read_interface_mac(Path::new(SYS_CLASS_NET)) {
            Ok(hardware_id) => Capability::Available(DeviceInfo {
                hardware_id,
                name: self.device_name.clone(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Capability::Unsupported,
            Err(e) => Capability::Failed(e.to_string()),
        }
    }
}

/// Datagram fallback: message lines go to the multicast group; receivers filter by target.
#[async_trait]
impl Transport for LanLink {
    fn name(&self) -> &'static str {
        "datagram"
    }

    async fn is_available(&self) -> bool {
        self.socket.lock().await.is_some() && !self.shared.table.lock().await.peers.is_empty()
    }

    async fn send(&self, line: &str, _targets: &Targets) -> Result<usize, TransportError> {
        let Some(socket) = self.socket.lock().await.clone() else {
            return Err(TransportError::NotRunning);
        };
        if self.shared.table.lock().await.peers.is_empty() {
            return Err(TransportError::NoRoute);
        }
        socket
            .send_to(line.trim_end().as_bytes(), self.group_addr())
            .await?;
        Ok(1)
    }
}

/// First non-loopback interface with a usable MAC, by interface name order.
fn read_interface_mac(root: &Path) -> std::io::Result<Option<String>> {
    let mut names: Vec<_> = std::fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    for name in names {
        if let Ok(raw) = std::fs::read_to_string(root.join(&name).join("address")) {
            if let Some(mac) = normalize_hardware_id(raw.trim()) {
                return Ok(Some(mac));
            }
        }
    }
    Ok(None)
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn send_rendezvous(socket: &UdpSocket, msg: &Rendezvous, to: SocketAddr) -> bool {
    let bytes = match serde_json::to_vec(msg) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "rendezvous encode failed");
            return false;
        }
    };
    match socket.send_to(&bytes, to).await {
        Ok(_) => true,
        Err(e) => {
            debug!(%to, error = %e, "rendezvous send failed");
            false
        }
    }
}

async fn beacon_loop(socket: Arc<UdpSocket>, advert: Advert, group: SocketAddr) {
    let beacon = Rendezvous::Beacon {
        protocol_version: PROTOCOL_VERSION.to_string(),
        device_id: advert.device_id,
        hardware_id: advert.hardware_id,
        name: advert.name,
    };
    loop {
        send_rendezvous(&socket, &beacon, group).await;
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "rendezvous receive failed");
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&buf[..n]) else {
            continue;
        };
        match serde_json::from_str::<Rendezvous>(text) {
            Ok(msg) => {
                if let Some((to, reply)) = shared.on_rendezvous(msg, from, Instant::now()).await {
                    send_rendezvous(&socket, &reply, to).await;
                }
            }
            Err(_) => {
                let _ = shared.datagrams.send((from, text.to_string()));
            }
        }
    }
}

async fn peer_timeout_loop(shared: Arc<Shared>) {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        shared.expire(Instant::now()).await;
    }
}

impl Shared {
    fn is_self(&self, device_id: &str) -> bool {
        self.advert
            .get()
            .map(|a| a.device_id == device_id)
            .unwrap_or(false)
    }

    fn hosting(&self) -> bool {
        self.state.borrow().role == Role::Host
    }

    /// Apply one rendezvous datagram; returns the reply to send, if any.
    async fn on_rendezvous(
        &self,
        msg: Rendezvous,
        from: SocketAddr,
        now: Instant,
    ) -> Option<(SocketAddr, Rendezvous)> {
        let ip = from.ip();
        match msg {
            Rendezvous::Beacon {
                protocol_version,
                device_id,
                hardware_id,
                name,
            } => {
                if protocol_version != PROTOCOL_VERSION || self.is_self(&device_id) {
                    return None;
                }
                let mut table = self.table.lock().await;
                let changed = match table.peers.get_mut(&ip) {
                    Some(p) => {
                        p.last_seen = now;
                        let changed = p.device_id != device_id || p.name != name;
                        p.device_id = device_id;
                        p.hardware_id = hardware_id;
                        p.name = name;
                        changed
                    }
                    None => {
                        debug!(%ip, %device_id, "rendezvous peer found");
                        table.peers.insert(
                            ip,
                            LanPeer {
                                device_id,
                                hardware_id,
                                name,
                                last_seen: now,
                            },
                        );
                        true
                    }
                };
                if changed {
                    let _ = self.events.send(PlatformEvent::PeersChanged(table.snapshot()));
                }
                None
            }
            Rendezvous::LinkRequest { device_id, hosting } => {
                if self.is_self(&device_id) {
                    return None;
                }
                let advert = self.advert.get()?;
                let mut table = self.table.lock().await;
                let role = self.state.borrow().role;
                let owner = match role {
                    Role::Client => table.members.iter().next().map(|ip| ip.to_string()),
                    _ => None,
                };
                if owner.is_none() {
                    table.members.insert(ip);
                    let info = LinkInfo {
                        connected: true,
                        group_owner: if hosting {
                            Some(false)
                        } else if role == Role::Host {
                            Some(true)
                        } else {
                            None
                        },
                        owner_address: hosting.then(|| ip.to_string()),
                        peer_address: Some(ip.to_string()),
                        peer_id: Some(table.peer_id(&ip, &device_id)),
                    };
                    let _ = self.events.send(PlatformEvent::LinkChanged(info));
                    let _ = self.events.send(PlatformEvent::PeersChanged(table.snapshot()));
                }
                info!(%ip, hosting, redirected = owner.is_some(), "link request accepted");
                Some((
                    from,
                    Rendezvous::LinkAccept {
                        device_id: advert.device_id.clone(),
                        hosting: role == Role::Host,
                        owner,
                    },
                ))
            }
            Rendezvous::LinkAccept {
                device_id,
                hosting,
                owner,
            } => {
                if self.is_self(&device_id) {
                    return None;
                }
                let mut table = self.table.lock().await;
                let Some(waiter) = table.invited.remove(&ip) else {
                    debug!(%ip, "unsolicited link accept");
                    return None;
                };
                let owner_ip = owner.as_deref().and_then(|o| o.parse::<IpAddr>().ok());
                let info = match (hosting, owner_ip) {
                    (true, _) => LinkInfo {
                        connected: true,
                        group_owner: Some(false),
                        owner_address: Some(ip.to_string()),
                        peer_address: Some(ip.to_string()),
                        peer_id: Some(table.peer_id(&ip, &device_id)),
                    },
                    (false, Some(owner_ip)) => LinkInfo {
                        connected: true,
                        group_owner: Some(false),
                        owner_address: Some(owner_ip.to_string()),
                        peer_address: Some(owner_ip.to_string()),
                        peer_id: None,
                    },
                    (false, None) => LinkInfo {
                        connected: true,
                        group_owner: self.hosting().then_some(true),
                        owner_address: None,
                        peer_address: Some(ip.to_string()),
                        peer_id: Some(table.peer_id(&ip, &device_id)),
                    },
                };
                table.members.insert(owner_ip.unwrap_or(ip));
                let _ = waiter.send(());
                let _ = self.events.send(PlatformEvent::LinkChanged(info));
                let _ = self.events.send(PlatformEvent::PeersChanged(table.snapshot()));
                None
            }
            Rendezvous::LinkRelease { device_id } => {
                if self.is_self(&device_id) {
                    return None;
                }
                let mut table = self.table.lock().await;
                if table.members.remove(&ip) {
                    info!(%ip, "link released by peer");
                    if table.members.is_empty() {
                        let _ = self.events.send(PlatformEvent::LinkChanged(LinkInfo::default()));
                    }
                    let _ = self.events.send(PlatformEvent::PeersChanged(table.snapshot()));
                }
                None
            }
        }
    }

    /// Drop peers that stopped beaconing; losing the last link member drops the link.
    async fn expire(&self, now: Instant) {
        let mut table = self.table.lock().await;
        let gone: Vec<IpAddr> = table
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) >= PEER_TIMEOUT)
            .map(|(ip, _)| *ip)
            .collect();
        if gone.is_empty() {
            return;
        }
        let had_members = !table.members.is_empty();
        for ip in &gone {
            debug!(%ip, "rendezvous peer timed out");
            table.peers.remove(ip);
            table.members.remove(ip);
            table.invited.remove(ip);
        }
        if had_members && table.members.is_empty() {
            let _ = self.events.send(PlatformEvent::LinkChanged(LinkInfo::default()));
        }
        let _ = self.events.send(PlatformEvent::PeersChanged(table.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flare_core::ConnectionMode;

    struct Harness {
        link: LanLink,
        state: watch::Sender<ConnectionState>,
        events: mpsc::UnboundedReceiver<PlatformEvent>,
    }

    fn harness(name: &str) -> Harness {
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (dg_tx, _dg_rx) = mpsc::unbounded_channel();
        let link = LanLink::new(45678, None, "box".into(), state_rx, ev_tx, dg_tx);
        link.advertise_as(&LocalIdentity::new(name, "box").with_hardware_id("aa:bb:cc:00:00:01"));
        Harness {
            link,
            state: state_tx,
            events: ev_rx,
        }
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 45678)
    }

    fn beacon(id: &str, hw: Option<&str>) -> Rendezvous {
        Rendezvous::Beacon {
            protocol_version: PROTOCOL_VERSION.to_string(),
            device_id: id.to_string(),
            hardware_id: hw.map(str::to_string),
            name: id.to_string(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PlatformEvent>) -> Vec<PlatformEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn beacons_build_peer_list_and_skip_self() {
        let mut h = harness("ana");
        let shared = h.link.shared.clone();
        let now = Instant::now();
        shared
            .on_rendezvous(beacon("aa:bb:cc:00:00:01", None), addr(1), now)
            .await;
        assert!(drain(&mut h.events).is_empty());

        shared
            .on_rendezvous(beacon("bo", Some("AA:BB:CC:00:00:02")), addr(2), now)
            .await;
        shared
            .on_rendezvous(beacon("bo", Some("AA:BB:CC:00:00:02")), addr(2), now)
            .await;
        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            PlatformEvent::PeersChanged(peers) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].address, "10.0.0.2");
                assert_eq!(peers[0].status, PeerStatus::Available);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_to_idle_device_links_without_owner() {
        let mut h = harness("ana");
        let shared = h.link.shared.clone();
        let now = Instant::now();
        shared
            .on_rendezvous(beacon("bo", Some("aa:bb:cc:00:00:02")), addr(2), now)
            .await;
        drain(&mut h.events);

        let reply = shared
            .on_rendezvous(
                Rendezvous::LinkRequest {
                    device_id: "bo".into(),
                    hosting: false,
                },
                addr(2),
                now,
            )
            .await;
        assert_eq!(
            reply,
            Some((
                addr(2),
                Rendezvous::LinkAccept {
                    device_id: "aa:bb:cc:00:00:01".into(),
                    hosting: false,
                    owner: None
                }
            ))
        );
        let events = drain(&mut h.events);
        assert_eq!(
            events[0],
            PlatformEvent::LinkChanged(LinkInfo {
                connected: true,
                group_owner: None,
                owner_address: None,
                peer_address: Some("10.0.0.2".into()),
                peer_id: Some(DeviceId::from("aa:bb:cc:00:00:02")),
            })
        );
    }

    #[tokio::test]
    async fn linked_client_redirects_to_its_owner() {
        let h = harness("ana");
        let shared = h.link.shared.clone();
        shared.table.lock().await.members.insert(addr(9).ip());
        h.state.send_replace(ConnectionState {
            mode: ConnectionMode::DirectLink,
            role: Role::Client,
        });
        let reply = shared
            .on_rendezvous(
                Rendezvous::LinkRequest {
                    device_id: "cy".into(),
                    hosting: false,
                },
                addr(3),
                Instant::now(),
            )
            .await;
        assert!(matches!(
            reply,
            Some((_, Rendezvous::LinkAccept { hosting: false, owner: Some(ref o), .. })) if o == "10.0.0.9"
        ));
        assert!(!shared.table.lock().await.members.contains(&addr(3).ip()));
    }

    #[tokio::test]
    async fn accept_from_host_makes_us_client() {
        let mut h = harness("ana");
        let shared = h.link.shared.clone();
        let (tx, rx) = oneshot::channel();
        shared.table.lock().await.invited.insert(addr(4).ip(), tx);
        shared
            .on_rendezvous(
                Rendezvous::LinkAccept {
                    device_id: "dee".into(),
                    hosting: true,
                    owner: None,
                },
                addr(4),
                Instant::now(),
            )
            .await;
        assert!(rx.await.is_ok());
        match &drain(&mut h.events)[0] {
            PlatformEvent::LinkChanged(info) => {
                assert_eq!(info.group_owner, Some(false));
                assert_eq!(info.owner_address.as_deref(), Some("10.0.0.4"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn losing_last_member_drops_link() {
        let mut h = harness("ana");
        let shared = h.link.shared.clone();
        let t0 = Instant::now();
        shared.on_rendezvous(beacon("bo", None), addr(2), t0).await;
        shared.table.lock().await.members.insert(addr(2).ip());
        drain(&mut h.events);

        shared.expire(t0 + Duration::from_secs(5)).await;
        assert!(drain(&mut h.events).is_empty());

        shared.expire(t0 + PEER_TIMEOUT).await;
        let events = drain(&mut h.events);
        assert_eq!(events[0], PlatformEvent::LinkChanged(LinkInfo::default()));
        assert_eq!(events[1], PlatformEvent::PeersChanged(vec![]));
    }

    #[tokio::test]
    async fn datagram_transport_needs_socket() {
        let h = harness("ana");
        assert!(!h.link.is_available().await);
        assert!(matches!(
            h.link.send("{}", &Targets::All).await,
            Err(TransportError::NotRunning)
        ));
    }

    #[test]
    fn interface_mac_skips_loopback_and_placeholder() {
        let root = std::env::temp_dir().join(format!("flare-net-{}", rand::random::<u64>()));
        for (iface, mac) in [
            ("lo", "00:00:00:00:00:00"),
            ("p2p0", "02:00:00:00:00:00"),
            ("wlan0", "3C:22:FB:10:20:30"),
        ] {
            std::fs::create_dir_all(root.join(iface)).unwrap();
            std::fs::write(root.join(iface).join("address"), format!("{mac}\n")).unwrap();
        }
        assert_eq!(
            read_interface_mac(&root).unwrap().as_deref(),
            Some("3c:22:fb:10:20:30")
        );
        std::fs::remove_dir_all(&root).unwrap();
        assert!(read_interface_mac(&root).is_err());
    }
}
