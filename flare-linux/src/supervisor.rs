//! Link supervisor: the one task that owns the `ConnectionArbitrator`. Platform events are
//! debounced here, arbitrator actions are executed against the platform services and the
//! socket transport, and every state change is published on a watch channel.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flare_core::{
    ArbiterAction, ArbiterEvent, Capability, ConnectionArbitrator, ConnectionMode,
    ConnectionState, Debouncer, DeviceId, LinkFailure, Phase, PlatformEvent, Role,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mesh::MeshService;
use crate::platform::{AccessPointService, LinkService};
use crate::transport::SocketTransport;

/// What the message side reports back about connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    HandshakeCompleted(DeviceId),
    ConnectionClosed { outbound: bool },
}

enum Command {
    Start,
    CreateGroup,
    Stop(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SupervisorHandle {
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Host a group now instead of waiting for a peer.
    pub fn create_group(&self) {
        let _ = self.commands.send(Command::CreateGroup);
    }

    /// Cancel in-flight attempts and release the link, transport and discovery session.
    /// Returns after they are released.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

pub struct LinkSupervisor {
    arbitrator: ConnectionArbitrator,
    debouncer: Debouncer,
    link: Arc<dyn LinkService>,
    access_point: Arc<dyn AccessPointService>,
    mesh: Arc<MeshService>,
    sockets: Arc<SocketTransport>,
    state: watch::Sender<ConnectionState>,
    failures: mpsc::UnboundedSender<LinkFailure>,
    feedback: mpsc::UnboundedSender<ArbiterEvent>,
    inflight: Vec<JoinHandle<()>>,
}

impl LinkSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        arbitrator: ConnectionArbitrator,
        debounce: Duration,
        link: Arc<dyn LinkService>,
        access_point: Arc<dyn AccessPointService>,
        mesh: Arc<MeshService>,
        sockets: Arc<SocketTransport>,
        state: watch::Sender<ConnectionState>,
        failures: mpsc::UnboundedSender<LinkFailure>,
        platform: mpsc::UnboundedReceiver<PlatformEvent>,
        notices: mpsc::UnboundedReceiver<LinkNotice>,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle {
            commands: commands_tx,
            state: state.subscribe(),
        };
        let supervisor = LinkSupervisor {
            arbitrator,
            debouncer: Debouncer::new(debounce),
            link,
            access_point,
            mesh,
            sockets,
            state,
            failures,
            feedback: feedback_tx,
            inflight: Vec::new(),
        };
        let task = tokio::spawn(supervisor.run(commands_rx, feedback_rx, platform, notices));
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut feedback: mpsc::UnboundedReceiver<ArbiterEvent>,
        mut platform: mpsc::UnboundedReceiver<PlatformEvent>,
        mut notices: mpsc::UnboundedReceiver<LinkNotice>,
    ) {
        loop {
            let deadline = self.debouncer.next_deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Start) => self.dispatch(ArbiterEvent::Start).await,
                    Some(Command::CreateGroup) => self.dispatch(ArbiterEvent::CreateGroup).await,
                    Some(Command::Stop(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(event) = platform.recv() => self.debouncer.offer(event, now()),
                Some(event) = feedback.recv() => self.dispatch(event).await,
                Some(notice) = notices.recv() => self.on_notice(notice).await,
                _ = wait_until(deadline) => {
                    for event in self.debouncer.due(now()) {
                        if let PlatformEvent::PeersChanged(peers) = &event {
                            self.mesh.refresh_peers(peers).await;
                        }
                        self.dispatch(ArbiterEvent::Platform(event)).await;
                    }
                }
            }
        }
        debug!("link supervisor exited");
    }

    async fn on_notice(&mut self, notice: LinkNotice) {
        match notice {
            LinkNotice::HandshakeCompleted(peer) => {
                let was_active = self.arbitrator.phase() == Phase::Active;
                self.dispatch(ArbiterEvent::HandshakeCompleted(peer)).await;
                if !was_active && self.arbitrator.phase() == Phase::Active {
                    if let Some(link_peer) = self.arbitrator.link_peer() {
                        info!(peer = %link_peer, "link active");
                    }
                }
            }
            // A host outlives its clients; a client has only the one connection.
            LinkNotice::ConnectionClosed { outbound } => {
                if outbound && self.arbitrator.state().role == Role::Client {
                    self.dispatch(ArbiterEvent::TransportFailed).await;
                }
            }
        }
    }

    async fn stop(&mut self) {
        for task in self.inflight.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.debouncer.clear();
        self.dispatch(ArbiterEvent::Stop).await;
        info!("link stopped");
    }

    async fn dispatch(&mut self, event: ArbiterEvent) {
        let before = self.arbitrator.phase();
        for action in self.arbitrator.handle(event) {
            self.execute(action).await;
        }
        let after = self.arbitrator.phase();
        if before != after {
            debug!(?before, ?after, "link phase");
        }
        let state = self.arbitrator.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!(mode = ?state.mode, role = ?state.role, "connection state");
            *current = state;
            true
        });
    }

    fn spawn_op(&mut self, op: impl Future<Output = ()> + Send + 'static) {
        self.inflight.retain(|t| !t.is_finished());
        self.inflight.push(tokio::spawn(op));
    }

    async fn execute(&mut self, action: ArbiterAction) {
        let feedback = self.feedback.clone();
        match action {
            ArbiterAction::Discover => {
                let link = self.link.clone();
                self.spawn_op(async move {
                    let result = link.discover().await;
                    let _ = feedback.send(ArbiterEvent::DiscoveryResult(result));
                });
            }
            ArbiterAction::ScheduleDiscoveryRetry(delay) => {
                debug!(?delay, "discovery retry scheduled");
                self.spawn_op(async move {
                    tokio::time::sleep(delay).await;
                    let _ = feedback.send(ArbiterEvent::RetryDiscovery);
                });
            }
            ArbiterAction::StopDiscovery => self.link.stop_discovery().await,
            ArbiterAction::Connect { address } => {
                info!(%address, "linking to peer");
                let link = self.link.clone();
                self.spawn_op(async move {
                    let result = link.connect(&address).await;
                    let _ = feedback.send(ArbiterEvent::ConnectResult { address, result });
                });
            }
            ArbiterAction::CreateLink => {
                let link = self.link.clone();
                let failures = self.failures.clone();
                self.spawn_op(async move {
                    match link.create_link().await {
                        Capability::Available(()) => {}
                        Capability::Failed(reason) => warn!(%reason, "create link failed"),
                        Capability::Unsupported => {
                            let _ = failures.send(LinkFailure::Unsupported("create link"));
                        }
                    }
                });
            }
            ArbiterAction::RemoveLink => self.link.remove_link().await,
            ArbiterAction::StartAccessPoint => {
                let ap = self.access_point.clone();
                self.spawn_op(async move {
                    let result = ap.create().await;
                    let started = result.is_available();
                    let _ = feedback.send(ArbiterEvent::AccessPointResult(result));
                    if started {
                        let _ = feedback.send(ArbiterEvent::Platform(PlatformEvent::AccessPointStarted));
                    }
                });
            }
            ArbiterAction::StopAccessPoint => self.access_point.stop().await,
            ArbiterAction::OpenHost => {
                if self.arbitrator.state().mode == ConnectionMode::AccessPoint {
                    let clients = self.access_point.clients().await;
                    debug!(count = clients.len(), "access point clients");
                }
                let event = match self.sockets.listen(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await {
                    Ok(_) => ArbiterEvent::TransportEstablished,
                    Err(e) => {
                        warn!(error = %e, "cannot open host transport");
                        ArbiterEvent::TransportFailed
                    }
                };
                let _ = feedback.send(event);
            }
            ArbiterAction::ConnectTransport { address } => {
                let ip: IpAddr = match address.parse() {
                    Ok(ip) => ip,
                    Err(e) => {
                        warn!(%address, error = %e, "host address unusable");
                        let _ = feedback.send(ArbiterEvent::TransportFailed);
                        return;
                    }
                };
                let Some(hello) = self.mesh.handshake_line().await else {
                    let _ = feedback.send(ArbiterEvent::TransportFailed);
                    return;
                };
                let sockets = self.sockets.clone();
                self.spawn_op(async move {
                    let event = match sockets.connect(ip, hello).await {
                        Ok(_) => ArbiterEvent::TransportEstablished,
                        Err(e) => {
                            warn!(error = %e, "cannot reach host");
                            ArbiterEvent::TransportFailed
                        }
                    };
                    let _ = feedback.send(event);
                });
            }
            ArbiterAction::CloseTransport => self.sockets.shutdown().await,
            ArbiterAction::MarkPeersDisconnected => self.mesh.mark_all_disconnected().await,
            ArbiterAction::Failure(failure) => {
                warn!(?failure, "link failure");
                let _ = self.failures.send(failure);
            }
        }
    }
}

/// Debounce clock; follows tokio's clock so paused-time tests see it advance.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::UnsupportedAccessPoint;
    use crate::router::Router;
    use crate::transport::TransportSettings;
    use async_trait::async_trait;
    use flare_core::{
        DeviceInfo, LinkInfo, LocalIdentity, MemoryStore, MessageHandler, PeerStatus,
        PendingQueue, PlatformPeer,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeLink {
        discover_results: StdMutex<VecDeque<Capability<()>>>,
        calls: StdMutex<Vec<String>>,
    }

    impl FakeLink {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LinkService for FakeLink {
        async fn discover(&self) -> Capability<()> {
            self.record("discover".into());
            self.discover_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Capability::Available(()))
        }

        async fn stop_discovery(&self) {
            self.record("stop_discovery".into());
        }

        async fn connect(&self, address: &str) -> Capability<()> {
            self.record(format!("connect {address}"));
            Capability::Available(())
        }

        async fn create_link(&self) -> Capability<()> {
            self.record("create_link".into());
            Capability::Available(())
        }

        async fn remove_link(&self) {
            self.record("remove_link".into());
        }

        async fn request_device_info(&self) -> Capability<DeviceInfo> {
            Capability::Unsupported
        }
    }

    struct Rig {
        link: Arc<FakeLink>,
        handle: SupervisorHandle,
        platform: mpsc::UnboundedSender<PlatformEvent>,
        failures: mpsc::UnboundedReceiver<LinkFailure>,
    }

    fn rig(base_port: u16, discover_results: Vec<Capability<()>>) -> Rig {
        let link = Arc::new(FakeLink {
            discover_results: StdMutex::new(discover_results.into()),
            ..FakeLink::default()
        });
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let sockets = Arc::new(SocketTransport::new(
            TransportSettings {
                base_port,
                port_range: 3,
                heartbeat: Duration::from_secs(10),
                connect_timeout: Duration::from_secs(1),
                connect_attempts: 1,
            },
            ev_tx,
        ));
        let local = LocalIdentity::new("ana", "test").with_hardware_id("aa:00:00:00:00:09");
        let local_id = local.canonical_id();
        let (router, _post) = Router::new();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let mesh = Arc::new(MeshService::new(
            MessageHandler::new(local, Duration::from_secs(5), 3),
            PendingQueue::default(),
            Arc::new(MemoryStore::new()),
            sockets.clone(),
            None,
            router,
            notice_tx,
            Duration::from_secs(1),
        ));
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let (handle, _task) = LinkSupervisor::spawn(
            ConnectionArbitrator::new(local_id),
            Duration::from_millis(300),
            link.clone(),
            Arc::new(UnsupportedAccessPoint),
            mesh,
            sockets,
            state_tx,
            failure_tx,
            platform_rx,
            notice_rx,
        );
        Rig {
            link,
            handle,
            platform: platform_tx,
            failures: failure_rx,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition in time");
    }

    fn peer(address: &str) -> PlatformPeer {
        PlatformPeer {
            address: address.into(),
            hardware_id: None,
            device_id: None,
            name: "peer".into(),
            status: PeerStatus::Available,
        }
    }

    #[tokio::test]
    async fn debounced_peer_list_triggers_one_connect() {
        let rig = rig(38310, vec![]);
        rig.handle.start();
        eventually(|| rig.link.calls().contains(&"discover".to_string())).await;

        for n in 1..=3 {
            let peers = (1..=n).map(|i| peer(&format!("10.0.0.{i}"))).collect();
            let _ = rig.platform.send(PlatformEvent::PeersChanged(peers));
        }
        eventually(|| rig.link.calls().iter().any(|c| c.starts_with("connect"))).await;
        let connects: Vec<String> = rig
            .link
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("connect"))
            .collect();
        assert_eq!(connects, vec!["connect 10.0.0.1".to_string()]);
        rig.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_discovery_reports_failure() {
        let failed = || Capability::Failed("radio busy".into());
        let mut rig = rig(38330, vec![failed(), failed(), failed(), failed()]);
        rig.handle.start();
        let failure = tokio::time::timeout(Duration::from_secs(60), rig.failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure, LinkFailure::DiscoveryExhausted("radio busy".into()));
        let discovers = rig.link.calls().iter().filter(|c| *c == "discover").count();
        assert_eq!(discovers, 4);
        // The strategy selected for Linux has no access point to fall back to.
        assert!(rig.failures.try_recv().is_err());
        rig.handle.stop().await;
    }

    #[tokio::test]
    async fn owner_link_opens_host_and_stop_releases() {
        let rig = rig(38350, vec![]);
        rig.handle.start();
        let _ = rig
            .platform
            .send(PlatformEvent::LinkChanged(LinkInfo {
                connected: true,
                group_owner: Some(true),
                ..LinkInfo::default()
            }));
        let mut state = rig.handle.watch();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.role == Role::Host))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rig.handle.state().mode, ConnectionMode::DirectLink);

        rig.handle.stop().await;
        assert_eq!(rig.handle.state(), ConnectionState::default());
        let calls = rig.link.calls();
        assert!(calls.contains(&"remove_link".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("stop_discovery"));
    }

    #[tokio::test]
    async fn create_group_asks_platform() {
        let rig = rig(38370, vec![]);
        rig.handle.start();
        rig.handle.create_group();
        eventually(|| rig.link.calls().contains(&"create_link".to_string())).await;
        rig.handle.stop().await;
    }
}
