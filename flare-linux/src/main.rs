// Flare Linux: LAN rendezvous, socket transport and message relay daemon.

mod config;
mod console;
mod journal;
mod lan;
mod mesh;
mod platform;
mod router;
mod supervisor;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use flare_core::dedup::DEFAULT_DEDUP_WINDOW;
use flare_core::pending::DEFAULT_PENDING_CAPACITY;
use flare_core::{
    Capability, ConnectionArbitrator, ConnectionState, LocalIdentity, MemoryStore,
    MessageHandler, MessageStore, PendingQueue,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::lan::LanLink;
use crate::mesh::MeshService;
use crate::platform::LinkService;
use crate::router::Router;
use crate::supervisor::LinkSupervisor;
use crate::transport::{SocketTransport, Transport, TransportSettings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut name_override = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("flare-linux {}", VERSION);
                return Ok(());
            }
            "--name" => {
                name_override = Some(args.next().context("--name needs a value")?);
            }
            other => anyhow::bail!("unknown argument {other}"),
        }
    }

    let mut cfg = config::load();
    if let Some(name) = name_override {
        cfg.user_name = name;
    }
    init_tracing(&cfg.log_level);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let (state_tx, state_rx) = watch::channel(ConnectionState::default());
    let (platform_tx, platform_rx) = mpsc::unbounded_channel();
    let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let (failure_tx, failure_rx) = mpsc::unbounded_channel();

    let lan = Arc::new(LanLink::new(
        cfg.discovery_port,
        cfg.hardware_id.clone(),
        cfg.device_name.clone(),
        state_rx,
        platform_tx,
        datagram_tx,
    ));

    let mut local = LocalIdentity::new(cfg.user_name.clone(), cfg.device_name.clone());
    match lan.request_device_info().await {
        Capability::Available(info) => match info.hardware_id {
            Some(hw) => local = local.with_hardware_id(&hw),
            None => warn!("no hardware identifier found, using an ephemeral id"),
        },
        Capability::Failed(reason) => warn!(%reason, "device info unavailable, using an ephemeral id"),
        Capability::Unsupported => warn!("device info unsupported, using an ephemeral id"),
    }
    lan.advertise_as(&local);
    let local_id = local.canonical_id();
    info!(id = %local_id, user = %local.user_name, version = VERSION, "flare starting");

    let store: Arc<dyn MessageStore> = match journal::JournalStore::open(&cfg.data_dir) {
        Ok(j) => {
            info!(path = %j.path().display(), "message journal open");
            Arc::new(j)
        }
        Err(e) => {
            warn!(dir = %cfg.data_dir.display(), error = %e, "journal unavailable, keeping messages in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let sockets = Arc::new(SocketTransport::new(
        TransportSettings {
            base_port: cfg.transport_base_port,
            port_range: cfg.port_range,
            heartbeat: cfg.heartbeat(),
            connect_timeout: cfg.connect_timeout(),
            connect_attempts: cfg.connect_attempts,
        },
        transport_tx,
    ));
    let (router, post_rx) = Router::new();
    let inbox = router.set_listener().await;
    let fallback: Arc<dyn Transport> = lan.clone();
    let mesh = Arc::new(MeshService::new(
        MessageHandler::new(local, DEFAULT_DEDUP_WINDOW, cfg.default_ttl),
        PendingQueue::new(DEFAULT_PENDING_CAPACITY),
        store,
        sockets.clone(),
        Some(fallback),
        router,
        notice_tx,
        cfg.send_timeout(),
    ));
    mesh.restore_pending().await;

    tokio::spawn(mesh.clone().run_transport_events(transport_rx));
    tokio::spawn(mesh.clone().run_datagrams(datagram_rx));
    tokio::spawn(mesh.clone().run_post_delivery(post_rx));

    let (access_point, ap_capable) = platform::select_access_point();
    info!(strategy = access_point.name(), "access point strategy");
    let mut arbitrator = ConnectionArbitrator::new(local_id);
    arbitrator.set_access_point_capable(ap_capable);
    let (link, supervisor_task) = LinkSupervisor::spawn(
        arbitrator,
        cfg.debounce(),
        lan,
        access_point,
        mesh.clone(),
        sockets,
        state_tx,
        failure_tx,
        platform_rx,
        notice_rx,
    );
    link.start();

    tokio::spawn(console::run_output(inbox, failure_rx, link.watch()));
    tokio::spawn(console::run_input(mesh.clone(), link.clone()));

    shutdown_signal().await?;
    info!("shutting down");
    link.stop().await;
    mesh.router().clear_listener().await;
    drop(link);
    supervisor_task.abort();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
