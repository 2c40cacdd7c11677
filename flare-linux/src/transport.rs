//! Transports: newline-delimited JSON over TCP (primary) behind a common `Transport` trait.
//! One reader and one writer task per connection; raw lines go to the mesh service in order.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flare_core::wire::MAX_LINE_LEN;
use flare_core::{encode_line, DeviceId, MessageHandler};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_secs(1);
const ACCEPT_RETRY: Duration = Duration::from_millis(250);
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

pub type ConnId = u64;

/// Who a send is for. Connections without a handshake-bound peer never receive sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    All,
    Only(DeviceId),
    Peers(Vec<DeviceId>),
}

impl Targets {
    pub fn includes(&self, peer: &DeviceId) -> bool {
        match self {
            Targets::All => true,
            Targets::Only(id) => id == peer,
            Targets::Peers(ids) => ids.contains(peer),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no port free in {base}..{end}")]
    BindExhausted { base: u16, end: u16 },
    #[error("could not reach {addr} after {attempts} attempts: {reason}")]
    ConnectFailed {
        addr: IpAddr,
        attempts: u32,
        reason: String,
    },
    #[error("no connected peer for this send")]
    NoRoute,
    #[error("transport is not running")]
    NotRunning,
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A message channel the mesh service can send a line through.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    /// Queue `line` for every connection the targets include. Returns how many took it.
    async fn send(&self, line: &str, targets: &Targets) -> Result<usize, TransportError>;
}

/// Connection lifecycle and raw inbound lines, consumed by a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened {
        conn: ConnId,
        addr: SocketAddr,
        outbound: bool,
    },
    Line {
        conn: ConnId,
        line: String,
    },
    Closed {
        conn: ConnId,
        peer: Option<DeviceId>,
        outbound: bool,
    },
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub base_port: u16,
    pub port_range: u16,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
}

struct Connection {
    peer: Option<DeviceId>,
    outbound: bool,
    tx: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

type Connections = Arc<Mutex<HashMap<ConnId, Connection>>>;

pub struct SocketTransport {
    settings: TransportSettings,
    connections: Connections,
    next_id: Arc<AtomicU64>,
    listener: Mutex<Option<(u16, JoinHandle<()>)>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl SocketTransport {
    pub fn new(settings: TransportSettings, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            settings,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            listener: Mutex::new(None),
            events,
        }
    }

    /// Host role: bind the first free port of the range and accept until shutdown.
    /// Returns the bound port; a second call while listening returns the same port.
    pub async fn listen(&self, ip: IpAddr) -> Result<u16, TransportError> {
        let mut slot = self.listener.lock().await;
        if let Some((port, _)) = slot.as_ref() {
            return Ok(*port);
        }
        let base = self.settings.base_port;
        let end = base.saturating_add(self.settings.port_range.max(1));
        let mut bound = None;
        for port in base..end {
            match TcpListener::bind((ip, port)).await {
                Ok(l) => {
                    bound = Some((port, l));
                    break;
                }
                Err(e) => debug!(port, error = %e, "transport port busy"),
            }
        }
        let Some((port, listener)) = bound else {
            return Err(TransportError::BindExhausted { base, end });
        };
        info!(%ip, port, "transport listening");
        let listener = Arc::new(listener);
        let handle = tokio::spawn(accept_loop(
            move || {
                let listener = listener.clone();
                async move { listener.accept().await }
            },
            self.next_id.clone(),
            self.settings.heartbeat,
            self.connections.clone(),
            self.events.clone(),
        ));
        *slot = Some((port, handle));
        Ok(port)
    }

    /// Client role: connect to the host, trying each port of the range with a bounded
    /// per-attempt timeout. `first_line` is written before anything else.
    pub async fn connect(&self, ip: IpAddr, first_line: String) -> Result<ConnId, TransportError> {
        let base = self.settings.base_port;
        let end = base.saturating_add(self.settings.port_range.max(1));
        let attempts = self.settings.connect_attempts.max(1);
        let mut reason = String::from("no attempt made");
        for attempt in 0..attempts {
            for port in base..end {
                let addr = SocketAddr::new(ip, port);
                match tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(addr))
                    .await
                {
                    Ok(Ok(stream)) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        info!(%addr, conn = id, "transport connected");
                        spawn_connection(
                            id,
                            stream,
                            addr,
                            true,
                            Some(first_line),
                            self.settings.heartbeat,
                            self.connections.clone(),
                            self.events.clone(),
                        )
                        .await;
                        return Ok(id);
                    }
                    Ok(Err(e)) => reason = e.to_string(),
                    Err(_) => reason = format!("timed out after {:?}", self.settings.connect_timeout),
                }
            }
            debug!(%ip, attempt, %reason, "transport connect attempt failed");
            if attempt + 1 < attempts {
                tokio::time::sleep(CONNECT_BACKOFF * (attempt + 1)).await;
            }
        }
        Err(TransportError::ConnectFailed {
            addr: ip,
            attempts,
            reason,
        })
    }

    /// Associate a connection with the peer its handshake resolved to.
    pub async fn bind_peer(&self, conn: ConnId, peer: DeviceId) {
        if let Some(c) = self.connections.lock().await.get_mut(&conn) {
            c.peer = Some(peer);
        }
    }

    /// Write to one connection regardless of binding; used for handshake replies.
    pub async fn send_to(&self, conn: ConnId, line: String) -> bool {
        match self.connections.lock().await.get(&conn) {
            Some(c) => c.tx.send(line).is_ok(),
            None => false,
        }
    }

    /// Peers with at least one bound connection.
    pub async fn connected_peers(&self) -> Vec<DeviceId> {
        let mut peers: Vec<DeviceId> = self
            .connections
            .lock()
            .await
            .values()
            .filter_map(|c| c.peer.clone())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub async fn has_connection_to(&self, peer: &DeviceId) -> bool {
        self.connections
            .lock()
            .await
            .values()
            .any(|c| c.peer.as_ref() == Some(peer))
    }

    /// Stop listening and close every connection; returns once all tasks have ended.
    pub async fn shutdown(&self) {
        if let Some((port, handle)) = self.listener.lock().await.take() {
            handle.abort();
            let _ = handle.await;
            debug!(port, "transport listener closed");
        }
        let drained: Vec<(ConnId, Connection)> =
            self.connections.lock().await.drain().collect();
        for (id, c) in drained {
            c.reader.abort();
            c.writer.abort();
            let _ = c.reader.await;
            let _ = c.writer.await;
            let _ = self.events.send(TransportEvent::Closed {
                conn: id,
                peer: c.peer,
                outbound: c.outbound,
            });
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn is_available(&self) -> bool {
        self.connections
            .lock()
            .await
            .values()
            .any(|c| c.peer.is_some())
    }

    async fn send(&self, line: &str, targets: &Targets) -> Result<usize, TransportError> {
        let connections = self.connections.lock().await;
        let mut sent = 0;
        for c in connections.values() {
            let Some(peer) = &c.peer else { continue };
            if targets.includes(peer) && c.tx.send(line.to_string()).is_ok() {
                sent += 1;
            }
        }
        if sent == 0 {
            return Err(TransportError::NoRoute);
        }
        Ok(sent)
    }
}

/// Accepts until the task is aborted. A failed accept (fd limit, aborted handshake)
/// is logged and retried after a pause.
async fn accept_loop<F, Fut>(
    mut accept: F,
    next_id: Arc<AtomicU64>,
    heartbeat: Duration,
    connections: Connections,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        match tokio::time::timeout(ACCEPT_POLL, accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, addr))) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                spawn_connection(
                    id,
                    stream,
                    addr,
                    false,
                    None,
                    heartbeat,
                    connections.clone(),
                    events.clone(),
                )
                .await;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "accept failed, retrying");
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn spawn_connection(
    id: ConnId,
    stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
    first_line: Option<String>,
    heartbeat: Duration,
    connections: Connections,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let _ = events.send(TransportEvent::Opened { conn: id, addr, outbound });
    // Held until the entry is inserted so the reader's cleanup always finds it.
    let mut table = connections.lock().await;

    let writer_task = tokio::spawn(write_loop(id, writer, rx, first_line, heartbeat));

    let reader_connections = connections.clone();
    let reader_events = events.clone();
    let reader_task = tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LEN));
        let dead_after = heartbeat * 2;
        loop {
            match tokio::time::timeout(dead_after, lines.next()).await {
                Ok(Some(Ok(line))) => {
                    if reader_events
                        .send(TransportEvent::Line { conn: id, line })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    warn!(conn = id, "dropping oversized line");
                }
                Ok(Some(Err(LinesCodecError::Io(e)))) => {
                    debug!(conn = id, error = %e, "connection read failed");
                    break;
                }
                Ok(None) => {
                    debug!(conn = id, "connection closed by peer");
                    break;
                }
                Err(_) => {
                    info!(conn = id, "no traffic for {:?}, channel dead", dead_after);
                    break;
                }
            }
        }
        let removed = reader_connections.lock().await.remove(&id);
        if let Some(c) = removed {
            c.writer.abort();
            let _ = reader_events.send(TransportEvent::Closed {
                conn: id,
                peer: c.peer,
                outbound: c.outbound,
            });
        }
    });

    table.insert(
        id,
        Connection {
            peer: None,
            outbound,
            tx,
            reader: reader_task,
            writer: writer_task,
        },
    );
}

/// Drains queued lines; when idle for a heartbeat interval, writes a heartbeat instead.
async fn write_loop(
    id: ConnId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
    first_line: Option<String>,
    heartbeat: Duration,
) {
    if let Some(line) = first_line {
        if let Err(e) = write_line(&mut writer, &line, heartbeat).await {
            debug!(conn = id, error = %e, "handshake write failed");
            return;
        }
    }
    loop {
        let line = match tokio::time::timeout(heartbeat, rx.recv()).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(_) => match encode_line(&MessageHandler::heartbeat_frame()) {
                Ok(l) => l,
                Err(_) => continue,
            },
        };
        if let Err(e) = write_line(&mut writer, &line, heartbeat).await {
            debug!(conn = id, error = %e, "connection write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_line(
    writer: &mut OwnedWriteHalf,
    line: &str,
    limit: Duration,
) -> std::io::Result<()> {
    let write = async {
        writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n").await?;
        }
        writer.flush().await
    };
    match tokio::time::timeout(limit, write).await {
        Ok(r) => r,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timed out",
        )),
    }
}
