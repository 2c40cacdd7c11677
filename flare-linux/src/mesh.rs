//! Mesh service: the session's message side. Consumes transport events in arrival order,
//! runs them through the core handler, and owns outbound send, relaying and the
//! opportunistic flush of the pending queue.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flare_core::identity::now_millis;
use flare_core::{
    decode_line, encode_line, DeviceId, DeviceIdentity, DiscoveryMethod, HandlerAction, Inbound,
    LinkContext, Location, MessageEnvelope, MessageHandler, MessageStatus, MessageStore,
    MessageType, PeerDirectory, PendingQueue, PlatformPeer,
};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::router::{Delivered, Router};
use crate::supervisor::LinkNotice;
use crate::transport::{ConnId, SocketTransport, Targets, Transport, TransportEvent};

/// Outcome of one outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Both transports failed; stored as failed and queued for the next successful send.
    Queued,
    /// The message can never be encoded on the wire.
    Rejected,
}

pub struct MeshService {
    handler: Mutex<MessageHandler>,
    directory: Mutex<PeerDirectory>,
    pending: Mutex<PendingQueue>,
    links: Mutex<HashMap<ConnId, LinkContext>>,
    datagram_links: Mutex<HashMap<IpAddr, LinkContext>>,
    store: Arc<dyn MessageStore>,
    sockets: Arc<SocketTransport>,
    fallback: Option<Arc<dyn Transport>>,
    router: Router,
    notices: mpsc::UnboundedSender<LinkNotice>,
    send_timeout: Duration,
    flushing: AtomicBool,
}

impl MeshService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler: MessageHandler,
        pending: PendingQueue,
        store: Arc<dyn MessageStore>,
        sockets: Arc<SocketTransport>,
        fallback: Option<Arc<dyn Transport>>,
        router: Router,
        notices: mpsc::UnboundedSender<LinkNotice>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            handler: Mutex::new(handler),
            directory: Mutex::new(PeerDirectory::new()),
            pending: Mutex::new(pending),
            links: Mutex::new(HashMap::new()),
            datagram_links: Mutex::new(HashMap::new()),
            store,
            sockets,
            fallback,
            router,
            notices,
            send_timeout,
            flushing: AtomicBool::new(false),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub async fn local_id(&self) -> DeviceId {
        self.handler.lock().await.local_id().clone()
    }

    /// First line a client writes on a new connection.
    pub async fn handshake_line(&self) -> Option<String> {
        let frame = self.handler.lock().await.handshake_frame();
        match encode_line(&frame) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(error = %e, "cannot encode handshake");
                None
            }
        }
    }

    /// Re-enqueue messages a previous session never delivered.
    pub async fn restore_pending(&self) -> usize {
        let undelivered = match self.store.undelivered() {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "cannot read undelivered messages");
                return 0;
            }
        };
        let count = undelivered.len();
        let now = Instant::now();
        let mut handler = self.handler.lock().await;
        let mut pending = self.pending.lock().await;
        for env in undelivered {
            handler.remember_outbound(&env, now);
            pending.push(env, now_millis());
        }
        if count > 0 {
            info!(count, "restored undelivered messages");
        }
        count
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn refresh_peers(&self, peers: &[PlatformPeer]) {
        self.directory
            .lock()
            .await
            .refresh(peers, DiscoveryMethod::DirectLink, now_millis());
    }

    pub async fn mark_all_disconnected(&self) {
        let gone = self.directory.lock().await.mark_all_disconnected();
        if !gone.is_empty() {
            info!(count = gone.len(), "peers marked disconnected");
        }
    }

    pub async fn connected_peers(&self) -> Vec<DeviceId> {
        self.sockets.connected_peers().await
    }

    pub async fn identities(&self) -> Vec<DeviceIdentity> {
        self.directory.lock().await.identities()
    }

    /// Compose, persist and transmit. Returns once the message is sent or queued.
    pub async fn send(
        &self,
        target: Option<DeviceId>,
        message_type: MessageType,
        text: impl Into<String>,
        location: Option<Location>,
    ) -> (MessageEnvelope, SendOutcome) {
        let env = self.handler.lock().await.compose(
            target,
            message_type,
            text,
            location,
            Instant::now(),
        );
        let outcome = self.dispatch(&env).await;
        (env, outcome)
    }

    /// Like `send`, but the network work runs on its own task.
    pub fn submit(
        self: &Arc<Self>,
        target: Option<DeviceId>,
        message_type: MessageType,
        text: String,
    ) -> tokio::task::JoinHandle<SendOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.send(target, message_type, text, None).await.1 })
    }

    async fn dispatch(&self, env: &MessageEnvelope) -> SendOutcome {
        if let Err(e) = self.store.insert(env, MessageStatus::Pending) {
            warn!(id = %env.message_id, error = %e, "cannot persist outbound message");
        }
        let line = match encode_line(&env.to_frame()) {
            Ok(l) => l,
            Err(e) => {
                warn!(id = %env.message_id, error = %e, "message rejected");
                self.mark(&env.message_id, MessageStatus::Failed);
                return SendOutcome::Rejected;
            }
        };
        if self.transmit(&line, &targets_for(env), true).await {
            self.mark(&env.message_id, MessageStatus::Sent);
            self.flush_pending().await;
            return SendOutcome::Sent;
        }
        self.mark(&env.message_id, MessageStatus::Failed);
        let evicted = self.pending.lock().await.push(env.clone(), now_millis());
        if let Some(old) = evicted {
            warn!(id = %old.payload.message_id, "pending queue full, oldest message dropped");
        }
        debug!(id = %env.message_id, "send failed, queued");
        SendOutcome::Queued
    }

    /// Retry every queued message once; failures keep their place for the next opportunity.
    pub async fn flush_pending(&self) {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries = self.pending.lock().await.take_all();
        if !entries.is_empty() {
            debug!(count = entries.len(), "flushing pending messages");
        }
        let mut failed = Vec::new();
        for entry in entries {
            let Ok(line) = encode_line(&entry.payload.to_frame()) else {
                continue;
            };
            if self.transmit(&line, &targets_for(&entry.payload), false).await {
                self.mark(&entry.payload.message_id, MessageStatus::Sent);
            } else {
                failed.push(entry);
            }
        }
        {
            let mut pending = self.pending.lock().await;
            for entry in failed.into_iter().rev() {
                pending.requeue(entry);
            }
        }
        self.flushing.store(false, Ordering::Release);
    }

    fn mark(&self, message_id: &str, status: MessageStatus) {
        if let Err(e) = self.store.update_status(message_id, status) {
            warn!(id = message_id, status = status.as_str(), error = %e, "status update failed");
        }
    }

    /// Primary then fallback, each bounded by the send timeout; `retry` allows one more round.
    async fn transmit(&self, line: &str, targets: &Targets, retry: bool) -> bool {
        let rounds = if retry { 2 } else { 1 };
        for round in 0..rounds {
            if round > 0 {
                let jitter = rand::thread_rng().gen_range(100..400);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            if self.try_on(self.sockets.as_ref(), line, targets).await {
                return true;
            }
            if let Some(fallback) = &self.fallback {
                if self.try_on(fallback.as_ref(), line, targets).await {
                    return true;
                }
            }
        }
        false
    }

    async fn try_on(&self, transport: &dyn Transport, line: &str, targets: &Targets) -> bool {
        if !transport.is_available().await {
            return false;
        }
        match tokio::time::timeout(self.send_timeout, transport.send(line, targets)).await {
            Ok(Ok(n)) => n > 0,
            Ok(Err(e)) => {
                debug!(transport = transport.name(), error = %e, "send failed");
                false
            }
            Err(_) => {
                debug!(transport = transport.name(), "send timed out");
                false
            }
        }
    }

    /// Consume transport events until the channel closes.
    pub async fn run_transport_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            self.on_transport_event(event).await;
        }
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Opened { conn, addr, .. } => {
                self.links
                    .lock()
                    .await
                    .insert(conn, LinkContext::new(addr.ip().to_string()));
            }
            TransportEvent::Line { conn, line } => {
                let Some(inbound) = decode_line(&line) else {
                    return;
                };
                let Some(mut ctx) = self.links.lock().await.get(&conn).cloned() else {
                    return;
                };
                let actions = self.apply_inbound(&mut ctx, inbound).await;
                self.links.lock().await.insert(conn, ctx);
                self.perform(actions, Some(conn)).await;
            }
            TransportEvent::Closed {
                conn,
                peer,
                outbound,
            } => {
                let ctx = self.links.lock().await.remove(&conn);
                if let Some(peer) = peer.or_else(|| ctx.and_then(|c| c.peer)) {
                    if !self.sockets.has_connection_to(&peer).await
                        && self.directory.lock().await.mark_disconnected(&peer)
                    {
                        info!(%peer, "peer disconnected");
                    }
                }
                let _ = self.notices.send(LinkNotice::ConnectionClosed { outbound });
            }
        }
    }

    /// Consume message lines that arrived over the datagram fallback.
    pub async fn run_datagrams(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(SocketAddr, String)>) {
        while let Some((from, line)) = rx.recv().await {
            let Some(inbound) = decode_line(&line) else {
                continue;
            };
            let ip = from.ip();
            let mut ctx = self
                .datagram_links
                .lock()
                .await
                .get(&ip)
                .cloned()
                .unwrap_or_else(|| LinkContext::new(ip.to_string()));
            let actions = self.apply_inbound(&mut ctx, inbound).await;
            self.datagram_links.lock().await.insert(ip, ctx);
            self.perform(actions, None).await;
        }
    }

    async fn apply_inbound(&self, ctx: &mut LinkContext, inbound: Inbound) -> Vec<HandlerAction> {
        let mut handler = self.handler.lock().await;
        let mut directory = self.directory.lock().await;
        handler.on_inbound(&mut directory, ctx, inbound, Instant::now())
    }

    async fn perform(self: &Arc<Self>, actions: Vec<HandlerAction>, conn: Option<ConnId>) {
        for action in actions {
            match action {
                HandlerAction::Reply(frame) => {
                    let Some(conn) = conn else { continue };
                    match encode_line(&frame) {
                        Ok(line) => {
                            if !self.sockets.send_to(conn, line).await {
                                debug!(conn, "reply target already closed");
                            }
                        }
                        Err(e) => warn!(error = %e, "cannot encode reply"),
                    }
                }
                HandlerAction::PeerRegistered {
                    peer,
                    newly_connected,
                } => {
                    if let Some(conn) = conn {
                        self.sockets.bind_peer(conn, peer.clone()).await;
                    }
                    let _ = self.notices.send(LinkNotice::HandshakeCompleted(peer.clone()));
                    if newly_connected {
                        info!(%peer, "peer connected");
                        let this = self.clone();
                        tokio::spawn(async move { this.flush_pending().await });
                    }
                }
                HandlerAction::Deliver { envelope, via } => {
                    self.router.route(envelope, via).await;
                }
            }
        }
    }

    /// Persist and relay what the router delivered, one message at a time in arrival order.
    pub async fn run_post_delivery(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Delivered>) {
        while let Some(delivered) = rx.recv().await {
            if let Err(e) = self
                .store
                .insert(&delivered.envelope, MessageStatus::Received)
            {
                warn!(id = %delivered.envelope.message_id, error = %e, "cannot persist inbound message");
            }
            let this = self.clone();
            tokio::spawn(async move { this.relay(delivered).await });
        }
    }

    async fn relay(&self, delivered: Delivered) {
        let Some(relayed) = self.handler.lock().await.prepare_forward(&delivered.envelope) else {
            return;
        };
        let connected = self.directory.lock().await.connected();
        let targets =
            MessageHandler::forward_targets(&connected, &relayed, delivered.via.as_ref());
        if targets.is_empty() {
            return;
        }
        let Ok(line) = encode_line(&relayed.to_frame()) else {
            return;
        };
        if self.transmit(&line, &Targets::Peers(targets), true).await {
            debug!(id = %relayed.message_id, ttl = relayed.ttl, "message relayed");
            self.flush_pending().await;
        } else {
            debug!(id = %relayed.message_id, "relay dropped");
        }
    }
}

/// Emergency messages are flooded even when addressed.
fn targets_for(env: &MessageEnvelope) -> Targets {
    match &env.target_id {
        Some(target) if !env.is_emergency => Targets::Only(target.clone()),
        _ => Targets::All,
    }
}
