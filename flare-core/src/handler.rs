//! Message handler: handshake registration, duplicate suppression and forwarding decisions.
//! Host-driven: the host passes each decoded line with its link context and performs the
//! returned actions. Sending, retry and persistence belong to the host.

use std::time::{Duration, Instant};

use crate::dedup::DedupCache;
use crate::directory::PeerDirectory;
use crate::identity::{now_millis, DeviceId, DiscoveryMethod, LocalIdentity};
use crate::message::{Location, MessageEnvelope};
use crate::protocol::{DataMessage, Frame, Handshake, MessageType, PROTOCOL_VERSION};
use crate::wire::Inbound;

/// Per-connection state, owned by whoever reads that connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkContext {
    /// Remote transport address (IP for sockets).
    pub address: String,
    /// Canonical id of the remote device once its handshake was processed.
    pub peer: Option<DeviceId>,
    /// We already answered this connection's handshake.
    pub responded: bool,
}

impl LinkContext {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            peer: None,
            responded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerAction {
    /// Write this frame back on the same connection.
    Reply(Frame),
    /// The connection now belongs to `peer`.
    PeerRegistered {
        peer: DeviceId,
        newly_connected: bool,
    },
    /// Hand to the router. `via` is the neighbour it arrived from, excluded when forwarding.
    Deliver {
        envelope: MessageEnvelope,
        via: Option<DeviceId>,
    },
}

pub struct MessageHandler {
    local: LocalIdentity,
    local_id: DeviceId,
    dedup: DedupCache,
    default_ttl: u8,
}

impl MessageHandler {
    pub fn new(local: LocalIdentity, dedup_window: Duration, default_ttl: u8) -> Self {
        let local_id = local.canonical_id();
        Self {
            local,
            local_id,
            dedup: DedupCache::new(dedup_window),
            default_ttl: default_ttl.max(1),
        }
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn local_id(&self) -> &DeviceId {
        &self.local_id
    }

    fn identity_fields(&self) -> Handshake {
        Handshake {
            device_id: self.local.ephemeral_id().to_string(),
            mac_address: self.local.hardware_id().unwrap_or_default().to_string(),
            user_name: self.local.user_name.clone(),
            device_name: self.local.device_name.clone(),
            timestamp: now_millis() as i64,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// First frame on every connection we open.
    pub fn handshake_frame(&self) -> Frame {
        Frame::Handshake(self.identity_fields())
    }

    pub fn heartbeat_frame() -> Frame {
        Frame::Heartbeat {
            timestamp: now_millis() as i64,
        }
    }

    /// Build a locally originated envelope and remember it so mesh echoes are dropped.
    pub fn compose(
        &mut self,
        target: Option<DeviceId>,
        message_type: MessageType,
        payload: impl Into<String>,
        location: Option<Location>,
        now: Instant,
    ) -> MessageEnvelope {
        let mut env =
            MessageEnvelope::outbound(&self.local, target, message_type, payload, self.default_ttl);
        env.location = location;
        self.dedup.record_outbound(&env, now);
        env
    }

    /// Register an envelope composed in an earlier session, e.g. one restored from storage.
    pub fn remember_outbound(&mut self, env: &MessageEnvelope, now: Instant) {
        self.dedup.record_outbound(env, now);
    }

    /// Process one decoded line from `link`.
    pub fn on_inbound(
        &mut self,
        directory: &mut PeerDirectory,
        link: &mut LinkContext,
        inbound: Inbound,
        now: Instant,
    ) -> Vec<HandlerAction> {
        match inbound {
            Inbound::Frame(Frame::Handshake(h)) => self.on_handshake(directory, link, h, true),
            Inbound::Frame(Frame::HandshakeResponse(h)) => {
                self.on_handshake(directory, link, h, false)
            }
            Inbound::Frame(Frame::Heartbeat { .. }) => {
                if let Some(peer) = &link.peer {
                    directory.touch(peer, now_millis());
                }
                vec![]
            }
            Inbound::Frame(Frame::Message(msg)) => self.on_data(directory, link, msg, now),
            Inbound::PlainText(text) => self.on_plain_text(link, text, now),
        }
    }

    fn on_handshake(
        &mut self,
        directory: &mut PeerDirectory,
        link: &mut LinkContext,
        h: Handshake,
        wants_response: bool,
    ) -> Vec<HandlerAction> {
        let peer = directory.canonical_id(Some(&link.address), Some(&h.mac_address), &h.device_id);
        if peer == self.local_id {
            return vec![];
        }
        let name = if h.user_name.is_empty() {
            h.device_name.as_str()
        } else {
            h.user_name.as_str()
        };
        let newly_connected =
            directory.register_connected(peer.clone(), name, DiscoveryMethod::Handshake, now_millis());
        link.peer = Some(peer.clone());
        let mut actions = vec![HandlerAction::PeerRegistered {
            peer,
            newly_connected,
        }];
        if wants_response && !link.responded {
            link.responded = true;
            actions.push(HandlerAction::Reply(Frame::HandshakeResponse(
                self.identity_fields(),
            )));
        }
        actions
    }

    fn on_data(
        &mut self,
        directory: &mut PeerDirectory,
        link: &mut LinkContext,
        msg: DataMessage,
        now: Instant,
    ) -> Vec<HandlerAction> {
        // A route of at most one hop means the neighbour is the originator.
        let direct = msg.route_path.len() <= 1;
        let sender = match (&link.peer, direct) {
            (Some(peer), true) => peer.clone(),
            (None, true) => directory.canonical_id(Some(&link.address), None, &msg.device_id),
            (_, false) => directory.canonical_id(None, None, &msg.device_id),
        };
        if sender == self.local_id {
            return vec![];
        }
        let env = MessageEnvelope::from_wire(msg, sender);
        if let Some(target) = &env.target_id {
            if target != &self.local_id
                && target.as_str() != self.local.ephemeral_id().as_str()
                && !env.is_emergency
            {
                return vec![];
            }
        }
        if !self.dedup.check_and_record(&env, now) {
            return vec![];
        }
        if let Some(peer) = &link.peer {
            directory.touch(peer, now_millis());
        }
        vec![HandlerAction::Deliver {
            envelope: env,
            via: link.peer.clone(),
        }]
    }

    fn on_plain_text(&mut self, link: &LinkContext, text: String, now: Instant) -> Vec<HandlerAction> {
        let sender = link
            .peer
            .clone()
            .unwrap_or_else(|| DeviceId::new(link.address.clone()));
        let env = MessageEnvelope {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender.clone(),
            sender_name: sender.to_string(),
            target_id: None,
            message_type: MessageType::Text,
            payload: text,
            timestamp: now_millis(),
            ttl: 1,
            route_path: vec![sender],
            is_emergency: false,
            location: None,
        };
        if !self.dedup.check_and_record(&env, now) {
            return vec![];
        }
        vec![HandlerAction::Deliver {
            envelope: env,
            via: link.peer.clone(),
        }]
    }

    /// The relayed copy of `env`, or None when it must not be forwarded: direct messages,
    /// our own messages, an exhausted hop budget, or a route that already contains us.
    pub fn prepare_forward(&self, env: &MessageEnvelope) -> Option<MessageEnvelope> {
        if !env.is_forwardable() || env.sender_id == self.local_id || env.ttl <= 1 {
            return None;
        }
        if env.route_path.contains(&self.local_id) {
            return None;
        }
        let mut relayed = env.clone();
        relayed.ttl -= 1;
        relayed.route_path.push(self.local_id.clone());
        Some(relayed)
    }

    /// Connected peers that should receive a relayed copy: everyone except the neighbour it
    /// came from and anyone already on its route.
    pub fn forward_targets(
        connected: &[DeviceId],
        relayed: &MessageEnvelope,
        via: Option<&DeviceId>,
    ) -> Vec<DeviceId> {
        connected
            .iter()
            .filter(|p| Some(*p) != via && !relayed.route_path.contains(p))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DEFAULT_DEDUP_WINDOW;
    use crate::wire::{decode_line, encode_line};

    struct Node {
        handler: MessageHandler,
        dir: PeerDirectory,
    }

    impl Node {
        fn new(name: &str, hw: &str) -> Self {
            let local = LocalIdentity::new(name, format!("{name}-phone")).with_hardware_id(hw);
            Self {
                handler: MessageHandler::new(local, DEFAULT_DEDUP_WINDOW, 3),
                dir: PeerDirectory::new(),
            }
        }

        fn id(&self) -> DeviceId {
            self.handler.local_id().clone()
        }

        fn receive(&mut self, link: &mut LinkContext, frame: &Frame, now: Instant) -> Vec<HandlerAction> {
            let line = encode_line(frame).unwrap();
            let inbound = decode_line(&line).unwrap();
            self.handler.on_inbound(&mut self.dir, link, inbound, now)
        }
    }

    /// Handshake both ways over one connection; returns (a's view of b, b's view of a).
    fn connect(a: &mut Node, b: &mut Node, now: Instant) -> (LinkContext, LinkContext) {
        let mut at_a = LinkContext::new(format!("addr-{}", b.id()));
        let mut at_b = LinkContext::new(format!("addr-{}", a.id()));
        let actions = b.receive(&mut at_b, &a.handler.handshake_frame(), now);
        let reply = actions
            .iter()
            .find_map(|act| match act {
                HandlerAction::Reply(f) => Some(f.clone()),
                _ => None,
            })
            .expect("handshake_response");
        a.receive(&mut at_a, &reply, now);
        (at_a, at_b)
    }

    fn delivered(actions: &[HandlerAction]) -> Vec<(MessageEnvelope, Option<DeviceId>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                HandlerAction::Deliver { envelope, via } => Some((envelope.clone(), via.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn handshake_registers_both_sides() {
        let now = Instant::now();
        let mut a = Node::new("ana", "aa:00:00:00:00:01");
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        let (at_a, at_b) = connect(&mut a, &mut b, now);
        assert_eq!(at_b.peer, Some(a.id()));
        assert_eq!(at_a.peer, Some(b.id()));
        assert!(b.dir.is_connected(&a.id()));
        assert!(a.dir.is_connected(&b.id()));
        assert_eq!(b.dir.identity(&a.id()).unwrap().display_name, "ana");
    }

    #[test]
    fn handshake_answered_once_per_connection() {
        let now = Instant::now();
        let a = Node::new("ana", "aa:00:00:00:00:01");
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        let mut link = LinkContext::new("10.0.0.1");
        let first = b.receive(&mut link, &a.handler.handshake_frame(), now);
        let second = b.receive(&mut link, &a.handler.handshake_frame(), now);
        assert!(first.iter().any(|x| matches!(x, HandlerAction::Reply(_))));
        assert!(!second.iter().any(|x| matches!(x, HandlerAction::Reply(_))));
        assert!(matches!(
            second[0],
            HandlerAction::PeerRegistered {
                newly_connected: false,
                ..
            }
        ));
    }

    #[test]
    fn directory_resolution_overrides_handshake_claim() {
        use crate::platform::{PeerStatus, PlatformPeer};
        let now = Instant::now();
        let a = Node::new("ana", "02:00:00:00:00:00");
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        b.dir.refresh(
            &[PlatformPeer {
                address: "10.0.0.1".into(),
                hardware_id: Some("cc:00:00:00:00:07".into()),
                device_id: None,
                name: "ana".into(),
                status: PeerStatus::Connected,
            }],
            DiscoveryMethod::DirectLink,
            0,
        );
        let mut link = LinkContext::new("10.0.0.1");
        b.receive(&mut link, &a.handler.handshake_frame(), now);
        assert_eq!(link.peer, Some(DeviceId::from("cc:00:00:00:00:07")));
    }

    #[test]
    fn duplicate_content_delivered_once() {
        let now = Instant::now();
        let mut a = Node::new("ana", "aa:00:00:00:00:01");
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        let (_, mut at_b) = connect(&mut a, &mut b, now);
        let first = a.handler.compose(None, MessageType::Text, "bridge is out", None, now);
        let second = a.handler.compose(None, MessageType::Text, "bridge is out", None, now);
        let mut total = 0;
        total += delivered(&b.receive(&mut at_b, &first.to_frame(), now)).len();
        total += delivered(&b.receive(&mut at_b, &second.to_frame(), now + Duration::from_secs(2)))
            .len();
        assert_eq!(total, 1);
    }

    #[test]
    fn ttl_one_is_not_forwarded() {
        let now = Instant::now();
        let mut a = Node::new("ana", "aa:00:00:00:00:01");
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        let (_, mut at_b) = connect(&mut a, &mut b, now);
        let mut env = a.handler.compose(None, MessageType::Emergency, "fire", None, now);
        env.ttl = 1;
        let got = delivered(&b.receive(&mut at_b, &env.to_frame(), now));
        assert_eq!(got.len(), 1);
        assert_eq!(b.handler.prepare_forward(&got[0].0), None);
    }

    #[test]
    fn forward_appends_hop_and_decrements_ttl() {
        let now = Instant::now();
        let mut a = Node::new("ana", "aa:00:00:00:00:01");
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        let (_, mut at_b) = connect(&mut a, &mut b, now);
        let env = a.handler.compose(None, MessageType::Text, "hello", None, now);
        let got = delivered(&b.receive(&mut at_b, &env.to_frame(), now));
        let relayed = b.handler.prepare_forward(&got[0].0).unwrap();
        assert_eq!(relayed.ttl, env.ttl - 1);
        assert_eq!(relayed.route_path.len(), env.route_path.len() + 1);
        assert_eq!(relayed.route_path.last(), Some(&b.id()));
    }

    #[test]
    fn direct_messages_are_never_forwarded() {
        let now = Instant::now();
        let mut a = Node::new("ana", "aa:00:00:00:00:01");
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        let (_, mut at_b) = connect(&mut a, &mut b, now);
        let env = a.handler.compose(Some(b.id()), MessageType::Text, "just you", None, now);
        let got = delivered(&b.receive(&mut at_b, &env.to_frame(), now));
        assert_eq!(got.len(), 1);
        assert_eq!(b.handler.prepare_forward(&got[0].0), None);
    }

    #[test]
    fn direct_message_for_someone_else_is_dropped() {
        let now = Instant::now();
        let mut a = Node::new("ana", "aa:00:00:00:00:01");
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        let (_, mut at_b) = connect(&mut a, &mut b, now);
        let env = a.handler.compose(Some("ff:ff".into()), MessageType::Text, "not bo", None, now);
        assert!(delivered(&b.receive(&mut at_b, &env.to_frame(), now)).is_empty());
    }

    #[test]
    fn chain_delivers_once_without_backflow() {
        let now = Instant::now();
        let mut a = Node::new("ana", "aa:00:00:00:00:01");
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        let mut c = Node::new("cy", "aa:00:00:00:00:03");
        let (_, mut b_from_a) = connect(&mut a, &mut b, now);
        let (mut b_from_c, mut c_from_b) = connect(&mut b, &mut c, now);

        let mut env = a.handler.compose(None, MessageType::Emergency, "trapped, 3rd floor", None, now);
        env.ttl = 3;

        // A -> B
        let at_b = delivered(&b.receive(&mut b_from_a, &env.to_frame(), now));
        assert_eq!(at_b.len(), 1);
        let (env_b, via_b) = &at_b[0];
        assert_eq!(via_b.as_ref(), Some(&a.id()));
        let relayed_b = b.handler.prepare_forward(env_b).unwrap();
        let targets_b =
            MessageHandler::forward_targets(&b.dir.connected(), &relayed_b, via_b.as_ref());
        assert_eq!(targets_b, vec![c.id()]);

        // B -> C
        let at_c = delivered(&c.receive(&mut c_from_b, &relayed_b.to_frame(), now));
        assert_eq!(at_c.len(), 1);
        let (env_c, via_c) = &at_c[0];
        assert_eq!(env_c.sender_id, a.id());
        assert_eq!(env_c.route_path, vec![a.id(), b.id()]);
        let relayed_c = c.handler.prepare_forward(env_c).unwrap();
        assert!(
            MessageHandler::forward_targets(&c.dir.connected(), &relayed_c, via_c.as_ref())
                .is_empty()
        );

        // Even if C echoed it back, B neither delivers nor relays it again.
        let echo = delivered(&b.receive(&mut b_from_c, &relayed_c.to_frame(), now));
        assert!(echo.is_empty());
        assert_eq!(b.handler.prepare_forward(&relayed_c), None);

        // A later duplicate from A reaches C at most once in total.
        let again = delivered(&b.receive(&mut b_from_a, &env.to_frame(), now));
        assert!(again.is_empty());
    }

    #[test]
    fn plain_text_is_delivered_not_rejected() {
        let now = Instant::now();
        let mut b = Node::new("bo", "aa:00:00:00:00:02");
        let mut link = LinkContext::new("10.0.0.9");
        let actions = b
            .handler
            .on_inbound(&mut b.dir, &mut link, decode_line("are you there?").unwrap(), now);
        let got = delivered(&actions);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.payload, "are you there?");
        assert_eq!(got[0].0.sender_id, DeviceId::from("10.0.0.9"));
        assert_eq!(b.handler.prepare_forward(&got[0].0), None);
    }

    #[test]
    fn own_echo_is_ignored() {
        let now = Instant::now();
        let mut a = Node::new("ana", "aa:00:00:00:00:01");
        let env = a.handler.compose(None, MessageType::Sos, "help", None, now);
        let mut relayed = env.clone();
        relayed.route_path.push("aa:00:00:00:00:02".into());
        let mut link = LinkContext::new("10.0.0.2");
        assert!(delivered(&a.receive(&mut link, &relayed.to_frame(), now)).is_empty());
    }
}
