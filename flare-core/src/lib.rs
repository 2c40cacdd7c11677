//! Flare mesh protocol core.
//! Host-driven: no sockets and no runtime; the host passes events and performs the returned actions.

pub mod arbitrator;
pub mod debounce;
pub mod dedup;
pub mod directory;
pub mod handler;
pub mod identity;
pub mod message;
pub mod pending;
pub mod platform;
pub mod protocol;
pub mod store;
pub mod wire;

pub use arbitrator::{
    derive_role, ArbiterAction, ArbiterEvent, ConnectionArbitrator, ConnectionMode,
    ConnectionState, LinkFailure, Phase, Role,
};
pub use debounce::Debouncer;
pub use dedup::DedupCache;
pub use directory::{PeerDirectory, PeerRecord};
pub use handler::{HandlerAction, LinkContext, MessageHandler};
pub use identity::{DeviceId, DeviceIdentity, DiscoveryMethod, LocalIdentity};
pub use message::{Location, MessageEnvelope, MessageStatus, PendingMessage};
pub use pending::PendingQueue;
pub use platform::{Capability, DeviceInfo, LinkInfo, PeerStatus, PlatformEvent, PlatformPeer};
pub use protocol::{Frame, MessageType, DEFAULT_TTL, PROTOCOL_VERSION};
pub use store::{MemoryStore, MessageStore, StoreError, StoredMessage};
pub use wire::{decode_line, encode_line, Inbound, WireError};
