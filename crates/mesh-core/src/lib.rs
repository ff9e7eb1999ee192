//! mesh-core: peer mesh building blocks.
//!
//! This crate provides:
//! - Endpoint identities and an interning table
//! - Perfect negotiation of one transport per remote endpoint
//! - Reliable channels with queued sends, request/response and reconnect
//! - A connection registry ([`Mesh`]) and a relay client ([`Signaler`])
//! - A clock-indexed history and the shared-value sync protocol on top of it
//! - A shared last-writer-wins set over the same clocks
//! - Link and RTC transport traits, with in-memory implementations

pub mod channel;
pub mod endpoint;
pub mod events;
pub mod history;
pub mod mesh;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod shared_set;
pub mod shared_value;
pub mod signaling;
pub mod sync;
pub mod transport;

pub use channel::{
    Channel, ChannelConfig, ChannelError, ChannelEvent, ChannelState, ReconnectConfig,
    RequestHandler,
};
pub use endpoint::{Endpoint, EndpointError, EndpointInterner};
pub use events::{EventBus, Subscription};
pub use history::{Clock, HistoryError, TimestampedHistory};
pub use mesh::{Mesh, MeshConfig, MeshError, MeshEvent};
pub use negotiation::{Negotiator, is_polite};
pub use peer::{OutboundSignal, PeerConnection};
pub use protocol::{RelayMessage, Signal};
pub use shared_set::{SetMessage, SharedSet};
pub use shared_value::{GlobalUpdate, Outgoing, SharedValue, SyncError, SyncMessage};
pub use signaling::{Signaler, SignalingError};
pub use sync::{SYNC_TAG, SessionError, SyncSession};
pub use transport::{
    Link, LinkHandle, LoopbackNetwork, MemoryLink, MemoryListener, RtcFactory, RtcTransport,
    TransportError,
};
