//! Transport abstractions.
//!
//! Two seams sit under the mesh:
//! - [`Link`]: something a [`crate::Channel`] can (re)open to get a duplex
//!   stream of JSON values. Implemented by the relay WebSocket client, by
//!   multiplexed sub-channels of a peer connection, and by [`MemoryLink`].
//! - [`RtcTransport`] / [`RtcFactory`]: the peer-to-peer transport driven by
//!   the negotiation state machine (descriptions, ICE candidates, one data
//!   channel). [`LoopbackNetwork`] is the in-process implementation.

mod loopback;
mod memory;

pub use loopback::LoopbackNetwork;
pub use memory::{MemoryLink, MemoryListener};

use crate::Endpoint;
use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Channel {tag}/{id} is already open")]
    DuplicateChannel { tag: String, id: u32 },

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Both directions of one opened link.
///
/// The link is up while `inbound` yields values; it is down once `inbound`
/// returns `None`. Dropping `outbound` closes the local side.
pub struct LinkHandle {
    pub outbound: mpsc::UnboundedSender<Value>,
    pub inbound: mpsc::UnboundedReceiver<Value>,
}

impl LinkHandle {
    /// Two handles wired back to back.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: a_tx,
                inbound: b_rx,
            },
            Self {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Something a channel can open, and open again after it drops.
#[async_trait]
pub trait Link: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Open a fresh connection.
    async fn open(&self) -> Result<LinkHandle>;
}

/// ICE connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events a transport reports to the peer connection that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local ICE candidate to trickle to the remote
    IceCandidate(IceCandidate),
    StateChanged(TransportState),
    DataChannelOpen,
    /// Text frame received on the data channel
    Message(String),
    DataChannelClosed,
}

/// A peer-to-peer transport with offer/answer negotiation.
///
/// `create_offer` and `create_answer` also install the created description
/// as the local description. Applying a remote offer while a local offer is
/// outstanding rolls the local offer back.
#[async_trait]
pub trait RtcTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send a text frame on the data channel.
    fn send(&self, text: &str) -> Result<()>;

    async fn close(&self);
}

/// Creates one transport per remote endpoint.
pub trait RtcFactory: Send + Sync {
    fn create(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RtcTransport>>;
}
