//! Relay client.
//!
//! A [`Signaler`] keeps one reconnecting [`Channel`] to the relay, registers
//! the local endpoint with `hi` on every (re)connect, delivers the mesh's
//! outgoing descriptions and candidates, routes incoming ones to the
//! [`Mesh`], and answers `find-peers` lookups.

use crate::channel::{Channel, ChannelConfig, ChannelError, ChannelEvent, ChannelState};
use crate::events::Subscription;
use crate::mesh::Mesh;
use crate::peer::OutboundSignal;
use crate::protocol::{RelayMessage, Signal};
use crate::transport::{self, Link, LinkHandle, TransportError};
use crate::{Endpoint, EndpointInterner};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Relay did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Relay connection dropped before answering")]
    Disconnected,
}

/// Opens the relay link and says `hi` before anything else goes out.
struct Greeting {
    link: Arc<dyn Link>,
    hello: Value,
}

#[async_trait]
impl Link for Greeting {
    fn describe(&self) -> String {
        self.link.describe()
    }

    async fn open(&self) -> transport::Result<LinkHandle> {
        let handle = self.link.open().await?;
        handle
            .outbound
            .send(self.hello.clone())
            .map_err(|_| TransportError::SendFailed("relay link closed before hi".to_string()))?;
        Ok(handle)
    }
}

type PeersReply = oneshot::Sender<Vec<Endpoint>>;

struct SignalerInner {
    local: Endpoint,
    mesh: Mesh,
    channel: Channel,
    interner: EndpointInterner,
    lookups: Mutex<VecDeque<PeersReply>>,
    watch: Mutex<Option<Subscription>>,
    pump: AbortHandle,
}

/// Connection to the relay on behalf of one [`Mesh`].
#[derive(Clone)]
pub struct Signaler {
    inner: Arc<SignalerInner>,
}

impl Signaler {
    /// Wire `mesh` (and the outbox returned by [`Mesh::new`]) to the relay
    /// reachable through `link`. Call [`Signaler::connect`] to go online.
    pub fn new(mesh: Mesh, outbox: mpsc::UnboundedReceiver<OutboundSignal>, link: Arc<dyn Link>) -> Self {
        let local = mesh.local().clone();
        let hello = RelayMessage::Hi {
            src: local.to_string(),
        }
        .to_value();
        let channel = Channel::new(
            format!("relay/{}", local.short()),
            Arc::new(Greeting { link, hello }),
            ChannelConfig::reconnecting(),
        );

        let pump = tokio::spawn(pump_outbox(local.clone(), channel.clone(), outbox));
        let inner = Arc::new(SignalerInner {
            local,
            mesh,
            channel,
            interner: EndpointInterner::new(),
            lookups: Mutex::new(VecDeque::new()),
            watch: Mutex::new(None),
            pump: pump.abort_handle(),
        });

        let weak: Weak<SignalerInner> = Arc::downgrade(&inner);
        let watch = inner.channel.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(event);
            }
        });
        *inner.watch.lock().unwrap_or_else(|e| e.into_inner()) = Some(watch);

        Self { inner }
    }

    pub fn local(&self) -> &Endpoint {
        &self.inner.local
    }

    pub fn mesh(&self) -> &Mesh {
        &self.inner.mesh
    }

    /// The underlying relay channel.
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Connect to the relay. Reconnects by itself after drops.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        Ok(self.inner.channel.connect().await?)
    }

    /// Ask the relay which of `ids` are registered right now.
    pub async fn find_peers(&self, ids: &[Endpoint]) -> Result<Vec<Endpoint>, SignalingError> {
        let request = RelayMessage::FindPeers {
            ids: ids.iter().map(ToString::to_string).collect(),
        }
        .to_value();

        let (tx, rx) = oneshot::channel();
        {
            // Sent and queued under one lock so replies pair up in order
            let mut lookups = self.inner.lookups();
            self.inner.channel.try_send(request)?;
            lookups.push_back(tx);
        }

        let timeout = self.inner.mesh.config().find_peers_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(_)) => Err(SignalingError::Disconnected),
            Err(_) => Err(SignalingError::Timeout(timeout)),
        }
    }

    /// Disconnect from the relay for good.
    pub fn close(&self) {
        self.inner.channel.close();
        self.inner.pump.abort();
    }
}

impl SignalerInner {
    fn lookups(&self) -> MutexGuard<'_, VecDeque<PeersReply>> {
        self.lookups.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(ChannelState::Connected) => {
                let evicted = self.interner.sweep();
                debug!(local = %self.local.short(), evicted, "Registered with relay");
            }
            ChannelEvent::StateChanged(ChannelState::Closed) => {
                // Answers to these will never come
                self.lookups().clear();
            }
            ChannelEvent::StateChanged(ChannelState::Connecting) => {}
            ChannelEvent::Message(value) => self.on_message(value),
        }
    }

    fn on_message(&self, value: Value) {
        let message = match RelayMessage::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping relay message");
                return;
            }
        };

        match message {
            RelayMessage::Desc { src, dst, data }
            | RelayMessage::Offer { src, dst, data }
            | RelayMessage::Answer { src, dst, data } => {
                self.route(&src, &dst, serde_json::from_value(data).map(Signal::Description));
            }
            RelayMessage::Candidate { src, dst, data } => {
                self.route(&src, &dst, serde_json::from_value(data).map(Signal::Candidate));
            }
            RelayMessage::Peers { ids } => {
                let found = ids
                    .iter()
                    .filter_map(|id| match self.interner.intern(id) {
                        Ok(endpoint) => Some(Endpoint::clone(&endpoint)),
                        Err(e) => {
                            warn!(error = %e, "Relay listed an invalid endpoint");
                            None
                        }
                    })
                    .collect();
                match self.lookups().pop_front() {
                    Some(reply) => {
                        // The asker may have timed out already
                        let _ = reply.send(found);
                    }
                    None => debug!("Ignoring unsolicited peers list"),
                }
            }
            other @ (RelayMessage::Hi { .. } | RelayMessage::FindPeers { .. }) => {
                warn!(id = other.kind(), "Relay sent a client-only message");
            }
        }
    }

    fn route(&self, src: &str, dst: &str, signal: Result<Signal, serde_json::Error>) {
        if dst != self.local.to_string() {
            warn!(%src, %dst, "Dropping signal addressed to someone else");
            return;
        }
        let src = match self.interner.intern(src) {
            Ok(src) => src,
            Err(e) => {
                warn!(error = %e, "Dropping signal from invalid endpoint");
                return;
            }
        };
        match signal {
            Ok(signal) => self.mesh.handle_signal(&src, signal),
            Err(e) => warn!(src = %src.short(), error = %e, "Dropping malformed signal payload"),
        }
    }
}

impl Drop for SignalerInner {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Deliver the mesh's signals through the relay, one at a time and in order.
async fn pump_outbox(local: Endpoint, channel: Channel, mut outbox: mpsc::UnboundedReceiver<OutboundSignal>) {
    let src = local.to_string();
    while let Some(OutboundSignal { dst, signal }) = outbox.recv().await {
        let dst = dst.to_string();
        let message = match signal {
            Signal::Description(description) => RelayMessage::Desc {
                src: src.clone(),
                dst,
                data: serde_json::to_value(description).unwrap_or(Value::Null),
            },
            Signal::Candidate(candidate) => RelayMessage::Candidate {
                src: src.clone(),
                dst,
                data: serde_json::to_value(candidate).unwrap_or(Value::Null),
            },
        };
        if let Err(e) = channel.send(message.to_value()).await {
            warn!(kind = message.kind(), error = %e, "Failed to send signal to relay");
        }
    }
}
