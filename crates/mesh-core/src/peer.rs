//! Peer connections.
//!
//! One [`PeerConnection`] per remote endpoint. Each runs as its own task
//! (the actor) that owns the [`Negotiator`] and the [`RtcTransport`], and
//! processes one serialized stream of inputs: signals from the relay, local
//! commands, and transport events.
//!
//! The transport carries a single data channel. The [`Multiplexer`] splits it
//! into logical channels addressed by `(tag, id)`; the reserved root channel
//! `("root", 0)` tracks whether the connection as a whole is usable.

use crate::Endpoint;
use crate::channel::{Channel, ChannelConfig};
use crate::negotiation::{NegotiationAction, NegotiationInput, Negotiator};
use crate::protocol::{ChannelFrame, Signal};
use crate::transport::{
    Link, LinkHandle, Result, RtcFactory, RtcTransport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const ROOT_TAG: &str = "root";
pub const ROOT_ID: u32 = 0;

/// Frames held per sub-channel that hasn't been opened locally yet.
const MAX_UNCLAIMED_FRAMES: usize = 256;

/// A signal to deliver to `dst` through the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub dst: Endpoint,
    pub signal: Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxStatus {
    /// Data channel not open (yet, or again)
    Waiting,
    Open,
    /// Peer connection torn down for good
    Closed,
}

type RouteKey = (String, u32);

struct Route {
    serial: u64,
    inbound: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct MuxState {
    transport: Option<Arc<dyn RtcTransport>>,
    routes: HashMap<RouteKey, Route>,
    unclaimed: HashMap<RouteKey, VecDeque<Value>>,
    next_serial: u64,
}

/// Routes `(tag, id)` frames between the data channel and logical channels.
pub struct Multiplexer {
    label: String,
    state: Mutex<MuxState>,
    status: watch::Sender<MuxStatus>,
}

impl Multiplexer {
    pub fn new(label: impl Into<String>) -> Self {
        let (status, _) = watch::channel(MuxStatus::Waiting);
        Self {
            label: label.into(),
            state: Mutex::new(MuxState::default()),
            status,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> MuxStatus {
        *self.status.borrow()
    }

    /// Logical channels currently open.
    pub fn open_channels(&self) -> Vec<(String, u32)> {
        let mut keys: Vec<_> = self.lock().routes.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The data channel opened on `transport`.
    pub fn attach(&self, transport: Arc<dyn RtcTransport>) {
        if self.status() == MuxStatus::Closed {
            return;
        }
        self.lock().transport = Some(transport);
        self.status.send_replace(MuxStatus::Open);
        debug!(peer = %self.label, "Data channel attached");
    }

    /// The data channel closed. Every logical channel drops.
    pub fn detach(&self) {
        {
            let mut state = self.lock();
            state.transport = None;
            state.routes.clear();
            state.unclaimed.clear();
        }
        if self.status() != MuxStatus::Closed {
            self.status.send_replace(MuxStatus::Waiting);
        }
        debug!(peer = %self.label, "Data channel detached");
    }

    /// Detach for good; pending and future opens fail.
    pub fn shutdown(&self) {
        self.detach();
        self.status.send_replace(MuxStatus::Closed);
    }

    /// Route one inbound data channel frame.
    pub fn dispatch(&self, text: &str) {
        let Some(frame) = ChannelFrame::from_json(text) else {
            warn!(peer = %self.label, "Dropping malformed channel frame");
            return;
        };
        let key = (frame.tag, frame.id);

        let mut state = self.lock();
        if let Some(route) = state.routes.get(&key) {
            if route.inbound.send(frame.data).is_err() {
                state.routes.remove(&key);
            }
            return;
        }

        // Not opened here yet: hold it until it is
        let held = state.unclaimed.entry(key.clone()).or_default();
        if held.len() >= MAX_UNCLAIMED_FRAMES {
            warn!(peer = %self.label, tag = %key.0, id = key.1, "Dropping frame for unopened channel");
            return;
        }
        held.push_back(frame.data);
    }

    fn transmit(&self, tag: &str, id: u32, data: Value) {
        let Some(transport) = self.lock().transport.clone() else {
            debug!(peer = %self.label, tag, id, "Dropping frame, data channel not open");
            return;
        };
        let frame = ChannelFrame {
            tag: tag.to_string(),
            id,
            data,
        };
        if let Err(e) = transport.send(&frame.to_json()) {
            warn!(peer = %self.label, tag, id, error = %e, "Failed to send frame");
        }
    }

    /// Open the logical channel `(tag, id)`, waiting for the data channel.
    pub async fn open_route(self: &Arc<Self>, tag: &str, id: u32) -> Result<LinkHandle> {
        let mut status = self.status.subscribe();
        let ready = status
            .wait_for(|s| *s != MuxStatus::Waiting)
            .await
            .map(|s| *s)
            .unwrap_or(MuxStatus::Closed);
        if ready == MuxStatus::Closed {
            return Err(TransportError::Closed);
        }

        let key = (tag.to_string(), id);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let serial = {
            let mut state = self.lock();
            if state.routes.contains_key(&key) {
                return Err(TransportError::DuplicateChannel {
                    tag: tag.to_string(),
                    id,
                });
            }
            for data in state.unclaimed.remove(&key).unwrap_or_default() {
                let _ = inbound_tx.send(data);
            }
            state.next_serial += 1;
            let serial = state.next_serial;
            state.routes.insert(
                key.clone(),
                Route {
                    serial,
                    inbound: inbound_tx,
                },
            );
            serial
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                mux.transmit(&key.0, key.1, data);
            }
            // The channel let go of this route
            let mut state = mux.lock();
            if state.routes.get(&key).is_some_and(|r| r.serial == serial) {
                state.routes.remove(&key);
            }
        });

        Ok(LinkHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// [`Link`] for one logical channel of a peer connection.
pub struct MuxLink {
    mux: Arc<Multiplexer>,
    tag: String,
    id: u32,
}

#[async_trait]
impl Link for MuxLink {
    fn describe(&self) -> String {
        format!("peer:{}/{}/{}", self.mux.label, self.tag, self.id)
    }

    async fn open(&self) -> Result<LinkHandle> {
        self.mux.open_route(&self.tag, self.id).await
    }
}

enum PeerInput {
    Negotiate,
    Signal(Signal),
    Close,
}

/// Handle to one peer connection. Cloning yields another handle to the
/// same connection.
#[derive(Clone)]
pub struct PeerConnection {
    remote: Endpoint,
    polite: bool,
    instance: u64,
    inbox: mpsc::UnboundedSender<PeerInput>,
    mux: Arc<Multiplexer>,
    root: Channel,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("remote", &self.remote.to_string())
            .field("polite", &self.polite)
            .field("instance", &self.instance)
            .finish()
    }
}

impl PeerConnection {
    /// Create the transport and start the actor.
    ///
    /// With `initiate`, the actor starts by making an offer. The root channel
    /// is created but not connected; the owner connects it once it observes it.
    pub fn spawn(
        local: &Endpoint,
        remote: &Endpoint,
        factory: &dyn RtcFactory,
        signals: mpsc::UnboundedSender<OutboundSignal>,
        instance: u64,
        initiate: bool,
    ) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = factory.create(local, remote, events_tx)?;
        let negotiator = Negotiator::for_endpoints(local, remote);
        let polite = negotiator.is_polite();

        let mux = Arc::new(Multiplexer::new(remote.short()));
        let root = Channel::new(
            format!("{}/{}", remote.short(), ROOT_TAG),
            Arc::new(MuxLink {
                mux: Arc::clone(&mux),
                tag: ROOT_TAG.to_string(),
                id: ROOT_ID,
            }),
            ChannelConfig::default(),
        );

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        if initiate {
            let _ = inbox.send(PeerInput::Negotiate);
        }

        let actor = PeerActor {
            remote: remote.clone(),
            negotiator,
            transport,
            mux: Arc::clone(&mux),
            signals,
        };
        tokio::spawn(actor.run(inbox_rx, events_rx));

        info!(remote = %remote.short(), polite, "Peer connection created");
        Ok(Self {
            remote: remote.clone(),
            polite,
            instance,
            inbox,
            mux,
            root,
        })
    }

    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    /// The reserved root channel.
    pub fn root(&self) -> &Channel {
        &self.root
    }

    /// A logical channel multiplexed over this connection. Not yet connected.
    pub fn channel(&self, tag: &str, id: u32, config: ChannelConfig) -> Channel {
        Channel::new(
            format!("{}/{}/{}", self.remote.short(), tag, id),
            Arc::new(MuxLink {
                mux: Arc::clone(&self.mux),
                tag: tag.to_string(),
                id,
            }),
            config,
        )
    }

    pub fn open_channels(&self) -> Vec<(String, u32)> {
        self.mux.open_channels()
    }

    /// Whether the data channel is currently open.
    pub fn is_linked(&self) -> bool {
        self.mux.status() == MuxStatus::Open
    }

    /// Deliver a signal from the remote.
    pub fn signal(&self, signal: Signal) {
        if self.inbox.send(PeerInput::Signal(signal)).is_err() {
            debug!(remote = %self.remote.short(), "Signal for a closed peer connection");
        }
    }

    /// Tear the connection down. Idempotent.
    pub fn close(&self) {
        let _ = self.inbox.send(PeerInput::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

struct PeerActor {
    remote: Endpoint,
    negotiator: Negotiator,
    transport: Arc<dyn RtcTransport>,
    mux: Arc<Multiplexer>,
    signals: mpsc::UnboundedSender<OutboundSignal>,
}

impl PeerActor {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<PeerInput>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                input = inbox.recv() => match input {
                    Some(PeerInput::Negotiate) => self.drive(NegotiationInput::NegotiationNeeded).await,
                    Some(PeerInput::Signal(Signal::Description(description))) => {
                        self.drive(NegotiationInput::RemoteDescription(description)).await
                    }
                    Some(PeerInput::Signal(Signal::Candidate(candidate))) => {
                        self.drive(NegotiationInput::RemoteCandidate(candidate)).await
                    }
                    Some(PeerInput::Close) | None => break,
                },
                Some(event) = events.recv() => self.on_transport_event(event).await,
            }
        }

        inbox.close();
        self.negotiator.handle(NegotiationInput::Close);
        self.mux.shutdown();
        self.transport.close().await;
        info!(remote = %self.remote.short(), "Peer connection closed");
    }

    /// Run an input and every follow-up it causes to completion.
    async fn drive(&mut self, input: NegotiationInput) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            for action in self.negotiator.handle(input) {
                if let Some(follow_up) = self.perform(action).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn perform(&mut self, action: NegotiationAction) -> Option<NegotiationInput> {
        match action {
            NegotiationAction::CreateOffer {
                generation,
                ice_restart,
            } => Some(match self.transport.create_offer(ice_restart).await {
                Ok(description) => NegotiationInput::LocalOfferCreated {
                    generation,
                    description,
                },
                Err(e) => NegotiationInput::LocalOfferFailed {
                    generation,
                    reason: e.to_string(),
                },
            }),
            NegotiationAction::ApplyRemoteDescription(description) => {
                Some(match self.transport.set_remote_description(description).await {
                    Ok(()) => NegotiationInput::RemoteDescriptionApplied,
                    Err(e) => NegotiationInput::RemoteDescriptionFailed(e.to_string()),
                })
            }
            NegotiationAction::CreateAnswer => Some(match self.transport.create_answer().await {
                Ok(description) => NegotiationInput::LocalAnswerCreated(description),
                Err(e) => NegotiationInput::LocalAnswerFailed(e.to_string()),
            }),
            NegotiationAction::AddCandidate(candidate) => self
                .transport
                .add_ice_candidate(candidate)
                .await
                .err()
                .map(|e| NegotiationInput::CandidateFailed(e.to_string())),
            NegotiationAction::SendDescription(description) => {
                self.send_signal(Signal::Description(description));
                None
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IceCandidate(candidate) => self.send_signal(Signal::Candidate(candidate)),
            TransportEvent::StateChanged(state) => {
                debug!(remote = %self.remote.short(), ?state, "Transport state");
                self.drive(NegotiationInput::TransportState(state)).await;
            }
            TransportEvent::DataChannelOpen => self.mux.attach(Arc::clone(&self.transport)),
            TransportEvent::Message(text) => self.mux.dispatch(&text),
            TransportEvent::DataChannelClosed => self.mux.detach(),
        }
    }

    fn send_signal(&self, signal: Signal) {
        let outbound = OutboundSignal {
            dst: self.remote.clone(),
            signal,
        };
        if self.signals.send(outbound).is_err() {
            warn!(remote = %self.remote.short(), "Signaling is gone, dropping signal");
        }
    }
}
