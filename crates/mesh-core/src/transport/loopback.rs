//! In-process peer-to-peer transport.
//!
//! A [`LoopbackNetwork`] connects every transport it creates for `(a, b)` to
//! the one created for `(b, a)`. Negotiation follows the offer/answer rules
//! of a browser peer connection closely enough to exercise the negotiation
//! state machine: descriptions must be applied in a legal signaling state, a
//! remote offer rolls back an outstanding local offer, and the data channel
//! only opens once both sides hold matching local/remote descriptions.

use super::{Result, RtcFactory, RtcTransport, TransportError, TransportEvent, TransportState};
use crate::Endpoint;
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signaling {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

struct Side {
    instance: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    signaling: Signaling,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    ice: TransportState,
    channel_open: bool,
    version: u64,
    ufrag: u64,
    candidates: usize,
}

impl Side {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn set_ice(&mut self, state: TransportState) {
        if self.ice != state {
            self.ice = state;
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    fn describe(&mut self, kind: SdpType, owner: &Endpoint) -> SessionDescription {
        self.version += 1;
        SessionDescription {
            kind,
            sdp: format!(
                "v=0\r\no={} {}\r\na=ice-ufrag:{}\r\n",
                owner, self.version, self.ufrag
            ),
        }
    }

    fn gather(&self, owner: &Endpoint) {
        self.emit(TransportEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host {}", self.ufrag, owner.short()),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }));
    }
}

type Key = (Endpoint, Endpoint);

#[derive(Default)]
struct NetworkState {
    sides: HashMap<Key, Side>,
}

impl NetworkState {
    /// Open the link between `key` and its mirror once both agree.
    fn try_connect(&mut self, key: &Key) {
        let mirror = (key.1.clone(), key.0.clone());
        let agreed = match (self.sides.get(key), self.sides.get(&mirror)) {
            (Some(a), Some(b)) => {
                a.signaling == Signaling::Stable
                    && b.signaling == Signaling::Stable
                    && a.local.is_some()
                    && a.remote.is_some()
                    && a.local == b.remote
                    && a.remote == b.local
            }
            _ => false,
        };
        if !agreed {
            return;
        }

        for k in [key, &mirror] {
            if let Some(side) = self.sides.get_mut(k) {
                side.set_ice(TransportState::Connected);
                if !side.channel_open {
                    side.channel_open = true;
                    side.emit(TransportEvent::DataChannelOpen);
                }
            }
        }
    }
}

/// Factory for loopback transports sharing one in-process network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_instance: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate an ICE failure on the path between `a` and `b`.
    pub fn fail(&self, a: &Endpoint, b: &Endpoint) {
        let mut state = self.lock();
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(side) = state.sides.get_mut(&key) {
                side.set_ice(TransportState::Failed);
            }
        }
    }

    /// Whether `a`'s data channel towards `b` is open and usable.
    pub fn is_linked(&self, a: &Endpoint, b: &Endpoint) -> bool {
        self.lock()
            .sides
            .get(&(a.clone(), b.clone()))
            .is_some_and(|s| s.channel_open && s.ice == TransportState::Connected)
    }

    /// ICE candidates `a` has accepted from `b`.
    pub fn candidates_added(&self, a: &Endpoint, b: &Endpoint) -> usize {
        self.lock()
            .sides
            .get(&(a.clone(), b.clone()))
            .map_or(0, |s| s.candidates)
    }
}

impl RtcFactory for LoopbackNetwork {
    fn create(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RtcTransport>> {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let key = (local.clone(), remote.clone());
        let side = Side {
            instance,
            events,
            signaling: Signaling::Stable,
            local: None,
            remote: None,
            pending_local: None,
            pending_remote: None,
            ice: TransportState::New,
            channel_open: false,
            version: 0,
            ufrag: 0,
            candidates: 0,
        };
        if self.lock().sides.insert(key.clone(), side).is_some() {
            debug!(local = %local.short(), remote = %remote.short(), "Replacing loopback transport");
        }
        Ok(Arc::new(LoopbackTransport {
            network: self.clone(),
            key,
            instance,
        }))
    }
}

struct LoopbackTransport {
    network: LoopbackNetwork,
    key: Key,
    instance: u64,
}

impl LoopbackTransport {
    fn with_side<T>(&self, f: impl FnOnce(&mut NetworkState, &Key) -> Result<T>) -> Result<T> {
        let mut state = self.network.lock();
        let owned = state
            .sides
            .get(&self.key)
            .is_some_and(|s| s.instance == self.instance);
        if !owned {
            return Err(TransportError::Closed);
        }
        f(&mut state, &self.key)
    }
}

fn side_mut<'a>(state: &'a mut NetworkState, key: &Key) -> Result<&'a mut Side> {
    state.sides.get_mut(key).ok_or(TransportError::Closed)
}

#[async_trait]
impl RtcTransport for LoopbackTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let owner = self.key.0.clone();
        self.with_side(|state, key| {
            let side = side_mut(state, key)?;
            if side.signaling == Signaling::HaveRemoteOffer {
                return Err(TransportError::Negotiation(
                    "can't create an offer while a remote offer is pending".to_string(),
                ));
            }
            if ice_restart {
                side.ufrag += 1;
            }
            let offer = side.describe(SdpType::Offer, &owner);
            side.pending_local = Some(offer.clone());
            side.signaling = Signaling::HaveLocalOffer;
            if side.ice == TransportState::New {
                side.set_ice(TransportState::Connecting);
            }
            side.gather(&owner);
            Ok(offer)
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let owner = self.key.0.clone();
        self.with_side(|state, key| {
            let side = side_mut(state, key)?;
            if side.signaling != Signaling::HaveRemoteOffer {
                return Err(TransportError::Negotiation(
                    "can't create an answer without a remote offer".to_string(),
                ));
            }
            let answer = side.describe(SdpType::Answer, &owner);
            side.local = Some(answer.clone());
            side.remote = side.pending_remote.take();
            side.signaling = Signaling::Stable;
            if side.ice == TransportState::New {
                side.set_ice(TransportState::Connecting);
            }
            side.gather(&owner);
            state.try_connect(key);
            Ok(answer)
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.with_side(|state, key| {
            let side = side_mut(state, key)?;
            match description.kind {
                SdpType::Offer => {
                    // Implicit rollback of an outstanding local offer
                    side.pending_local = None;
                    side.pending_remote = Some(description);
                    side.signaling = Signaling::HaveRemoteOffer;
                }
                SdpType::Answer => {
                    if side.signaling != Signaling::HaveLocalOffer {
                        return Err(TransportError::Negotiation(
                            "answer received without a local offer".to_string(),
                        ));
                    }
                    side.local = side.pending_local.take();
                    side.remote = Some(description);
                    side.signaling = Signaling::Stable;
                    state.try_connect(key);
                }
            }
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        self.with_side(|state, key| {
            let side = side_mut(state, key)?;
            if side.remote.is_none() && side.pending_remote.is_none() {
                return Err(TransportError::Negotiation(
                    "candidate received before any remote description".to_string(),
                ));
            }
            side.candidates += 1;
            Ok(())
        })
    }

    fn send(&self, text: &str) -> Result<()> {
        self.with_side(|state, key| {
            let usable = |s: &Side| s.channel_open && s.ice == TransportState::Connected;
            let mirror = (key.1.clone(), key.0.clone());
            match (state.sides.get(key), state.sides.get(&mirror)) {
                (Some(local), Some(remote)) if usable(local) && usable(remote) => {
                    remote.emit(TransportEvent::Message(text.to_string()));
                    Ok(())
                }
                _ => Err(TransportError::SendFailed("data channel is not open".to_string())),
            }
        })
    }

    async fn close(&self) {
        let mut state = self.network.lock();
        let owned = state
            .sides
            .get(&self.key)
            .is_some_and(|s| s.instance == self.instance);
        if !owned {
            return;
        }
        if let Some(side) = state.sides.remove(&self.key) {
            if side.channel_open {
                side.emit(TransportEvent::DataChannelClosed);
            }
            side.emit(TransportEvent::StateChanged(TransportState::Closed));
        }

        let mirror = (self.key.1.clone(), self.key.0.clone());
        if let Some(remote) = state.sides.get_mut(&mirror) {
            if remote.channel_open {
                remote.channel_open = false;
                remote.emit(TransportEvent::DataChannelClosed);
            }
            remote.set_ice(TransportState::Disconnected);
        }
    }
}
