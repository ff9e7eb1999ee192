//! Peer connection registry.
//!
//! The [`Mesh`] is the one place that owns peer connections, keyed by remote
//! endpoint. Connections are created lazily (on `connect`, or on an incoming
//! offer), are usable once their root channel connects, and are removed the
//! moment their root channel closes. A removed connection is never reused.

use crate::channel::{ChannelEvent, ChannelState};
use crate::events::{EventBus, Subscription};
use crate::peer::{OutboundSignal, PeerConnection};
use crate::protocol::{SdpType, Signal};
use crate::transport::{RtcFactory, TransportError};
use crate::Endpoint;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Can't connect to the local endpoint {0}")]
    AddressingSelf(Endpoint),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// How long `find_peers` waits for the relay
    pub find_peers_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            find_peers_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// Root channel connected; the peer is usable
    PeerConnected(Endpoint),
    /// Root channel closed; the peer was removed
    PeerClosed(Endpoint),
}

struct Entry {
    peer: PeerConnection,
    _root_watch: Subscription,
}

struct MeshInner {
    local: Endpoint,
    factory: Arc<dyn RtcFactory>,
    config: MeshConfig,
    signals: mpsc::UnboundedSender<OutboundSignal>,
    peers: Mutex<HashMap<Endpoint, Entry>>,
    events: Arc<EventBus<MeshEvent>>,
    next_instance: AtomicU64,
}

/// Registry of peer connections for one local endpoint.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    /// Create a registry. Signals its peers need delivered come out of the
    /// returned receiver; hand it to a [`crate::Signaler`].
    pub fn new(
        local: Endpoint,
        factory: Arc<dyn RtcFactory>,
        config: MeshConfig,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundSignal>) {
        let (signals, outbox) = mpsc::unbounded_channel();
        let mesh = Self {
            inner: Arc::new(MeshInner {
                local,
                factory,
                config,
                signals,
                peers: Mutex::new(HashMap::new()),
                events: Arc::new(EventBus::new()),
                next_instance: AtomicU64::new(1),
            }),
        };
        (mesh, outbox)
    }

    pub fn local(&self) -> &Endpoint {
        &self.inner.local
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn subscribe(&self, callback: impl Fn(MeshEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(callback)
    }

    /// The connection to `remote`, creating it (and offering) if needed.
    pub fn connect(&self, remote: &Endpoint) -> Result<PeerConnection, MeshError> {
        if *remote == self.inner.local {
            return Err(MeshError::AddressingSelf(remote.clone()));
        }
        if let Some(peer) = self.peer(remote) {
            return Ok(peer);
        }
        Ok(self.inner.create(remote, true)?)
    }

    pub fn peer(&self, remote: &Endpoint) -> Option<PeerConnection> {
        self.inner.lock().get(remote).map(|e| e.peer.clone())
    }

    /// Remote endpoints with a registered connection.
    pub fn peers(&self) -> Vec<Endpoint> {
        let mut peers: Vec<_> = self.inner.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Remote endpoints whose root channel is connected.
    pub fn connected_peers(&self) -> Vec<Endpoint> {
        let mut peers: Vec<_> = self
            .inner
            .lock()
            .values()
            .filter(|e| e.peer.root().state() == ChannelState::Connected)
            .map(|e| e.peer.remote().clone())
            .collect();
        peers.sort();
        peers
    }

    /// Route a signal from `src` to its connection.
    ///
    /// An offer from an unknown endpoint creates the connection; anything
    /// else for an unknown endpoint is dropped.
    pub fn handle_signal(&self, src: &Endpoint, signal: Signal) {
        if *src == self.inner.local {
            warn!(src = %src.short(), "Dropping signal claiming to come from ourselves");
            return;
        }

        let peer = match self.peer(src) {
            Some(peer) => peer,
            None => match &signal {
                Signal::Description(d) if d.kind == SdpType::Offer => {
                    match self.inner.create(src, false) {
                        Ok(peer) => peer,
                        Err(e) => {
                            warn!(src = %src.short(), error = %e, "Failed to accept connection");
                            return;
                        }
                    }
                }
                _ => {
                    debug!(src = %src.short(), "Dropping signal for unknown peer");
                    return;
                }
            },
        };
        peer.signal(signal);
    }

    /// Close the connection to `remote`, if any.
    pub fn disconnect(&self, remote: &Endpoint) {
        if let Some(peer) = self.peer(remote) {
            peer.close();
        }
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let peers: Vec<_> = self.inner.lock().values().map(|e| e.peer.clone()).collect();
        for peer in peers {
            peer.close();
        }
    }
}

impl MeshInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<Endpoint, Entry>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create(self: &Arc<Self>, remote: &Endpoint, initiate: bool) -> Result<PeerConnection, TransportError> {
        // Held across creation so two callers can't build transports for the same remote
        let mut peers = self.lock();
        if let Some(existing) = peers.get(remote) {
            return Ok(existing.peer.clone());
        }

        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let peer = PeerConnection::spawn(
            &self.local,
            remote,
            self.factory.as_ref(),
            self.signals.clone(),
            instance,
            initiate,
        )?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let endpoint = remote.clone();
        let connected = AtomicBool::new(false);
        let root_watch = peer.root().subscribe(move |event| {
            let Some(mesh) = weak.upgrade() else {
                return;
            };
            match event {
                ChannelEvent::StateChanged(ChannelState::Connected) => {
                    if !connected.swap(true, Ordering::SeqCst) {
                        info!(remote = %endpoint.short(), "Peer connected");
                        mesh.events.emit(MeshEvent::PeerConnected(endpoint.clone()));
                    }
                }
                ChannelEvent::StateChanged(ChannelState::Closed) => {
                    mesh.unregister(&endpoint, instance);
                }
                _ => {}
            }
        });
        peers.insert(
            remote.clone(),
            Entry {
                peer: peer.clone(),
                _root_watch: root_watch,
            },
        );
        drop(peers);

        let root = peer.root().clone();
        tokio::spawn(async move {
            if let Err(e) = root.connect().await {
                debug!(channel = %root.name(), error = %e, "Root channel failed to connect");
            }
        });
        Ok(peer)
    }

    /// Drop the registration for `remote` if it still belongs to `instance`.
    fn unregister(&self, remote: &Endpoint, instance: u64) {
        let removed = {
            let mut peers = self.lock();
            match peers.get(remote) {
                Some(entry) if entry.peer.instance() == instance => peers.remove(remote),
                _ => None,
            }
        };
        let Some(entry) = removed else {
            return;
        };

        entry.peer.close();
        info!(remote = %remote.short(), "Peer closed");
        self.events.emit(MeshEvent::PeerClosed(remote.clone()));
        // The entry holds the subscription that called us; release it last
        drop(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackNetwork;
    use serde_json::json;

    /// Meshes whose outboxes are delivered straight to each other.
    struct Harness {
        net: LoopbackNetwork,
        meshes: HashMap<Endpoint, Mesh>,
        events: mpsc::UnboundedReceiver<(Endpoint, MeshEvent)>,
        _subs: Vec<Subscription>,
    }

    impl Harness {
        fn new(count: usize) -> (Self, Vec<Endpoint>) {
            let net = LoopbackNetwork::new();
            let (events_tx, events) = mpsc::unbounded_channel();
            let mut meshes = HashMap::new();
            let mut outboxes = Vec::new();
            let mut subs = Vec::new();
            let mut endpoints = Vec::new();

            for _ in 0..count {
                let local = Endpoint::generate();
                let (mesh, outbox) = Mesh::new(local.clone(), Arc::new(net.clone()), MeshConfig::default());
                let tx = events_tx.clone();
                let me = local.clone();
                subs.push(mesh.subscribe(move |event| {
                    let _ = tx.send((me.clone(), event));
                }));
                outboxes.push((local.clone(), outbox));
                meshes.insert(local.clone(), mesh);
                endpoints.push(local);
            }

            for (src, mut outbox) in outboxes {
                let meshes = meshes.clone();
                tokio::spawn(async move {
                    while let Some(out) = outbox.recv().await {
                        if let Some(mesh) = meshes.get(&out.dst) {
                            mesh.handle_signal(&src, out.signal);
                        }
                    }
                });
            }

            (
                Self {
                    net,
                    meshes,
                    events,
                    _subs: subs,
                },
                endpoints,
            )
        }

        async fn next_event(&mut self) -> (Endpoint, MeshEvent) {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for mesh event")
                .expect("mesh events ended")
        }
    }

    #[tokio::test]
    async fn test_connect_to_self_fails() {
        let local = Endpoint::generate();
        let (mesh, _outbox) = Mesh::new(local.clone(), Arc::new(LoopbackNetwork::new()), MeshConfig::default());
        assert!(matches!(mesh.connect(&local), Err(MeshError::AddressingSelf(_))));
        assert!(mesh.peers().is_empty());
    }

    #[tokio::test]
    async fn test_connect_registers_both_sides() {
        let (mut h, eps) = Harness::new(2);
        let (a, b) = (eps[0].clone(), eps[1].clone());

        let peer = h.meshes[&a].connect(&b).unwrap();
        // Lazily created once, then reused
        let again = h.meshes[&a].connect(&b).unwrap();
        assert_eq!(peer.instance(), again.instance());

        let mut connected = Vec::new();
        while connected.len() < 2 {
            let (who, event) = h.next_event().await;
            if let MeshEvent::PeerConnected(remote) = event {
                connected.push((who, remote));
            }
        }
        connected.sort();
        let mut expected = vec![(a.clone(), b.clone()), (b.clone(), a.clone())];
        expected.sort();
        assert_eq!(connected, expected);

        assert_eq!(h.meshes[&a].connected_peers(), vec![b.clone()]);
        assert_eq!(h.meshes[&b].connected_peers(), vec![a.clone()]);
        assert!(h.net.is_linked(&a, &b));
    }

    #[tokio::test]
    async fn test_root_close_unregisters_both_sides() {
        let (mut h, eps) = Harness::new(2);
        let (a, b) = (eps[0].clone(), eps[1].clone());
        h.meshes[&a].connect(&b).unwrap();
        let mut connected = 0;
        while connected < 2 {
            if let (_, MeshEvent::PeerConnected(_)) = h.next_event().await {
                connected += 1;
            }
        }

        let old = h.meshes[&a].peer(&b).unwrap();
        h.meshes[&a].disconnect(&b);
        let mut closed = Vec::new();
        while closed.len() < 2 {
            let (who, event) = h.next_event().await;
            if let MeshEvent::PeerClosed(remote) = event {
                closed.push((who, remote));
            }
        }
        assert!(closed.contains(&(a.clone(), b.clone())));
        assert!(closed.contains(&(b.clone(), a.clone())));
        assert!(h.meshes[&a].peers().is_empty());
        assert!(h.meshes[&b].peers().is_empty());

        // A new attempt gets a fresh instance
        let fresh = h.meshes[&a].connect(&b).unwrap();
        assert_ne!(fresh.instance(), old.instance());
    }

    #[tokio::test]
    async fn test_full_mesh_of_three() {
        let (mut h, eps) = Harness::new(3);
        h.meshes[&eps[0]].connect(&eps[1]).unwrap();
        h.meshes[&eps[0]].connect(&eps[2]).unwrap();
        h.meshes[&eps[2]].connect(&eps[1]).unwrap();

        let mut connected = 0;
        while connected < 6 {
            if let (_, MeshEvent::PeerConnected(_)) = h.next_event().await {
                connected += 1;
            }
        }
        for ep in &eps {
            assert_eq!(h.meshes[ep].connected_peers().len(), 2);
        }

        let root = h.meshes[&eps[1]].peer(&eps[2]).unwrap().root().clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = h.meshes[&eps[2]]
            .peer(&eps[1])
            .unwrap()
            .root()
            .subscribe(move |event| {
                if let ChannelEvent::Message(data) = event {
                    let _ = tx.send(data);
                }
            });
        root.send(json!("hi from 1")).await.unwrap();
        assert_eq!(rx.recv().await, Some(json!("hi from 1")));
    }

    #[tokio::test]
    async fn test_unknown_non_offer_signal_dropped() {
        let local = Endpoint::generate();
        let (mesh, _outbox) = Mesh::new(local, Arc::new(LoopbackNetwork::new()), MeshConfig::default());
        let stranger = Endpoint::generate();
        mesh.handle_signal(
            &stranger,
            Signal::Description(crate::protocol::SessionDescription::answer("v=0")),
        );
        assert!(mesh.peers().is_empty());

        mesh.handle_signal(
            &stranger,
            Signal::Description(crate::protocol::SessionDescription::offer("v=0")),
        );
        assert_eq!(mesh.peers(), vec![stranger]);
    }
}
