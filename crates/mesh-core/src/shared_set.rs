//! Shared set synchronization.
//!
//! A [`SharedSet`] keeps a set of strings eventually consistent across a
//! fixed group of peers. Every local `add` or `delete` advances the local
//! clock and is broadcast stamped with it; receiving a newer stamp pulls the
//! receiver's clock forward, and the receiver announces its new clock to
//! everyone. The global clock is the minimum clock known across the group.
//!
//! Operations at or below the global clock are committed: folded into the
//! global set in `(clock, origin)` order, so the last writer wins per
//! element. Operations above it stay pending and only show in the local set.
//!
//! Same ordering requirement as [`crate::shared_value`]: messages between two
//! peers must arrive in the order they were produced. Under that ordering no
//! peer commits past an operation it has not received yet.

use crate::history::{Clock, HistoryError};
use crate::shared_value::{Outgoing, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use tracing::{debug, warn};

/// Wire messages of the set protocol. Every message carries the sender's
/// clock (`lClock`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum SetMessage {
    /// I added `element` at my clock `l_clock`.
    Add {
        #[serde(rename = "lClock")]
        l_clock: Clock,
        element: String,
    },
    /// I deleted `element` at my clock `l_clock`.
    Delete {
        #[serde(rename = "lClock")]
        l_clock: Clock,
        element: String,
    },
    /// My clock is now `l_clock`.
    Clock {
        #[serde(rename = "lClock")]
        l_clock: Clock,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Delete,
}

/// One synchronized set shared with a fixed set of remote peers.
pub struct SharedSet<P> {
    me: P,
    clock: Clock,
    /// Newest clock each remote has told us about
    remotes: BTreeMap<P, Clock>,
    /// Elements present at `committed`
    committed_set: BTreeSet<String>,
    committed: Clock,
    /// Operations above `committed`, in commit order
    pending: BTreeMap<(Clock, P), (Op, String)>,
}

impl<P: Ord + Clone + Debug> SharedSet<P> {
    /// Create an empty set for `me` synchronizing with `remotes`.
    pub fn new(me: P, remotes: impl IntoIterator<Item = P>) -> Result<Self, SyncError> {
        let mut clocks = BTreeMap::new();
        for peer in remotes {
            if peer == me {
                return Err(SyncError::SelfAsRemote(format!("{:?}", peer)));
            }
            clocks.insert(peer, 0);
        }
        Ok(Self {
            me,
            clock: 0,
            remotes: clocks,
            committed_set: BTreeSet::new(),
            committed: 0,
            pending: BTreeMap::new(),
        })
    }

    pub fn me(&self) -> &P {
        &self.me
    }

    pub fn local_clock(&self) -> Clock {
        self.clock
    }

    pub fn global_clock(&self) -> Clock {
        self.remotes
            .values()
            .copied()
            .fold(self.clock, Clock::min)
    }

    /// True when every remote has caught up with our clock.
    pub fn is_global(&self) -> bool {
        self.remotes.values().all(|clock| *clock == self.clock)
    }

    /// Committed elements plus every pending operation applied in order.
    pub fn local_set(&self) -> BTreeSet<String> {
        let mut set = self.committed_set.clone();
        for (op, element) in self.pending.values() {
            apply(&mut set, *op, element);
        }
        set
    }

    /// Elements every peer is known to agree on.
    pub fn global_set(&self) -> &BTreeSet<String> {
        &self.committed_set
    }

    pub fn add_local(&mut self, element: impl Into<String>) -> Result<Vec<Outgoing<P, SetMessage>>, SyncError> {
        self.local_op(Op::Add, element.into())
    }

    pub fn delete_local(&mut self, element: impl Into<String>) -> Result<Vec<Outgoing<P, SetMessage>>, SyncError> {
        self.local_op(Op::Delete, element.into())
    }

    fn local_op(&mut self, op: Op, element: String) -> Result<Vec<Outgoing<P, SetMessage>>, SyncError> {
        let clock = self
            .clock
            .checked_add(1)
            .ok_or(HistoryError::ClockOverflow { front: self.clock })?;
        self.clock = clock;
        self.pending.insert((clock, self.me.clone()), (op, element.clone()));
        debug!(peer = ?self.me, clock, ?op, %element, "Local set operation");

        let message = match op {
            Op::Add => SetMessage::Add { l_clock: clock, element },
            Op::Delete => SetMessage::Delete { l_clock: clock, element },
        };
        let outgoing = self.broadcast(message);
        self.collapse();
        Ok(outgoing)
    }

    /// Process one message from `from` and return the replies to send.
    pub fn receive(&mut self, from: &P, message: SetMessage) -> Result<Vec<Outgoing<P, SetMessage>>, SyncError> {
        let Some(known) = self.remotes.get(from).copied() else {
            return Err(SyncError::UnknownPeer(format!("{:?}", from)));
        };

        let mut outgoing = Vec::new();
        match message {
            SetMessage::Add { l_clock, element } => {
                self.on_op(from, known, l_clock, Op::Add, element, &mut outgoing)
            }
            SetMessage::Delete { l_clock, element } => {
                self.on_op(from, known, l_clock, Op::Delete, element, &mut outgoing)
            }
            SetMessage::Clock { l_clock } => {
                if l_clock > known {
                    self.remotes.insert(from.clone(), l_clock);
                }
            }
        }

        self.collapse();
        Ok(outgoing)
    }

    fn on_op(
        &mut self,
        from: &P,
        known: Clock,
        l_clock: Clock,
        op: Op,
        element: String,
        outgoing: &mut Vec<Outgoing<P, SetMessage>>,
    ) {
        if l_clock <= known || l_clock <= self.committed {
            warn!(peer = ?from, clock = l_clock, known, committed = self.committed, "Ignoring stale set operation");
            return;
        }
        self.remotes.insert(from.clone(), l_clock);
        self.pending.insert((l_clock, from.clone()), (op, element));

        if l_clock > self.clock {
            self.clock = l_clock;
            outgoing.extend(self.broadcast(SetMessage::Clock { l_clock }));
        }
    }

    fn broadcast(&self, message: SetMessage) -> Vec<Outgoing<P, SetMessage>> {
        self.remotes
            .keys()
            .map(|peer| Outgoing {
                to: peer.clone(),
                message: message.clone(),
            })
            .collect()
    }

    /// Fold every pending operation at or below the global clock.
    fn collapse(&mut self) {
        let global = self.global_clock();
        if global <= self.committed {
            return;
        }
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > global {
                break;
            }
            let (op, element) = entry.remove();
            apply(&mut self.committed_set, op, &element);
        }
        self.committed = global;
        debug!(peer = ?self.me, clock = global, size = self.committed_set.len(), "Committed set");
    }
}

fn apply(set: &mut BTreeSet<String>, op: Op, element: &str) {
    match op {
        Op::Add => {
            set.insert(element.to_string());
        }
        Op::Delete => {
            set.remove(element);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    type Peer = &'static str;

    /// Shared sets wired through an in-memory message pool, ordered per link.
    struct Group {
        sets: BTreeMap<Peer, SharedSet<Peer>>,
        in_flight: Vec<(Peer, Outgoing<Peer, SetMessage>)>,
        rng: Option<StdRng>,
    }

    impl Group {
        fn new(peers: &[Peer]) -> Self {
            let sets = peers
                .iter()
                .map(|me| {
                    let others = peers.iter().copied().filter(|p| p != me);
                    (*me, SharedSet::new(*me, others).unwrap())
                })
                .collect();
            Self {
                sets,
                in_flight: Vec::new(),
                rng: None,
            }
        }

        fn shuffled(peers: &[Peer], seed: u64) -> Self {
            let mut group = Self::new(peers);
            group.rng = Some(StdRng::seed_from_u64(seed));
            group
        }

        fn add(&mut self, peer: Peer, element: &str) {
            let out = self.sets.get_mut(peer).unwrap().add_local(element).unwrap();
            self.in_flight.extend(out.into_iter().map(|o| (peer, o)));
        }

        fn delete(&mut self, peer: Peer, element: &str) {
            let out = self.sets.get_mut(peer).unwrap().delete_local(element).unwrap();
            self.in_flight.extend(out.into_iter().map(|o| (peer, o)));
        }

        fn step(&mut self) -> bool {
            if self.in_flight.is_empty() {
                return false;
            }
            let index = match self.rng.as_mut() {
                Some(rng) => {
                    let (from, to) = {
                        let (from, out) = &self.in_flight[rng.random_range(0..self.in_flight.len())];
                        (*from, out.to)
                    };
                    self.in_flight
                        .iter()
                        .position(|(f, out)| *f == from && out.to == to)
                        .unwrap_or(0)
                }
                None => 0,
            };
            let (from, outgoing) = self.in_flight.remove(index);
            let replies = self
                .sets
                .get_mut(outgoing.to)
                .unwrap()
                .receive(&from, outgoing.message)
                .unwrap();
            self.in_flight
                .extend(replies.into_iter().map(|o| (outgoing.to, o)));
            true
        }

        fn drain(&mut self) {
            while self.step() {}
        }

        fn set(&self, peer: Peer) -> &SharedSet<Peer> {
            &self.sets[peer]
        }
    }

    fn elements(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_add_then_delete_scenario() {
        let peers = ["alice", "bob", "charles"];
        let mut group = Group::new(&peers);
        let alice = group.set("alice");
        assert!(alice.local_set().is_empty());
        assert!(alice.global_set().is_empty());
        assert_eq!((alice.local_clock(), alice.global_clock()), (0, 0));

        group.add("alice", "1");
        let alice = group.set("alice");
        assert!(alice.local_set().contains("1"));
        assert!(!alice.global_set().contains("1"));
        assert_eq!(alice.local_clock(), 1);
        assert_eq!(alice.global_clock(), 0);

        group.drain();
        for peer in peers {
            let set = group.set(peer);
            assert!(set.local_set().contains("1"), "{peer} local");
            assert!(set.global_set().contains("1"), "{peer} global");
            assert_eq!(set.local_clock(), 1);
            assert_eq!(set.global_clock(), 1);
            assert!(set.is_global());
        }

        group.delete("bob", "1");
        group.add("bob", "2");
        group.add("bob", "3");
        let bob = group.set("bob");
        assert_eq!(bob.local_set(), elements(&["2", "3"]));
        assert!(bob.global_set().contains("1"));
        assert_eq!(bob.local_clock(), 4);
        assert_eq!(bob.global_clock(), 1);

        group.drain();
        for peer in peers {
            let set = group.set(peer);
            assert_eq!(set.local_set(), elements(&["2", "3"]), "{peer} local");
            assert_eq!(set.global_set(), &elements(&["2", "3"]), "{peer} global");
            assert_eq!(set.local_clock(), 4);
            assert_eq!(set.global_clock(), 4);
        }
    }

    #[test]
    fn test_concurrent_add_and_delete_resolve_by_origin() {
        let mut group = Group::new(&["a", "b"]);
        group.add("a", "x");
        group.delete("b", "x");
        group.drain();

        // Both stamped 1; "b" orders after "a" so its delete lands last
        for peer in ["a", "b"] {
            assert!(group.set(peer).global_set().is_empty(), "{peer}");
            assert!(group.set(peer).local_set().is_empty(), "{peer}");
        }
    }

    #[test]
    fn test_converges_under_any_link_interleaving() {
        let peers = ["a", "b", "c"];
        let items = ["p", "q", "r", "s"];
        for seed in 0..50 {
            let mut group = Group::shuffled(&peers, seed);
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1000));
            for _ in 0..30 {
                let peer = peers[rng.random_range(0..peers.len())];
                let item = items[rng.random_range(0..items.len())];
                if rng.random_bool(0.6) {
                    group.add(peer, item);
                } else {
                    group.delete(peer, item);
                }
                for _ in 0..rng.random_range(0..6) {
                    group.step();
                }
            }
            group.drain();

            let first = group.set("a");
            for peer in peers {
                let set = group.set(peer);
                assert!(set.is_global(), "seed {seed}: {peer} not global");
                assert_eq!(set.global_clock(), first.local_clock(), "seed {seed}");
                assert_eq!(set.global_set(), first.global_set(), "seed {seed}: {peer}");
                assert_eq!(&set.local_set(), set.global_set(), "seed {seed}: {peer}");
            }
        }
    }

    #[test]
    fn test_stale_operation_ignored() {
        let mut set = SharedSet::new("a", ["b"]).unwrap();
        let out = set
            .receive(&"b", SetMessage::Add { l_clock: 2, element: "x".into() })
            .unwrap();
        assert_eq!(
            out,
            vec![Outgoing { to: "b", message: SetMessage::Clock { l_clock: 2 } }]
        );

        // A replayed or older stamp from the same peer changes nothing
        let out = set
            .receive(&"b", SetMessage::Delete { l_clock: 2, element: "x".into() })
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(set.local_set(), elements(&["x"]));
        assert_eq!(set.global_set(), &elements(&["x"]));
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let mut set = SharedSet::new("a", ["b"]).unwrap();
        let result = set.receive(&"z", SetMessage::Clock { l_clock: 1 });
        assert!(matches!(result, Err(SyncError::UnknownPeer(_))));
        assert!(matches!(SharedSet::new("a", ["a"]), Err(SyncError::SelfAsRemote(_))));
    }

    #[test]
    fn test_wire_format() {
        let add = SetMessage::Add { l_clock: 3, element: "x".into() };
        assert_eq!(
            serde_json::to_value(&add).unwrap(),
            json!({"id": "add", "lClock": 3, "element": "x"})
        );
        let clock: SetMessage = serde_json::from_value(json!({"id": "clock", "lClock": 7})).unwrap();
        assert_eq!(clock, SetMessage::Clock { l_clock: 7 });
        let delete: SetMessage =
            serde_json::from_value(json!({"id": "delete", "lClock": 1, "element": "y"})).unwrap();
        assert_eq!(delete, SetMessage::Delete { l_clock: 1, element: "y".into() });
    }
}
