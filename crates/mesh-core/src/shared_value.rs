//! Shared value synchronization.
//!
//! A [`SharedValue`] keeps one scalar eventually consistent across a fixed
//! group of peers. It owns one local [`TimestampedHistory`] and one history
//! per remote peer, recording what each remote has told us about its own
//! clock. The global clock is the minimum front clock across every history;
//! everything below it is known to every participant and gets collapsed.
//!
//! Like the negotiation state machine, this type does no I/O. Every operation
//! returns the [`Outgoing`] messages the caller must deliver, in order, to the
//! named peers. [`crate::sync::SyncSession`] wires it to channels.
//!
//! Messages between two peers must arrive in the order they were produced;
//! messages on different links may interleave freely. Under that ordering
//! every peer reconstructs the same histories, so every peer commits the
//! same global value at every clock.

use crate::events::{EventBus, Subscription};
use crate::history::{Clock, HistoryError, TimestampedHistory};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Can't set an absent value")]
    AbsentValue,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("A shared value can't list its own peer as a remote: {0}")]
    SelfAsRemote(String),

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Wire messages of the synchronization protocol.
///
/// Every message carries the sender's own clock (`lClock`); `set` also
/// carries the newest clock of the receiver the sender has incorporated
/// (`rClock`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum SyncMessage {
    /// My value is now `value` at my clock `l_clock`; I last heard from you
    /// at your clock `r_clock`.
    Set {
        #[serde(rename = "rClock")]
        r_clock: Clock,
        #[serde(rename = "lClock")]
        l_clock: Clock,
        value: Value,
    },
    /// I adopted your value; my clock is now `l_clock`.
    Ack {
        #[serde(rename = "lClock")]
        l_clock: Clock,
    },
    /// I merged; my value is `value` at my clock `l_clock`.
    AckMerge {
        #[serde(rename = "lClock")]
        l_clock: Clock,
        value: Value,
    },
}

/// A message the caller must deliver to `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing<P, M = SyncMessage> {
    pub to: P,
    pub message: M,
}

/// Committed global value over the clocks `since..=clock`.
///
/// Published whenever the global clock advances, one update per run of
/// equal values, so consecutive updates cover every clock exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalUpdate {
    pub since: Clock,
    pub clock: Clock,
    pub value: Option<Value>,
}

/// One synchronized scalar shared with a fixed set of remote peers.
///
/// `Value::Null` is the absent marker and can't be set.
pub struct SharedValue<P> {
    me: P,
    local: TimestampedHistory<Value>,
    /// Ordered so outgoing messages come out in a deterministic order
    remotes: BTreeMap<P, TimestampedHistory<Value>>,
    /// Last global clock announced to observers
    announced: Clock,
    updates: Arc<EventBus<GlobalUpdate>>,
}

impl<P: Ord + Clone + Debug> SharedValue<P> {
    /// Create a shared value for `me` synchronizing with `remotes`.
    ///
    /// Group membership is fixed for the lifetime of the value.
    pub fn new(me: P, remotes: impl IntoIterator<Item = P>) -> Result<Self, SyncError> {
        let mut histories = BTreeMap::new();
        for peer in remotes {
            if peer == me {
                return Err(SyncError::SelfAsRemote(format!("{:?}", peer)));
            }
            histories.insert(peer, TimestampedHistory::new());
        }
        Ok(Self {
            me,
            local: TimestampedHistory::new(),
            remotes: histories,
            announced: 0,
            updates: Arc::new(EventBus::new()),
        })
    }

    pub fn me(&self) -> &P {
        &self.me
    }

    pub fn peers(&self) -> impl Iterator<Item = &P> {
        self.remotes.keys()
    }

    pub fn local_clock(&self) -> Clock {
        self.local.front_clock()
    }

    pub fn local_value(&self) -> Option<&Value> {
        self.local.front_value()
    }

    pub fn local_history(&self) -> &TimestampedHistory<Value> {
        &self.local
    }

    pub fn remote_history(&self, peer: &P) -> Option<&TimestampedHistory<Value>> {
        self.remotes.get(peer)
    }

    /// Minimum front clock across the local and every remote history.
    pub fn global_clock(&self) -> Clock {
        self.histories()
            .map(TimestampedHistory::front_clock)
            .min()
            .unwrap_or(0)
    }

    /// Merge of the values every history holds at the global clock.
    ///
    /// Majority wins. Ties go to the value whose compact JSON sorts lowest,
    /// and an absent slot never wins a tie against a present value.
    pub fn global_value(&self) -> Option<Value> {
        self.value_at(self.global_clock())
    }

    fn value_at(&self, clock: Clock) -> Option<Value> {
        let mut votes: BTreeMap<String, (usize, &Value)> = BTreeMap::new();
        let mut absent = 0usize;
        for history in self.histories() {
            match history.get(clock) {
                Some(value) => {
                    votes.entry(value.to_string()).or_insert((0, value)).0 += 1;
                }
                None => absent += 1,
            }
        }

        let mut best: Option<(usize, &Value)> = None;
        for (count, value) in votes.values() {
            if best.is_none_or(|(top, _)| *count > top) {
                best = Some((*count, *value));
            }
        }
        match best {
            Some((count, value)) if count >= absent => Some(value.clone()),
            _ => None,
        }
    }

    /// True when every history shares the same front and back clock.
    pub fn is_global(&self) -> bool {
        let front = self.local.front_clock();
        let back = self.local.back_clock();
        self.remotes
            .values()
            .all(|h| h.front_clock() == front && h.back_clock() == back)
    }

    /// Observe committed global values.
    pub fn subscribe(&self, callback: impl Fn(GlobalUpdate) + Send + Sync + 'static) -> Subscription {
        self.updates.subscribe(callback)
    }

    /// Replace the local value and tell every remote.
    pub fn set_local(&mut self, value: Value) -> Result<Vec<Outgoing<P>>, SyncError> {
        if value.is_null() {
            return Err(SyncError::AbsentValue);
        }

        let l_clock = self.local.push(value.clone())?;
        debug!(peer = ?self.me, clock = l_clock, "Local value set");

        let outgoing = self
            .remotes
            .iter()
            .map(|(peer, history)| Outgoing {
                to: peer.clone(),
                message: SyncMessage::Set {
                    r_clock: history.front_clock(),
                    l_clock,
                    value: value.clone(),
                },
            })
            .collect();

        self.collapse()?;
        Ok(outgoing)
    }

    /// Apply a message received from `from`.
    pub fn receive(&mut self, from: &P, message: SyncMessage) -> Result<Vec<Outgoing<P>>, SyncError> {
        if !self.remotes.contains_key(from) {
            return Err(SyncError::UnknownPeer(format!("{:?}", from)));
        }

        let mut outgoing = Vec::new();
        match message {
            SyncMessage::Set {
                r_clock,
                l_clock,
                value,
            } => self.on_set(from, r_clock, l_clock, value, &mut outgoing)?,
            SyncMessage::Ack { l_clock } => {
                // They adopted the value we held at that clock
                match self.local.get(l_clock).cloned() {
                    Some(value) => self.record_remote(from, l_clock, value)?,
                    None => warn!(peer = ?from, clock = l_clock, "Ack for a clock with no local value"),
                }
            }
            SyncMessage::AckMerge { l_clock, value } => {
                self.record_remote(from, l_clock, value)?;
            }
        }

        self.collapse()?;
        Ok(outgoing)
    }

    fn on_set(
        &mut self,
        from: &P,
        r_clock: Clock,
        l_clock: Clock,
        value: Value,
        outgoing: &mut Vec<Outgoing<P>>,
    ) -> Result<(), SyncError> {
        self.record_remote(from, l_clock, value.clone())?;

        let front = self.local.front_clock();
        if r_clock == front {
            // The sender saw everything we have; adopt if it's newer
            if front < l_clock {
                self.local.set(l_clock, value)?;
                outgoing.push(Outgoing {
                    to: from.clone(),
                    message: SyncMessage::Ack { l_clock },
                });
                self.announce(from, outgoing);
            }
        } else if r_clock < front {
            // The sender is behind; keep our value and stamp it at their clock
            let Some(current) = self.local.front_value().cloned() else {
                warn!(peer = ?from, clock = front, "No local value to merge");
                return Ok(());
            };
            let advanced = l_clock > front;
            if advanced {
                self.local.set(l_clock, current.clone())?;
            }
            outgoing.push(Outgoing {
                to: from.clone(),
                message: SyncMessage::AckMerge {
                    l_clock: self.local.front_clock(),
                    value: current,
                },
            });
            if advanced {
                self.announce(from, outgoing);
            }
        } else {
            warn!(
                peer = ?from,
                r_clock,
                local_clock = front,
                "Set claims a clock we never reached, ignoring"
            );
        }
        Ok(())
    }

    /// Tell every remote other than `except` about our new local front.
    fn announce(&self, except: &P, outgoing: &mut Vec<Outgoing<P>>) {
        let Some(value) = self.local.front_value() else {
            return;
        };
        let l_clock = self.local.front_clock();
        for peer in self.remotes.keys().filter(|p| *p != except) {
            outgoing.push(Outgoing {
                to: peer.clone(),
                message: SyncMessage::AckMerge {
                    l_clock,
                    value: value.clone(),
                },
            });
        }
    }

    fn record_remote(&mut self, peer: &P, clock: Clock, value: Value) -> Result<(), SyncError> {
        let history = self
            .remotes
            .get_mut(peer)
            .ok_or_else(|| SyncError::UnknownPeer(format!("{:?}", peer)))?;
        if clock > history.front_clock() {
            history.set(clock, value)?;
        }
        Ok(())
    }

    /// Publish the clocks the global clock moved past, then forget
    /// everything below it.
    fn collapse(&mut self) -> Result<(), SyncError> {
        let global = self.global_clock();
        if global > self.announced {
            for update in self.commits(self.announced + 1, global) {
                debug!(peer = ?self.me, since = update.since, clock = update.clock, value = ?update.value, "Global value committed");
                self.updates.emit(update);
            }
            self.announced = global;
        }

        if global == 0 {
            return Ok(());
        }
        let horizon = global - 1;
        if horizon >= self.local.back_clock() {
            self.local.forget(horizon)?;
        }
        for history in self.remotes.values_mut() {
            if horizon >= history.back_clock() {
                history.forget(horizon)?;
            }
        }
        Ok(())
    }

    /// Global values for `first..=last`, one update per run of equal values.
    ///
    /// The merged value can only change where some history changes, so only
    /// those clocks are evaluated.
    fn commits(&self, first: Clock, last: Clock) -> Vec<GlobalUpdate> {
        let mut starts: BTreeSet<Clock> = self
            .histories()
            .flat_map(TimestampedHistory::change_clocks)
            .filter(|clock| *clock > first && *clock <= last)
            .collect();
        starts.insert(first);

        let mut updates: Vec<GlobalUpdate> = Vec::new();
        let mut starts = starts.into_iter().peekable();
        while let Some(since) = starts.next() {
            let clock = starts.peek().map_or(last, |next| next - 1);
            let value = self.value_at(since);
            match updates.last_mut() {
                Some(previous) if previous.value == value => previous.clock = clock,
                _ => updates.push(GlobalUpdate { since, clock, value }),
            }
        }
        updates
    }

    fn histories(&self) -> impl Iterator<Item = &TimestampedHistory<Value>> {
        std::iter::once(&self.local).chain(self.remotes.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;
    use std::sync::Mutex;

    type Peer = &'static str;

    /// Three shared values wired through an in-memory message pool.
    struct Group {
        values: BTreeMap<Peer, SharedValue<Peer>>,
        in_flight: Vec<(Peer, Outgoing<Peer>)>,
        rng: Option<StdRng>,
    }

    impl Group {
        fn new(peers: &[Peer]) -> Self {
            let values = peers
                .iter()
                .map(|me| {
                    let others = peers.iter().copied().filter(|p| p != me);
                    (*me, SharedValue::new(*me, others).unwrap())
                })
                .collect();
            Self {
                values,
                in_flight: Vec::new(),
                rng: None,
            }
        }

        fn shuffled(peers: &[Peer], seed: u64) -> Self {
            let mut group = Self::new(peers);
            group.rng = Some(StdRng::seed_from_u64(seed));
            group
        }

        fn set(&mut self, peer: Peer, value: &str) {
            let out = self
                .values
                .get_mut(peer)
                .unwrap()
                .set_local(json!(value))
                .unwrap();
            self.in_flight.extend(out.into_iter().map(|o| (peer, o)));
        }

        /// Deliver one message: the oldest, or the oldest on a random link
        /// when shuffled.
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
                .values
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

        fn drain_some(&mut self, n: usize) {
            for _ in 0..n {
                if !self.step() {
                    break;
                }
            }
        }

        /// Asserts every peer agrees and returns the agreed state.
        fn agreed(&self) -> (Option<Value>, Clock) {
            let mut states = self
                .values
                .values()
                .map(|v| (v.global_value(), v.global_clock(), v.is_global()));
            let (value, clock, global) = states.next().unwrap();
            assert!(global, "first peer is not global");
            for (other_value, other_clock, other_global) in states {
                assert_eq!(other_value, value);
                assert_eq!(other_clock, clock);
                assert!(other_global);
            }
            (value, clock)
        }
    }

    #[test]
    fn test_three_peers_scenario() {
        let mut group = Group::new(&["a", "b", "c"]);

        group.set("a", "1");
        group.drain();
        assert_eq!(group.agreed(), (Some(json!("1")), 1));

        group.set("b", "2");
        group.drain();
        assert_eq!(group.agreed(), (Some(json!("2")), 2));

        group.set("a", "1");
        group.drain();
        assert_eq!(group.agreed(), (Some(json!("1")), 3));

        // Four divergent updates before any exchange
        group.set("a", "2");
        group.set("b", "3");
        group.set("b", "5");
        group.set("c", "4");
        group.drain();
        assert_eq!(group.agreed(), (Some(json!("2")), 5));
    }

    #[test]
    fn test_divergent_round_without_warmup() {
        let mut group = Group::new(&["a", "b", "c"]);
        group.set("a", "1");
        group.drain();
        group.set("b", "2");
        group.drain();

        group.set("a", "2");
        group.set("b", "3");
        group.set("b", "5");
        group.set("c", "4");
        group.drain();
        assert_eq!(group.agreed(), (Some(json!("2")), 4));
    }

    #[test]
    fn test_converges_under_any_link_interleaving() {
        for seed in 0..50 {
            let mut group = Group::shuffled(&["a", "b", "c"], seed);

            group.set("a", "1");
            group.drain();
            assert_eq!(group.agreed(), (Some(json!("1")), 1), "seed {}", seed);

            group.set("b", "2");
            group.drain();
            group.set("a", "1");
            group.drain();

            group.set("a", "2");
            group.set("b", "3");
            group.set("b", "5");
            group.set("c", "4");
            group.drain();
            assert_eq!(group.agreed(), (Some(json!("2")), 5), "seed {}", seed);

            // Interleave sets with partial delivery, then let it settle
            for _ in 0..5 {
                group.set("a", "6");
                group.drain_some(1);
                group.set("b", "7");
                group.set("c", "8");
                group.drain_some(2);
                group.set("c", "9");
                group.set("b", "10");
                group.drain_some(4);
                for v in ["11", "12", "13", "14"] {
                    group.set("a", v);
                }
                group.drain();
                group.agreed();
            }
        }
    }

    #[test]
    fn test_history_is_collapsed() {
        let mut group = Group::new(&["a", "b", "c"]);
        for v in ["1", "2", "3", "4"] {
            group.set("a", v);
            group.drain();
        }
        for value in group.values.values() {
            let clock = value.global_clock();
            assert_eq!(clock, 4);
            assert_eq!(value.local_history().back_clock(), clock);
            for peer in value.peers() {
                assert_eq!(value.remote_history(peer).unwrap().len(), 1);
            }
        }
    }

    #[test]
    fn test_absent_value_rejected() {
        let mut value = SharedValue::new("a", ["b"]).unwrap();
        assert!(matches!(value.set_local(Value::Null), Err(SyncError::AbsentValue)));
        assert_eq!(value.local_clock(), 0);
    }

    #[test]
    fn test_self_as_remote_rejected() {
        assert!(matches!(
            SharedValue::new("a", ["b", "a"]),
            Err(SyncError::SelfAsRemote(_))
        ));
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let mut value = SharedValue::new("a", ["b"]).unwrap();
        let result = value.receive(&"z", SyncMessage::Ack { l_clock: 1 });
        assert!(matches!(result, Err(SyncError::UnknownPeer(_))));
    }

    #[test]
    fn test_set_from_the_future_is_ignored() {
        let mut value = SharedValue::new("a", ["b"]).unwrap();
        let out = value
            .receive(
                &"b",
                SyncMessage::Set {
                    r_clock: 3,
                    l_clock: 4,
                    value: json!("x"),
                },
            )
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(value.local_clock(), 0);
        // The sender's own history is still recorded
        assert_eq!(value.remote_history(&"b").unwrap().get(4), Some(&json!("x")));
    }

    #[test]
    fn test_set_local_broadcasts_to_every_remote() {
        let mut value = SharedValue::new("a", ["c", "b"]).unwrap();
        let out = value.set_local(json!({"n": 1})).unwrap();
        assert_eq!(
            out,
            vec![
                Outgoing {
                    to: "b",
                    message: SyncMessage::Set {
                        r_clock: 0,
                        l_clock: 1,
                        value: json!({"n": 1})
                    }
                },
                Outgoing {
                    to: "c",
                    message: SyncMessage::Set {
                        r_clock: 0,
                        l_clock: 1,
                        value: json!({"n": 1})
                    }
                },
            ]
        );
    }

    #[test]
    fn test_tie_prefers_lowest_value_and_present_over_absent() {
        let mut value = SharedValue::new("a", ["b", "c"]).unwrap();
        value.set_local(json!("z")).unwrap();
        value
            .receive(&"b", SyncMessage::AckMerge { l_clock: 1, value: json!("m") })
            .unwrap();
        // "c" is still absent at clock 0, so the global clock stays at 0
        assert_eq!(value.global_clock(), 0);
        assert_eq!(value.global_value(), None);

        value
            .receive(&"c", SyncMessage::AckMerge { l_clock: 1, value: json!("q") })
            .unwrap();
        assert_eq!(value.global_clock(), 1);
        assert_eq!(value.global_value(), Some(json!("m")));
    }

    #[test]
    fn test_global_updates_published() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut group = Group::new(&["a", "b"]);
        let sink = Arc::clone(&seen);
        let _sub = group.values["b"].subscribe(move |update| {
            sink.lock().unwrap().push(update);
        });

        group.set("a", "1");
        group.drain();
        group.set("b", "2");
        group.drain();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                GlobalUpdate { since: 1, clock: 1, value: Some(json!("1")) },
                GlobalUpdate { since: 2, clock: 2, value: Some(json!("2")) },
            ]
        );
    }

    /// Expand each peer's updates into one committed value per clock.
    fn record_commits(group: &Group) -> (BTreeMap<Peer, Arc<Mutex<Vec<GlobalUpdate>>>>, Vec<Subscription>) {
        let mut logs = BTreeMap::new();
        let mut subs = Vec::new();
        for (peer, value) in &group.values {
            let log = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&log);
            subs.push(value.subscribe(move |update| sink.lock().unwrap().push(update)));
            logs.insert(*peer, log);
        }
        (logs, subs)
    }

    fn per_clock(updates: &[GlobalUpdate]) -> Vec<Option<Value>> {
        let mut values = Vec::new();
        let mut next = 1;
        for update in updates {
            assert_eq!(update.since, next, "commit stream skipped clock {}", next);
            assert!(update.clock >= update.since);
            for _ in update.since..=update.clock {
                values.push(update.value.clone());
            }
            next = update.clock + 1;
        }
        values
    }

    #[test]
    fn test_commits_are_continuous_and_identical() {
        for seed in 0..50 {
            let mut group = Group::shuffled(&["a", "b", "c"], seed);
            let (logs, _subs) = record_commits(&group);

            group.set("a", "1");
            group.drain();
            group.set("b", "2");
            group.drain();
            group.set("a", "1");
            group.drain();
            group.set("a", "2");
            group.set("b", "3");
            group.set("b", "5");
            group.set("c", "4");
            group.drain();
            for _ in 0..10 {
                group.set("a", "6");
                group.drain_some(1);
                group.set("b", "7");
                group.set("c", "8");
                group.drain_some(2);
                group.set("c", "9");
                group.set("b", "10");
                group.drain_some(4);
                for v in ["11", "12", "13", "14"] {
                    group.set("a", v);
                }
                group.drain();
            }
            let (value, clock) = group.agreed();

            let a = per_clock(&logs["a"].lock().unwrap());
            assert!(a.len() > 10, "seed {}", seed);
            assert_eq!(a.len() as Clock, clock, "seed {}", seed);
            assert_eq!(a.last().cloned().flatten(), value, "seed {}", seed);
            assert!(a.iter().all(Option::is_some), "seed {}", seed);
            for peer in ["b", "c"] {
                assert_eq!(per_clock(&logs[peer].lock().unwrap()), a, "seed {} peer {}", seed, peer);
            }
        }
    }

    #[test]
    fn test_large_clock_jump_is_cheap() {
        let mut value = SharedValue::new("a", ["b"]).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = value.subscribe(move |update| sink.lock().unwrap().push(update));

        let out = value
            .receive(
                &"b",
                SyncMessage::Set {
                    r_clock: 0,
                    l_clock: 1 << 40,
                    value: json!("x"),
                },
            )
            .unwrap();
        assert_eq!(out, vec![Outgoing { to: "b", message: SyncMessage::Ack { l_clock: 1 << 40 } }]);
        assert_eq!(value.global_clock(), 1 << 40);
        assert_eq!(value.global_value(), Some(json!("x")));
        assert_eq!(value.local_history().len(), 2);
        assert_eq!(value.local_history().change_clocks().count(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                GlobalUpdate { since: 1, clock: (1 << 40) - 1, value: None },
                GlobalUpdate { since: 1 << 40, clock: 1 << 40, value: Some(json!("x")) },
            ]
        );
    }

    #[test]
    fn test_set_local_at_max_clock_fails() {
        let mut value = SharedValue::new("a", ["b"]).unwrap();
        value
            .receive(
                &"b",
                SyncMessage::Set {
                    r_clock: 0,
                    l_clock: Clock::MAX,
                    value: json!("x"),
                },
            )
            .unwrap();
        assert!(matches!(
            value.set_local(json!("y")),
            Err(SyncError::History(HistoryError::ClockOverflow { .. }))
        ));
        assert_eq!(value.local_value(), Some(&json!("x")));
    }

    #[test]
    fn test_message_wire_format() {
        let set = SyncMessage::Set {
            r_clock: 2,
            l_clock: 3,
            value: json!("v"),
        };
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            json!({"id": "set", "rClock": 2, "lClock": 3, "value": "v"})
        );

        let parsed: SyncMessage =
            serde_json::from_value(json!({"id": "ackMerge", "lClock": 7, "value": 1})).unwrap();
        assert_eq!(parsed, SyncMessage::AckMerge { l_clock: 7, value: json!(1) });

        let ack: SyncMessage = serde_json::from_value(json!({"id": "ack", "lClock": 1})).unwrap();
        assert_eq!(ack, SyncMessage::Ack { l_clock: 1 });
    }
}
