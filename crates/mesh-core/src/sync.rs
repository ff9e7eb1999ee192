//! Shared value over live channels.
//!
//! [`SharedValue`] is a pure state machine; a [`SyncSession`] owns one behind
//! a lock, feeds it the `set`/`ack`/`ackMerge` messages arriving on one
//! [`Channel`] per remote endpoint, and delivers what it produces.

use crate::channel::{Channel, ChannelConfig, ChannelError, ChannelEvent};
use crate::events::{EventBus, Subscription};
use crate::history::Clock;
use crate::peer::PeerConnection;
use crate::shared_value::{GlobalUpdate, Outgoing, SharedValue, SyncError, SyncMessage};
use crate::Endpoint;
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Channel tag used for shared values; the channel id names the value.
pub const SYNC_TAG: &str = "sync";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

struct SessionInner {
    local: Endpoint,
    value: Mutex<SharedValue<Endpoint>>,
    channels: HashMap<Endpoint, Channel>,
    outboxes: HashMap<Endpoint, mpsc::UnboundedSender<SyncMessage>>,
    updates: Arc<EventBus<GlobalUpdate>>,
    watches: Mutex<Vec<Subscription>>,
    pumps: Vec<AbortHandle>,
}

/// One shared value kept in sync with a fixed set of remote endpoints.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl SyncSession {
    /// Bind a fresh shared value to `channels`, one per remote endpoint.
    ///
    /// Subscribes before returning, so the channels may be connected
    /// afterwards without losing anything.
    pub fn new(local: Endpoint, channels: HashMap<Endpoint, Channel>) -> Result<Self, SessionError> {
        let value = SharedValue::new(local.clone(), channels.keys().cloned())?;

        // Queued while `value` is locked, so the queue order is commit order
        let (staged, unstaged) = mpsc::unbounded_channel();
        let value_watch = value.subscribe(move |update| {
            let _ = staged.send(update);
        });
        let updates = Arc::new(EventBus::new());

        let mut outboxes = HashMap::new();
        let mut pumps = vec![tokio::spawn(dispatch(unstaged, Arc::clone(&updates))).abort_handle()];
        for (remote, channel) in &channels {
            let (tx, rx) = mpsc::unbounded_channel();
            outboxes.insert(remote.clone(), tx);
            pumps.push(tokio::spawn(pump(channel.clone(), rx)).abort_handle());
        }

        let inner = Arc::new(SessionInner {
            local,
            value: Mutex::new(value),
            channels,
            outboxes,
            updates,
            watches: Mutex::new(vec![value_watch]),
            pumps,
        });

        let mut watches = Vec::new();
        for (remote, channel) in &inner.channels {
            let weak: Weak<SessionInner> = Arc::downgrade(&inner);
            let from = remote.clone();
            watches.push(channel.subscribe(move |event| {
                if let (Some(inner), ChannelEvent::Message(data)) = (weak.upgrade(), event) {
                    inner.on_message(&from, data);
                }
            }));
        }
        lock(&inner.watches).extend(watches);

        Ok(Self { inner })
    }

    /// Synchronize value `value_id` with every peer in `peers` over their
    /// `sync` channels, connecting those channels.
    pub async fn over_peers(local: &Endpoint, peers: &[PeerConnection], value_id: u32) -> Result<Self, SessionError> {
        let channels: HashMap<_, _> = peers
            .iter()
            .map(|peer| {
                (
                    peer.remote().clone(),
                    peer.channel(SYNC_TAG, value_id, ChannelConfig::default()),
                )
            })
            .collect();
        let session = Self::new(local.clone(), channels)?;
        try_join_all(session.inner.channels.values().map(Channel::connect)).await?;
        Ok(session)
    }

    pub fn local(&self) -> &Endpoint {
        &self.inner.local
    }

    pub fn peers(&self) -> Vec<Endpoint> {
        let mut peers: Vec<_> = self.inner.channels.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Replace the local value and announce it to every peer.
    pub fn set(&self, value: Value) -> Result<(), SessionError> {
        let outgoing = self.inner.value().set_local(value)?;
        self.inner.deliver(outgoing);
        Ok(())
    }

    pub fn local_value(&self) -> Option<Value> {
        self.inner.value().local_value().cloned()
    }

    pub fn local_clock(&self) -> Clock {
        self.inner.value().local_clock()
    }

    pub fn global_value(&self) -> Option<Value> {
        self.inner.value().global_value()
    }

    pub fn global_clock(&self) -> Clock {
        self.inner.value().global_clock()
    }

    pub fn is_global(&self) -> bool {
        self.inner.value().is_global()
    }

    /// Observe committed global values, in commit order.
    pub fn subscribe(&self, callback: impl Fn(GlobalUpdate) + Send + Sync + 'static) -> Subscription {
        self.inner.updates.subscribe(callback)
    }

    /// Stop syncing and close the channels.
    pub fn close(&self) {
        for pump in &self.inner.pumps {
            pump.abort();
        }
        for channel in self.inner.channels.values() {
            channel.close();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionInner {
    fn value(&self) -> MutexGuard<'_, SharedValue<Endpoint>> {
        lock(&self.value)
    }

    fn on_message(&self, from: &Endpoint, data: Value) {
        let message: SyncMessage = match serde_json::from_value(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(from = %from.short(), error = %e, "Dropping malformed sync message");
                return;
            }
        };
        let result = self.value().receive(from, message);
        match result {
            Ok(outgoing) => self.deliver(outgoing),
            Err(e) => warn!(from = %from.short(), error = %e, "Rejected sync message"),
        }
    }

    fn deliver(&self, outgoing: Vec<Outgoing<Endpoint>>) {
        for Outgoing { to, message } in outgoing {
            match self.outboxes.get(&to) {
                Some(outbox) => {
                    if outbox.send(message).is_err() {
                        debug!(to = %to.short(), "Sync session closed; dropping message");
                    }
                }
                None => warn!(to = %to.short(), "No channel for sync peer"),
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Re-emit committed values outside the value lock.
async fn dispatch(mut unstaged: mpsc::UnboundedReceiver<GlobalUpdate>, updates: Arc<EventBus<GlobalUpdate>>) {
    while let Some(update) = unstaged.recv().await {
        updates.emit(update);
    }
}

/// Send one peer's messages in order.
async fn pump(channel: Channel, mut outbox: mpsc::UnboundedReceiver<SyncMessage>) {
    while let Some(message) = outbox.recv().await {
        let data = match serde_json::to_value(&message) {
            Ok(data) => data,
            Err(e) => {
                warn!(channel = %channel.name(), error = %e, "Failed to encode sync message");
                continue;
            }
        };
        if let Err(e) = channel.send(data).await {
            warn!(channel = %channel.name(), error = %e, "Failed to send sync message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Link, LinkHandle, Result as TransportResult, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Hands out one pre-made end of a pipe.
    struct Pipe(Mutex<Option<LinkHandle>>);

    #[async_trait]
    impl Link for Pipe {
        fn describe(&self) -> String {
            "pipe".to_string()
        }

        async fn open(&self) -> TransportResult<LinkHandle> {
            lock(&self.0).take().ok_or(TransportError::Closed)
        }
    }

    /// Fully connected sessions over in-memory pipes.
    async fn sessions(count: usize) -> Vec<SyncSession> {
        let endpoints: Vec<_> = (0..count).map(|_| Endpoint::generate()).collect();
        let mut channels: Vec<HashMap<Endpoint, Channel>> = vec![HashMap::new(); count];
        for i in 0..count {
            for j in (i + 1)..count {
                let (near, far) = LinkHandle::pair();
                let to_j = Channel::new(
                    format!("{i}->{j}"),
                    Arc::new(Pipe(Mutex::new(Some(near)))),
                    ChannelConfig::default(),
                );
                let to_i = Channel::new(
                    format!("{j}->{i}"),
                    Arc::new(Pipe(Mutex::new(Some(far)))),
                    ChannelConfig::default(),
                );
                channels[i].insert(endpoints[j].clone(), to_j);
                channels[j].insert(endpoints[i].clone(), to_i);
            }
        }

        let mut sessions = Vec::new();
        for (local, channels) in endpoints.into_iter().zip(channels) {
            let session = SyncSession::new(local, channels).unwrap();
            for channel in session.inner.channels.values() {
                channel.connect().await.unwrap();
            }
            sessions.push(session);
        }
        sessions
    }

    /// Common global state, once every session is global and agrees.
    fn agreed(sessions: &[SyncSession]) -> Option<(Clock, Option<Value>)> {
        let first = (sessions[0].global_clock(), sessions[0].global_value());
        sessions
            .iter()
            .all(|s| s.is_global() && (s.global_clock(), s.global_value()) == first)
            .then_some(first)
    }

    async fn settle(sessions: &[SyncSession], done: impl Fn(&(Clock, Option<Value>)) -> bool) -> (Clock, Option<Value>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(state) = agreed(sessions).filter(|s| done(s)) {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sessions did not converge")
    }

    #[tokio::test]
    async fn test_three_sessions_converge() {
        let s = sessions(3).await;

        s[0].set(json!("1")).unwrap();
        assert_eq!(settle(&s, |(c, _)| *c == 1).await, (1, Some(json!("1"))));

        s[1].set(json!("2")).unwrap();
        assert_eq!(settle(&s, |(c, _)| *c == 2).await, (2, Some(json!("2"))));

        s[0].set(json!("1")).unwrap();
        assert_eq!(settle(&s, |(c, _)| *c == 3).await, (3, Some(json!("1"))));

        // Divergent updates before any delivery
        s[0].set(json!("2")).unwrap();
        s[1].set(json!("3")).unwrap();
        s[1].set(json!("5")).unwrap();
        s[2].set(json!("4")).unwrap();
        assert_eq!(settle(&s, |(c, _)| *c == 5).await, (5, Some(json!("2"))));
    }

    #[tokio::test]
    async fn test_updates_arrive_in_commit_order() {
        let s = sessions(3).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = s[2].subscribe(move |update| {
            let _ = tx.send(update);
        });

        // Updates race in from two channels at once
        for round in 0..20 {
            s[0].set(json!(round)).unwrap();
            s[1].set(json!(-round)).unwrap();
        }
        let (last, _) = settle(&s, |(c, _)| *c >= 20).await;

        let mut next = 1;
        while next <= last {
            let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(update.since, next);
            next = update.clock + 1;
        }
    }

    #[tokio::test]
    async fn test_absent_value_rejected() {
        let s = sessions(2).await;
        assert!(matches!(
            s[0].set(Value::Null),
            Err(SessionError::Sync(SyncError::AbsentValue))
        ));
        assert_eq!(s[0].local_clock(), 0);
    }

    #[tokio::test]
    async fn test_observers_may_read_back() {
        let s = sessions(2).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = s[1].clone();
        let _sub = s[1].subscribe(move |update| {
            // Reading the session from a callback must not deadlock
            let _ = tx.send((update, reader.global_value()));
        });

        s[0].set(json!({"mode": "dark"})).unwrap();
        let (update, read_back) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.clock, 1);
        assert_eq!(update.value, Some(json!({"mode": "dark"})));
        assert_eq!(read_back, update.value);
    }

    #[tokio::test]
    async fn test_garbage_on_sync_channel_ignored() {
        let s = sessions(2).await;
        let remote = s[0].local().clone();
        let channel = s[1].inner.channels[&remote].clone();
        channel.send(json!({"id": "nonsense"})).await.unwrap();
        channel.send(json!({"id": "ack", "lClock": 99})).await.unwrap();

        s[1].set(json!(7)).unwrap();
        assert_eq!(settle(&s, |(c, _)| *c == 1).await, (1, Some(json!(7))));
    }
}
