//! Reliable logical channels.
//!
//! A [`Channel`] sits on top of a [`Link`] and adds:
//! - a `closed → connecting → connected` lifecycle with observers
//! - FIFO queuing of sends issued while connecting
//! - request/response correlation with timeouts
//! - optional automatic reconnection with exponential backoff
//!
//! Traffic that isn't request/response passes through to observers as
//! [`ChannelEvent::Message`].

use crate::events::{EventBus, Subscription};
use crate::protocol::channel::{self as envelope, Inbound};
use crate::transport::{Link, LinkHandle, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel {0} is not connected")]
    NotConnected(String),

    #[error("Channel closed")]
    Closed,

    #[error("Request {index} timed out after {after:?}")]
    Timeout { index: u64, after: Duration },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    /// A message that isn't request/response traffic
    Message(Value),
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt (the first one is immediate)
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts per drop (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Delay before reconnection attempt number `attempt` (1-based).
///
/// The first attempt after a drop is immediate; later ones back off
/// exponentially from `initial_delay` up to `max_delay`.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(2) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Reconnect automatically when the link drops without `close()`
    pub reconnect: bool,
    pub request_timeout: Duration,
    pub backoff: ReconnectConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: ReconnectConfig::default(),
        }
    }
}

impl ChannelConfig {
    pub fn reconnecting() -> Self {
        Self {
            reconnect: true,
            ..Self::default()
        }
    }
}

/// Answers `req` envelopes arriving on a channel.
///
/// An `Err` is sent back as `{isOk:false, msg}`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, data: Value) -> Result<Value, String>;
}

type Completion = oneshot::Sender<Result<(), ChannelError>>;
type Waiter = oneshot::Sender<Result<Value, ChannelError>>;

struct Shared {
    state: ChannelState,
    /// Bumped on every connect and close; stale readers compare against it
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Value>>,
    queue: VecDeque<(Value, Completion)>,
    pending: HashMap<u64, Waiter>,
    next_index: u64,
    /// Set by `close()`; suppresses the reconnect for that close only
    fused: bool,
    reader: Option<AbortHandle>,
}

struct Inner {
    name: String,
    link: Arc<dyn Link>,
    config: ChannelConfig,
    shared: Mutex<Shared>,
    events: Arc<EventBus<ChannelEvent>>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
}

/// A named logical channel. Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub fn new(name: impl Into<String>, link: Arc<dyn Link>, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                link,
                config,
                shared: Mutex::new(Shared {
                    state: ChannelState::Closed,
                    generation: 0,
                    outbound: None,
                    queue: VecDeque::new(),
                    pending: HashMap::new(),
                    next_index: 0,
                    fused: false,
                    reader: None,
                }),
                events: Arc::new(EventBus::new()),
                handler: RwLock::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn subscribe(&self, callback: impl Fn(ChannelEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(callback)
    }

    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Open the underlying link. No-op unless the channel is closed.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let generation = {
            let mut shared = self.inner.lock();
            if shared.state != ChannelState::Closed {
                return Ok(());
            }
            shared.fused = false;
            shared.generation += 1;
            shared.state = ChannelState::Connecting;
            shared.generation
        };
        self.inner
            .events
            .emit(ChannelEvent::StateChanged(ChannelState::Connecting));
        Arc::clone(&self.inner).establish(generation).await
    }

    /// Send `data`.
    ///
    /// Connected: sent immediately. Connecting: queued, and resolved once
    /// flushed. Closed: fails without sending.
    pub async fn send(&self, data: Value) -> Result<(), ChannelError> {
        let flushed = {
            let mut shared = self.inner.lock();
            match shared.state {
                ChannelState::Connected => {
                    return match &shared.outbound {
                        Some(tx) => tx.send(data).map_err(|_| ChannelError::Closed),
                        None => Err(ChannelError::NotConnected(self.inner.name.clone())),
                    };
                }
                ChannelState::Connecting => {
                    let (done, flushed) = oneshot::channel();
                    shared.queue.push_back((data, done));
                    flushed
                }
                ChannelState::Closed => {
                    return Err(ChannelError::NotConnected(self.inner.name.clone()));
                }
            }
        };
        flushed.await.unwrap_or(Err(ChannelError::Closed))
    }

    /// Send `data` only if the channel is connected right now.
    pub fn try_send(&self, data: Value) -> Result<(), ChannelError> {
        self.inner.try_send(data)
    }

    /// Send `data` as a request and wait for the correlated response.
    pub async fn request(&self, data: Value) -> Result<Value, ChannelError> {
        self.request_with_timeout(data, self.inner.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let (index, response) = {
            let mut shared = self.inner.lock();
            let index = shared.next_index;
            shared.next_index += 1;
            let (tx, rx) = oneshot::channel();
            shared.pending.insert(index, tx);
            (index, rx)
        };
        let _pending = PendingRequest {
            inner: self.inner.as_ref(),
            index,
        };

        self.send(envelope::request(index, data)).await?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                debug!(channel = %self.inner.name, index, "Request timed out");
                Err(ChannelError::Timeout {
                    index,
                    after: timeout,
                })
            }
        }
    }

    /// Close the channel. Queued sends fail; in-flight requests are left to
    /// time out. Does not trigger a reconnect.
    pub fn close(&self) {
        let (was_open, queued) = {
            let mut shared = self.inner.lock();
            shared.fused = true;
            shared.generation += 1;
            let was_open = shared.state != ChannelState::Closed;
            shared.state = ChannelState::Closed;
            shared.outbound = None;
            if let Some(reader) = shared.reader.take() {
                reader.abort();
            }
            (was_open, shared.queue.drain(..).collect::<Vec<_>>())
        };

        for (_, done) in queued {
            let _ = done.send(Err(ChannelError::NotConnected(self.inner.name.clone())));
        }
        if was_open {
            debug!(channel = %self.inner.name, "Channel closed");
            self.inner
                .events
                .emit(ChannelEvent::StateChanged(ChannelState::Closed));
        }
    }
}

/// Drops a request's pending entry however the request ends, including
/// when its future is dropped.
struct PendingRequest<'a> {
    inner: &'a Inner,
    index: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.inner.lock().pending.remove(&self.index);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn establish(self: Arc<Self>, generation: u64) -> Result<(), ChannelError> {
        let LinkHandle { outbound, inbound } = match self.link.open().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(channel = %self.name, link = %self.link.describe(), error = %e, "Failed to open link");
                self.abandon(generation);
                return Err(e.into());
            }
        };

        {
            let mut shared = self.lock();
            if shared.generation != generation || shared.state != ChannelState::Connecting {
                // Closed while the link was opening
                return Err(ChannelError::Closed);
            }
            shared.state = ChannelState::Connected;
            for (data, done) in shared.queue.drain(..) {
                let result = outbound.send(data).map_err(|_| ChannelError::Closed);
                let _ = done.send(result);
            }
            shared.outbound = Some(outbound);
            let reader = tokio::spawn(Arc::clone(&self).read_loop(generation, inbound));
            shared.reader = Some(reader.abort_handle());
        }

        info!(channel = %self.name, link = %self.link.describe(), "Channel connected");
        self.events
            .emit(ChannelEvent::StateChanged(ChannelState::Connected));
        Ok(())
    }

    /// Connecting attempt `generation` failed.
    fn abandon(&self, generation: u64) {
        let queued = {
            let mut shared = self.lock();
            if shared.generation != generation || shared.state != ChannelState::Connecting {
                return;
            }
            shared.state = ChannelState::Closed;
            shared.queue.drain(..).collect::<Vec<_>>()
        };
        for (_, done) in queued {
            let _ = done.send(Err(ChannelError::NotConnected(self.name.clone())));
        }
        self.events
            .emit(ChannelEvent::StateChanged(ChannelState::Closed));
    }

    async fn read_loop(self: Arc<Self>, generation: u64, mut inbound: mpsc::UnboundedReceiver<Value>) {
        while let Some(value) = inbound.recv().await {
            self.on_inbound(value);
        }
        self.on_dropped(generation);
    }

    fn on_inbound(self: &Arc<Self>, value: Value) {
        match Inbound::classify(value) {
            Inbound::Message(data) => self.events.emit(ChannelEvent::Message(data)),
            Inbound::Reply { index, result } => {
                let waiter = self.lock().pending.remove(&index);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result.map_err(ChannelError::Remote));
                    }
                    None => {
                        debug!(channel = %self.name, index, "Ignoring reply for unknown or expired request")
                    }
                }
            }
            Inbound::Request { index, data } => {
                let handler = self
                    .handler
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let result = match handler {
                        Some(handler) => handler.handle(data).await,
                        None => Err("no request handler".to_string()),
                    };
                    inner.reply(envelope::reply(index, result));
                });
            }
            Inbound::Malformed(reason) => {
                warn!(channel = %self.name, %reason, "Dropping malformed request/response envelope");
            }
        }
    }

    fn try_send(&self, data: Value) -> Result<(), ChannelError> {
        let shared = self.lock();
        match (&shared.state, &shared.outbound) {
            (ChannelState::Connected, Some(tx)) => tx.send(data).map_err(|_| ChannelError::Closed),
            _ => Err(ChannelError::NotConnected(self.name.clone())),
        }
    }

    fn reply(&self, envelope: Value) {
        if let Err(e) = self.try_send(envelope) {
            debug!(channel = %self.name, error = %e, "Dropping reply");
        }
    }

    fn on_dropped(self: &Arc<Self>, generation: u64) {
        let reconnect = {
            let mut shared = self.lock();
            if shared.generation != generation || shared.state == ChannelState::Closed {
                return;
            }
            shared.state = ChannelState::Closed;
            shared.outbound = None;
            shared.reader = None;
            self.config.reconnect && !shared.fused
        };

        info!(channel = %self.name, reconnect, "Channel link dropped");
        self.events
            .emit(ChannelEvent::StateChanged(ChannelState::Closed));

        if reconnect {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                if let Some(max) = inner.config.backoff.max_attempts {
                    if attempt > max {
                        warn!(channel = %inner.name, attempts = max, "Giving up reconnecting");
                        return;
                    }
                }

                let delay = calculate_backoff(attempt, &inner.config.backoff);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let generation = {
                    let mut shared = inner.lock();
                    // Closed explicitly or reconnected by someone else meanwhile
                    if shared.fused || shared.state != ChannelState::Closed {
                        return;
                    }
                    shared.generation += 1;
                    shared.state = ChannelState::Connecting;
                    shared.generation
                };
                inner
                    .events
                    .emit(ChannelEvent::StateChanged(ChannelState::Connecting));

                match Arc::clone(&inner).establish(generation).await {
                    Ok(()) => return,
                    Err(e) => debug!(channel = %inner.name, attempt, error = %e, "Reconnect attempt failed"),
                }
            }
        });
    }
}
