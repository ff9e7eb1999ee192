//! In-memory [`Link`] for tests.

use super::{Link, LinkHandle, Result, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// A link whose every `open()` hands the remote end to a [`MemoryListener`].
pub struct MemoryLink {
    name: String,
    accept_tx: mpsc::UnboundedSender<LinkHandle>,
    refusing: AtomicBool,
    opened: AtomicUsize,
}

/// Receives the far end of every connection opened on a [`MemoryLink`].
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<LinkHandle>,
}

impl MemoryLink {
    pub fn pair(name: &str) -> (Arc<Self>, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                name: name.to_string(),
                accept_tx,
                refusing: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
            }),
            MemoryListener { accept_rx },
        )
    }

    /// Make subsequent `open()` calls fail until switched back.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn open(&self) -> Result<LinkHandle> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "{} refused",
                self.describe()
            )));
        }
        let (local, remote) = LinkHandle::pair();
        self.accept_tx
            .send(remote)
            .map_err(|_| TransportError::ConnectionFailed("listener dropped".to_string()))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(local)
    }
}

impl MemoryListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<LinkHandle> {
        self.accept_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_hands_far_end_to_listener() {
        let (link, mut listener) = MemoryLink::pair("test");
        let mut near = link.open().await.unwrap();
        let mut far = listener.accept().await.unwrap();

        near.outbound.send(json!("ping")).unwrap();
        assert_eq!(far.inbound.recv().await, Some(json!("ping")));
        far.outbound.send(json!("pong")).unwrap();
        assert_eq!(near.inbound.recv().await, Some(json!("pong")));

        drop(far);
        assert_eq!(near.inbound.recv().await, None);
        assert_eq!(link.open_count(), 1);
    }

    #[tokio::test]
    async fn test_refusing() {
        let (link, _listener) = MemoryLink::pair("test");
        link.set_refusing(true);
        assert!(matches!(
            link.open().await,
            Err(TransportError::ConnectionFailed(_))
        ));
        link.set_refusing(false);
        assert!(link.open().await.is_ok());
    }
}
