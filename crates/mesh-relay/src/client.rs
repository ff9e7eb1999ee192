//! WebSocket link to a relay, for use as a [`mesh_core::Signaler`] transport.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mesh_core::transport::{Link, LinkHandle, Result, TransportError};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, warn};

/// Opens a fresh WebSocket to `url` on every [`Link::open`].
#[derive(Debug, Clone)]
pub struct WebSocketLink {
    url: String,
    origin: Option<String>,
}

impl WebSocketLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: None,
        }
    }

    /// Send this `Origin` header with the upgrade request.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

#[async_trait]
impl Link for WebSocketLink {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn open(&self) -> Result<LinkHandle> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        if let Some(origin) = &self.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| TransportError::ConnectionFailed(format!("bad origin: {}", e)))?;
            request.headers_mut().insert("Origin", value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let (near, far) = LinkHandle::pair();
        let LinkHandle {
            outbound: inbound_tx,
            inbound: mut outbound_rx,
        } = far;
        let url = self.url.clone();

        tokio::spawn(async move {
            while let Some(value) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::text(value.to_string())).await {
                    debug!(%url, error = %e, "Relay write failed");
                    return;
                }
            }
            // Local side hung up
            let _ = write.close().await;
        });

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(text.as_str()) {
                        Ok(value) => {
                            if inbound_tx.send(value).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(%url, error = %e, "Dropping non-JSON frame from relay"),
                    },
                    Ok(Message::Binary(_)) => warn!(%url, "Ignoring binary frame from relay"),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(%url, error = %e, "Relay read failed");
                        break;
                    }
                }
            }
            // Dropping `inbound_tx` tells the channel the link is down
        });

        Ok(near)
    }
}
