//! Individual relay client connection.
//!
//! Each connection wraps a WebSocket stream split into a read task, which
//! forwards text frames to the server's event channel, and a write task fed
//! by an unbounded queue so the server never waits on a slow client.

use crate::router::ConnId;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// Event emitted towards the server loop.
pub enum ConnectionEvent {
    /// A client finished the WebSocket upgrade
    Upgraded {
        stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
    },
    /// Text frame from a client
    Text { conn_id: ConnId, text: String },
    /// Connection was closed
    Closed { conn_id: ConnId },
}

/// A single client connection.
pub struct RelayConnection {
    pub conn_id: ConnId,
    pub addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<Message>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl RelayConnection {
    /// Spawn the read and write tasks for an upgraded stream.
    pub fn new(
        conn_id: ConnId,
        addr: SocketAddr,
        stream: WebSocketStream<TcpStream>,
        max_message_size: usize,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (mut write, read) = stream.split();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();

        let read_task = tokio::spawn(Self::read_loop(conn_id, read, max_message_size, event_tx));
        let write_task = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = write.send(message).await {
                    debug!(conn_id, error = %e, "Write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        Self {
            conn_id,
            addr,
            outgoing,
            read_task,
            write_task,
        }
    }

    async fn read_loop(
        conn_id: ConnId,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        max_message_size: usize,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > max_message_size {
                        warn!(
                            conn_id,
                            size = text.len(),
                            max = max_message_size,
                            "Message exceeds max size, dropping"
                        );
                        continue;
                    }
                    let _ = event_tx.send(ConnectionEvent::Text {
                        conn_id,
                        text: text.as_str().to_string(),
                    });
                }
                Some(Ok(Message::Binary(data))) => {
                    error!(conn_id, bytes = data.len(), "Binary frames are not supported, ignoring");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(conn_id, "Received close frame");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!(conn_id, "Connection closed");
                        }
                        _ => {
                            error!(conn_id, error = %e, "WebSocket error");
                        }
                    }
                    break;
                }
                None => {
                    debug!(conn_id, "Stream ended");
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Queue a text frame for the client.
    pub fn send_text(&self, text: String) -> bool {
        self.outgoing.send(Message::text(text)).is_ok()
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}
