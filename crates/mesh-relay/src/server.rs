//! WebSocket relay server.
//!
//! Accepts client connections (origin and path checked during the upgrade),
//! hands every text frame to the [`Router`], and writes the resulting
//! deliveries. A bad frame is logged and the connection stays open.

use crate::config::RelayConfig;
use crate::connection::{ConnectionEvent, RelayConnection};
use crate::router::{ConnId, Router};
use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

/// Relay server state. Drive it with [`RelayServer::run`].
pub struct RelayServer {
    config: Arc<RelayConfig>,
    router: Router,
    connections: HashMap<ConnId, RelayConnection>,
    next_conn_id: ConnId,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            router: Router::new(),
            connections: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections and route frames until the listener fails.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
        }
    }

    /// Upgrade a TCP connection in the background.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let config = Arc::clone(&self.config);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let check = |request: &Request, response: Response| check_upgrade(&config, request, response);
            match accept_hdr_async(stream, check).await {
                Ok(stream) => {
                    let _ = event_tx.send(ConnectionEvent::Upgraded { stream, addr });
                }
                Err(e) => {
                    // Refused upgrades and health checks end up here
                    debug!("WebSocket upgrade failed for {}: {}", addr, e);
                }
            }
        });
    }

    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Upgraded { stream, addr } => {
                let conn_id = self.next_conn_id;
                self.next_conn_id += 1;
                info!(conn_id, %addr, "New connection");
                let conn = RelayConnection::new(
                    conn_id,
                    addr,
                    stream,
                    self.config.max_message_size,
                    self.event_tx.clone(),
                );
                self.connections.insert(conn_id, conn);
            }
            ConnectionEvent::Text { conn_id, text } => match self.router.route(conn_id, &text) {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        let sent = self
                            .connections
                            .get(&delivery.to)
                            .is_some_and(|conn| conn.send_text(delivery.text));
                        if !sent {
                            warn!(conn_id = delivery.to, "Delivery to a closed connection dropped");
                        }
                    }
                }
                Err(e) => warn!(conn_id, error = %e, "Rejected relay message"),
            },
            ConnectionEvent::Closed { conn_id } => {
                if let Some(conn) = self.connections.remove(&conn_id) {
                    debug!(conn_id, addr = %conn.addr, "Connection closed");
                }
                self.router.disconnect(conn_id);
            }
        }
    }
}

/// Refuse upgrades from unknown origins or on the wrong path.
fn check_upgrade(
    config: &RelayConfig,
    request: &Request,
    response: Response,
) -> std::result::Result<Response, ErrorResponse> {
    let path = request.uri().path();
    if path != config.path {
        warn!(%path, "Refusing upgrade on unknown path");
        return Err(refusal(StatusCode::NOT_FOUND, "Not found"));
    }

    let origin = request
        .headers()
        .get("origin")
        .and_then(|value| value.to_str().ok());
    match origin {
        Some(origin) if config.is_origin_allowed(origin) => Ok(response),
        _ => {
            warn!(?origin, "Refusing upgrade from disallowed origin");
            Err(refusal(StatusCode::FORBIDDEN, "Origin not allowed"))
        }
    }
}

fn refusal(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
