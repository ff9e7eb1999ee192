//! Relay routing table.
//!
//! Pure state: which connection is registered under which endpoint, and
//! where each incoming text frame goes. The server owns the sockets and
//! feeds frames through [`Router::route`].

use mesh_core::protocol::{ProtocolError, RelayMessage};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

/// Server-assigned connection identifier.
pub type ConnId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Endpoint {src} is already registered")]
    DuplicateRegistration { src: String },

    #[error("Connection is already registered as {current}")]
    AlreadyRegistered { current: String },

    #[error("No connection registered for {dst}")]
    UnknownDestination { dst: String },

    #[error("Clients may not send '{0}'")]
    UnexpectedMessage(&'static str),
}

/// A text frame to write to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ConnId,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct Router {
    by_endpoint: HashMap<String, ConnId>,
    by_conn: HashMap<ConnId, String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one text frame from `from`.
    ///
    /// Forwardable messages are delivered verbatim; errors leave the table
    /// unchanged and are the caller's to log.
    pub fn route(&mut self, from: ConnId, text: &str) -> Result<Vec<Delivery>, RelayError> {
        let message = RelayMessage::parse(text)?;
        match message {
            RelayMessage::Hi { src } => {
                self.register(from, src)?;
                Ok(Vec::new())
            }
            RelayMessage::Offer { ref dst, .. }
            | RelayMessage::Answer { ref dst, .. }
            | RelayMessage::Desc { ref dst, .. }
            | RelayMessage::Candidate { ref dst, .. } => {
                let to = *self
                    .by_endpoint
                    .get(dst)
                    .ok_or_else(|| RelayError::UnknownDestination { dst: dst.clone() })?;
                debug!(kind = message.kind(), %dst, "Forwarding");
                Ok(vec![Delivery {
                    to,
                    text: text.to_string(),
                }])
            }
            RelayMessage::FindPeers { ids } => {
                let reachable = ids
                    .into_iter()
                    .filter(|id| self.by_endpoint.contains_key(id))
                    .collect();
                Ok(vec![Delivery {
                    to: from,
                    text: RelayMessage::Peers { ids: reachable }.to_json(),
                }])
            }
            RelayMessage::Peers { .. } => Err(RelayError::UnexpectedMessage("peers")),
        }
    }

    fn register(&mut self, conn: ConnId, src: String) -> Result<(), RelayError> {
        if self.by_endpoint.contains_key(&src) {
            return Err(RelayError::DuplicateRegistration { src });
        }
        if let Some(current) = self.by_conn.get(&conn) {
            return Err(RelayError::AlreadyRegistered {
                current: current.clone(),
            });
        }
        info!(conn, %src, "Registered");
        self.by_endpoint.insert(src.clone(), conn);
        self.by_conn.insert(conn, src);
        Ok(())
    }

    /// Forget whatever `conn` registered. Returns the endpoint it held.
    pub fn disconnect(&mut self, conn: ConnId) -> Option<String> {
        let src = self.by_conn.remove(&conn)?;
        self.by_endpoint.remove(&src);
        info!(conn, %src, "Unregistered");
        Some(src)
    }

    pub fn lookup(&self, endpoint: &str) -> Option<ConnId> {
        self.by_endpoint.get(endpoint).copied()
    }

    /// Registered endpoints, sorted.
    pub fn registered(&self) -> Vec<String> {
        let mut endpoints: Vec<_> = self.by_endpoint.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }
}
