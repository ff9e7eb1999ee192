//! mesh-relay: rendezvous server for the peer mesh.
//!
//! Clients register an endpoint with `hi`, then exchange negotiation
//! envelopes addressed by endpoint. The relay forwards them verbatim and
//! never looks at their payloads.

pub mod client;
pub mod config;
pub mod connection;
pub mod router;
pub mod server;

pub use client::WebSocketLink;
pub use config::RelayConfig;
pub use router::{ConnId, Delivery, RelayError, Router};
pub use server::RelayServer;
