//! Wire protocol definitions.
//!
//! - Relay envelopes (`hi`, `offer`/`answer`, `desc`/`candidate`, `find-peers`)
//! - Negotiation payloads (session descriptions, ICE candidates)
//! - Channel multiplexing frames and request/response correlation
//!
//! The shared-value messages live next to their state machine in
//! [`crate::shared_value`].

pub mod channel;
pub mod relay;
pub mod signal;

pub use channel::{ChannelFrame, Inbound};
pub use relay::{ProtocolError, RelayMessage};
pub use signal::{IceCandidate, SdpType, SessionDescription, Signal};
