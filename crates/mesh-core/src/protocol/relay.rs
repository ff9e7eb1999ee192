//! Relay envelopes.
//!
//! Every message on a relay connection is a JSON text frame with an `id`
//! discriminator. The relay only looks at `id`, `src` and `dst`; `data` is
//! forwarded verbatim and never interpreted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Unknown message id: {0}")]
    UnknownId(String),
}

/// Wire format: `{"id":"<kind>", ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Register this connection under `src`
    Hi { src: String },
    Offer {
        src: String,
        dst: String,
        data: Value,
    },
    Answer {
        src: String,
        dst: String,
        data: Value,
    },
    /// Session description (offer or answer) for the negotiation layer
    Desc {
        src: String,
        dst: String,
        data: Value,
    },
    Candidate {
        src: String,
        dst: String,
        data: Value,
    },
    /// Ask which of `ids` are currently registered
    FindPeers { ids: Vec<String> },
    /// Reply to `find-peers`: the reachable subset, in request order
    Peers { ids: Vec<String> },
}

const KNOWN_IDS: &[&str] = &[
    "hi",
    "offer",
    "answer",
    "desc",
    "candidate",
    "find-peers",
    "peers",
];

impl RelayMessage {
    /// Parse a text frame, telling unknown kinds apart from broken envelopes.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Like [`RelayMessage::parse`], for an already decoded frame.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing string field 'id'".to_string()))?;
        if !KNOWN_IDS.contains(&id) {
            return Err(ProtocolError::UnknownId(id.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("RelayMessage serialization should not fail")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("RelayMessage serialization should not fail")
    }

    /// Destination of a forwardable message.
    pub fn dst(&self) -> Option<&str> {
        match self {
            Self::Offer { dst, .. }
            | Self::Answer { dst, .. }
            | Self::Desc { dst, .. }
            | Self::Candidate { dst, .. } => Some(dst),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hi { .. } => "hi",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Desc { .. } => "desc",
            Self::Candidate { .. } => "candidate",
            Self::FindPeers { .. } => "find-peers",
            Self::Peers { .. } => "peers",
        }
    }
}
