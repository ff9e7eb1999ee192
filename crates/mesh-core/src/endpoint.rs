//! Endpoint: identity of one participant instance in the mesh.
//!
//! An endpoint is the triple `(user, device, session)`:
//! - `user` persists across sessions and devices for a person (16 hex chars)
//! - `device` persists across sessions for one device (8 hex chars)
//! - `session` is unique per connection lifetime (8 hex chars)
//!
//! Displays as `"<user>-<device>-<session>"`, which is also the identifier
//! registered with the relay and the key used to derive negotiation roles.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use thiserror::Error;

const USER_LEN: usize = 16;
const DEVICE_LEN: usize = 8;
const SESSION_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Invalid endpoint '{0}': expected <16 hex>-<8 hex>-<8 hex>")]
    InvalidFormat(String),
}

/// Identity of one participant instance.
///
/// Compared by value. The derived ordering follows the serialized form, so
/// `a < b` agrees with comparing `a.to_string() < b.to_string()`.
///
/// # Examples
/// ```
/// use mesh_core::Endpoint;
///
/// let endpoint: Endpoint = "0123456789abcdef-01234567-89abcdef".parse().unwrap();
/// assert_eq!(endpoint.device(), "01234567");
/// assert_eq!(endpoint.to_string(), "0123456789abcdef-01234567-89abcdef");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    user: String,
    device: String,
    session: String,
}

impl Endpoint {
    /// Build an endpoint from its parts, validating each one.
    pub fn new(user: &str, device: &str, session: &str) -> Result<Self, EndpointError> {
        if !is_hex_of_len(user, USER_LEN)
            || !is_hex_of_len(device, DEVICE_LEN)
            || !is_hex_of_len(session, SESSION_LEN)
        {
            return Err(EndpointError::InvalidFormat(format!(
                "{}-{}-{}",
                user, device, session
            )));
        }
        Ok(Self {
            user: user.to_ascii_lowercase(),
            device: device.to_ascii_lowercase(),
            session: session.to_ascii_lowercase(),
        })
    }

    /// Generate a fresh endpoint with random user, device and session.
    pub fn generate() -> Self {
        Self {
            user: random_hex(USER_LEN),
            device: random_hex(DEVICE_LEN),
            session: random_hex(SESSION_LEN),
        }
    }

    /// Same user and device, new session. Used when a process restarts a
    /// connection lifetime but keeps its persisted identity.
    pub fn with_new_session(&self) -> Self {
        Self {
            user: self.user.clone(),
            device: self.device.clone(),
            session: random_hex(SESSION_LEN),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// First 8 characters of the user id, for compact log lines.
    pub fn short(&self) -> &str {
        &self.user[..8]
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.user, self.device, self.session)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(device), Some(session), None) => Self::new(user, device, session)
                .map_err(|_| EndpointError::InvalidFormat(s.to_string())),
            _ => Err(EndpointError::InvalidFormat(s.to_string())),
        }
    }
}

// Serialize as the dashed string so envelopes carry `src`/`dst` verbatim
impl serde::Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Endpoint {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn random_hex(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..len / 2)
        .map(|_| format!("{:02x}", rng.random::<u8>()))
        .collect()
}

/// Interning table for endpoints parsed from the wire.
///
/// Relay envelopes name endpoints by string; interning gives every component
/// the same `Arc<Endpoint>` for the same identity. Entries are evicted by
/// [`sweep`](Self::sweep) once nothing outside the table holds them. Nothing
/// relies on two interned handles being pointer-equal: endpoints compare by
/// value, so eager eviction only costs a re-parse.
#[derive(Default)]
pub struct EndpointInterner {
    entries: RwLock<HashMap<String, Arc<Endpoint>>>,
}

impl EndpointInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `id` or return the already-interned endpoint for it.
    pub fn intern(&self, id: &str) -> Result<Arc<Endpoint>, EndpointError> {
        if let Some(existing) = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
        {
            return Ok(Arc::clone(existing));
        }

        let endpoint = Arc::new(id.parse::<Endpoint>()?);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::clone(&endpoint));
        Ok(Arc::clone(entry))
    }

    /// Evict entries only the table still references. Returns how many went.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, endpoint| Arc::strong_count(endpoint) > 1);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
