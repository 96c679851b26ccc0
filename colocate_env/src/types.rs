//! Common types for the Colocate environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle to a connected peer.
///
/// Stable for the lifetime of a connection. Whether a reconnect reuses it is
/// up to the transport: `TcpTransport` mints a new id per connection, while
/// the simulated network keeps each node's id, so a reconnect there shows up
/// as `Disconnected` then `Connected` for the same `PeerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Creates a new random PeerId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a PeerId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic PeerId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifies a localization algorithm.
///
/// Both peers know the same ids; the id selects which localizer
/// implementation handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalizerId(pub Uuid);

impl LocalizerId {
    /// Creates a LocalizerId from a 128-bit constant.
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Creates a LocalizerId from raw bytes (wire form).
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes (wire form).
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for LocalizerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl std::str::FromStr for LocalizerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Events surfaced by a transport.
///
/// `Received` carries raw bytes exactly as they came off the connection; a
/// single event may hold part of a frame or several frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection was established (inbound or outbound)
    Connected(PeerId),

    /// A connection was closed; the PeerId is no longer valid
    Disconnected(PeerId),

    /// Bytes arrived on a connection
    Received { peer: PeerId, bytes: Vec<u8> },
}

impl TransportEvent {
    /// Returns the peer this event concerns.
    pub fn peer(&self) -> PeerId {
        match self {
            TransportEvent::Connected(peer) | TransportEvent::Disconnected(peer) => *peer,
            TransportEvent::Received { peer, .. } => *peer,
        }
    }
}
