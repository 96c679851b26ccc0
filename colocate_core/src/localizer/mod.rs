//! Spatial localizers: pluggable strategies that run one localization
//! attempt against a peer.
//!
//! The hardware variants own one [`CoordinateService`](crate::CoordinateService)
//! of their id type, shared by every session; a session only accepts
//! sightings made after it started. The simulated variant builds a service
//! per session, since its pose and delay are session settings. Variants are
//! a closed set resolved by [`LocalizerId`] when they are registered with the
//! manager.
//!
//! | Variant          | Coordinate id | Backend                      |
//! |------------------|---------------|------------------------------|
//! | marker visual    | `MarkerId`    | `SensorBackend<MarkerId>`    |
//! | QR code          | `MarkerId`    | `QrCodeWatcher`              |
//! | spatial anchors  | `AnchorId`    | `SpatialAnchorsBackend`      |
//! | simulated        | `String`      | timer, no hardware           |

pub mod session;
pub mod marker;
pub mod qr_code;
pub mod spatial_anchors;
pub mod simulated;

pub use session::{
    CoordinateAssigner, FirstIdAssigner, HandshakeRole, HandshakeSession, LocalizationSession, SessionConfig,
    SessionState,
};
pub use marker::{MarkerId, MarkerLocalizer, MarkerSettings};
pub use qr_code::{QrCode, QrCodeEvent, QrCodeMarkerDetector, QrCodeWatcher};
pub use spatial_anchors::{AnchorId, SpatialAnchorsBackend, SpatialAnchorsLocalizer, SpatialAnchorsSettings};
pub use simulated::{SimulatedLocalizer, SimulatedSensor, SimulatedSettings};

use crate::command_channel::send_command;
use crate::coordinate::SpatialCoordinate;
use crate::protocol::LOCALIZATION_DATA;
use crate::wire::{CommandReader, CommandWriter, WireError};
use colocate_env::{EnvError, LocalizerId, NetworkTransport, PeerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Why a localizer could not start a session.
#[derive(Debug, Error)]
pub enum LocalizerError {
    #[error("Localizer '{0}' is not supported on this platform")]
    Unsupported(String),

    #[error("Expected {expected} settings, got {actual}")]
    SettingsMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Malformed settings: {0}")]
    MalformedSettings(#[from] WireError),
}

/// Algorithm-specific settings for one localization attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalizationSettings {
    Marker(MarkerSettings),
    SpatialAnchors(SpatialAnchorsSettings),
    Simulated(SimulatedSettings),
}

impl LocalizationSettings {
    /// Variant name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            LocalizationSettings::Marker(_) => "marker",
            LocalizationSettings::SpatialAnchors(_) => "spatial anchors",
            LocalizationSettings::Simulated(_) => "simulated",
        }
    }
}

/// The link a session talks to its peer over.
///
/// Everything sent through it is wrapped in a `LocalizationData` command
/// tagged with the localizer id, so the remote manager can route it to the
/// matching session.
#[derive(Clone)]
pub struct PeerConnection {
    peer: PeerId,
    localizer_id: LocalizerId,
    transport: Arc<dyn NetworkTransport>,
    session_config: SessionConfig,
}

impl PeerConnection {
    pub fn new(peer: PeerId, localizer_id: LocalizerId, transport: Arc<dyn NetworkTransport>) -> Self {
        Self {
            peer,
            localizer_id,
            transport,
            session_config: SessionConfig::default(),
        }
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Tuning for sessions running over this link.
    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn localizer_id(&self) -> LocalizerId {
        self.localizer_id
    }

    /// Sends one session message to the peer.
    pub fn send_data<F>(&self, write: F) -> Result<(), EnvError>
    where
        F: FnOnce(&mut CommandWriter),
    {
        send_command(self.transport.as_ref(), self.peer, LOCALIZATION_DATA, |w| {
            w.write_uuid(&self.localizer_id.0);
            write(w);
        })
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("localizer_id", &self.localizer_id)
            .finish()
    }
}

/// A localization strategy.
pub trait SpatialLocalizer: Send + Sync + 'static {
    fn id(&self) -> LocalizerId;

    /// Short name for logs.
    fn name(&self) -> &str;

    /// False when the backing hardware or service is missing on this platform.
    fn is_supported(&self) -> bool;

    fn default_settings(&self) -> LocalizationSettings;

    /// Writes settings in the form the peer's localizer reads back.
    fn serialize_settings(
        &self,
        settings: &LocalizationSettings,
        writer: &mut CommandWriter,
    ) -> Result<(), LocalizerError>;

    fn deserialize_settings(&self, reader: &mut CommandReader<'_>) -> Result<LocalizationSettings, LocalizerError>;

    /// Creates a session bound to one peer.
    ///
    /// Fails with [`LocalizerError::Unsupported`] when the backend is not
    /// available here; callers treat that as recoverable.
    fn create_session(
        &self,
        connection: PeerConnection,
        settings: &LocalizationSettings,
    ) -> Result<Arc<dyn LocalizationSession>, LocalizerError>;

    /// Current state of a coordinate by its wire id.
    fn coordinate(&self, id: &str) -> Option<SpatialCoordinate>;

    /// True if the localizer's service still has a coordinate that was
    /// requested but never located.
    fn has_unresolved_coordinates(&self) -> bool;

    /// Forgets every coordinate the localizer's service knows.
    fn reset_coordinates(&self);
}

impl std::fmt::Debug for dyn SpatialLocalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SpatialLocalizer({} {})", self.name(), self.id())
    }
}

/// Role byte used by the marker and simulated settings encodings.
pub(crate) fn write_role(writer: &mut CommandWriter, role: HandshakeRole) {
    writer.write_u8(match role {
        HandshakeRole::Initiator => 0,
        HandshakeRole::Responder => 1,
    });
}

pub(crate) fn read_role(reader: &mut CommandReader<'_>) -> Result<HandshakeRole, WireError> {
    match reader.read_u8()? {
        0 => Ok(HandshakeRole::Initiator),
        1 => Ok(HandshakeRole::Responder),
        other => Err(WireError::InvalidValue(format!("handshake role {}", other))),
    }
}

/// Rejects settings meant for another variant.
pub(crate) fn mismatch(expected: &'static str, actual: &LocalizationSettings) -> LocalizerError {
    LocalizerError::SettingsMismatch {
        expected,
        actual: actual.kind(),
    }
}
