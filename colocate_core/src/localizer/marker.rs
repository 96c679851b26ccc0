//! Marker localization: one device shows a visual marker, the other detects
//! it.
//!
//! The displaying side is the responder: it advertises how many marker ids
//! it can show. The detecting side is the initiator and picks the id.

use crate::coordinate::SpatialCoordinate;
use crate::coordinate_service::{CoordinateService, CoordinateServiceConfig, SensorBackend};
use crate::localizer::qr_code::{QrCodeMarkerDetector, QrCodeWatcher};
use crate::localizer::session::{FirstIdAssigner, HandshakeRole, HandshakeSession, LocalizationSession};
use crate::localizer::{mismatch, read_role, write_role, LocalizationSettings, LocalizerError, PeerConnection, SpatialLocalizer};
use crate::wire::{CommandReader, CommandWriter};
use colocate_env::LocalizerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Id of a visual marker (non-negative integer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerId(pub u32);

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MarkerId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(MarkerId)
    }
}

/// Settings for marker-based localization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSettings {
    /// Initiator detects, responder displays (default: Initiator)
    pub role: HandshakeRole,

    /// Highest marker id the displaying side can show (default: 0)
    pub max_supported_id: i32,
}

impl Default for MarkerSettings {
    fn default() -> Self {
        Self {
            role: HandshakeRole::Initiator,
            max_supported_id: 0,
        }
    }
}

/// Marker visual and QR code localizers.
pub struct MarkerLocalizer {
    id: LocalizerId,
    name: String,
    service: Arc<CoordinateService<MarkerId>>,
}

impl MarkerLocalizer {
    /// Id of the marker visual detector localizer.
    pub const MARKER_VISUAL_ID: LocalizerId = LocalizerId::from_u128(0x2DA7D277_323F_4A0D_B3BB_B2BA6D3EF70E);

    /// Id of the QR code localizer.
    pub const QR_CODE_ID: LocalizerId = LocalizerId::from_u128(0x9B4E1D6C_5A02_4C8B_8F3E_0D7A21C6B94F);

    pub fn new(
        id: LocalizerId,
        name: impl Into<String>,
        detector: Arc<dyn SensorBackend<MarkerId>>,
        config: CoordinateServiceConfig,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            service: Arc::new(CoordinateService::new(detector, config)),
        }
    }

    /// Localizer driven by a visual marker detector.
    pub fn marker_visual(detector: Arc<dyn SensorBackend<MarkerId>>) -> Self {
        Self::new(
            Self::MARKER_VISUAL_ID,
            "marker-visual",
            detector,
            CoordinateServiceConfig::default(),
        )
    }

    /// Localizer driven by a QR code watcher.
    pub fn qr_code(watcher: Arc<dyn QrCodeWatcher>) -> Self {
        Self::new(
            Self::QR_CODE_ID,
            "qr-code",
            Arc::new(QrCodeMarkerDetector::new(watcher)),
            CoordinateServiceConfig::default(),
        )
    }

    pub fn service(&self) -> &Arc<CoordinateService<MarkerId>> {
        &self.service
    }
}

impl SpatialLocalizer for MarkerLocalizer {
    fn id(&self) -> LocalizerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_supported(&self) -> bool {
        self.service.is_available()
    }

    fn default_settings(&self) -> LocalizationSettings {
        LocalizationSettings::Marker(MarkerSettings::default())
    }

    fn serialize_settings(
        &self,
        settings: &LocalizationSettings,
        writer: &mut CommandWriter,
    ) -> Result<(), LocalizerError> {
        let LocalizationSettings::Marker(settings) = settings else {
            return Err(mismatch("marker", settings));
        };
        write_role(writer, settings.role);
        writer.write_i32(settings.max_supported_id);
        Ok(())
    }

    fn deserialize_settings(&self, reader: &mut CommandReader<'_>) -> Result<LocalizationSettings, LocalizerError> {
        let role = read_role(reader)?;
        let max_supported_id = reader.read_i32()?;
        Ok(LocalizationSettings::Marker(MarkerSettings { role, max_supported_id }))
    }

    fn create_session(
        &self,
        connection: PeerConnection,
        settings: &LocalizationSettings,
    ) -> Result<Arc<dyn LocalizationSession>, LocalizerError> {
        let LocalizationSettings::Marker(settings) = settings else {
            return Err(mismatch("marker", settings));
        };
        if !self.is_supported() {
            warn!("{}: marker detection unavailable on this platform", self.name);
            return Err(LocalizerError::Unsupported(self.name.clone()));
        }
        Ok(Arc::new(HandshakeSession::new(
            connection,
            settings.role,
            settings.max_supported_id,
            self.service.clone(),
            Arc::new(FirstIdAssigner::new(MarkerId(0))),
        )))
    }

    fn coordinate(&self, id: &str) -> Option<SpatialCoordinate> {
        self.service.try_get_by_wire_id(id).map(|c| c.to_spatial())
    }

    fn has_unresolved_coordinates(&self) -> bool {
        self.service.has_unresolved()
    }

    fn reset_coordinates(&self) {
        self.service.reset();
    }
}
