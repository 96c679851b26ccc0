//! Cloud spatial anchor localization.
//!
//! The creator side is the initiator: it creates an anchor and assigns that
//! anchor's id. The other side watches for the assigned anchor until the
//! cloud service locates it.

use crate::coordinate::{Pose, SpatialCoordinate};
use crate::coordinate_service::{CoordinateService, CoordinateServiceConfig, ObservationSink, SensorBackend};
use crate::localizer::session::{CoordinateAssigner, HandshakeRole, HandshakeSession, LocalizationSession};
use crate::localizer::{mismatch, LocalizationSettings, LocalizerError, PeerConnection, SpatialLocalizer};
use crate::wire::{CommandReader, CommandWriter};
use async_trait::async_trait;
use colocate_env::LocalizerId;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cloud-assigned anchor identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchorId(pub String);

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AnchorId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AnchorId(s.to_string()))
    }
}

/// Settings for anchor-based localization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpatialAnchorsSettings {
    /// True on the side that creates the shared anchor (default: false)
    pub is_coordinate_creator: bool,

    /// Cloud account domain
    pub account_domain: String,

    /// Cloud account id
    pub account_id: String,

    /// Cloud account key
    pub account_key: String,
}

/// Cloud anchor SDK seam.
#[async_trait]
pub trait SpatialAnchorsBackend: Send + Sync + 'static {
    fn is_available(&self) -> bool {
        true
    }

    /// Applies account settings before a session uses the service.
    fn configure(&self, settings: &SpatialAnchorsSettings);

    /// Creates an anchor at the device's current position.
    ///
    /// `None` if the service failed or `cancel` fired.
    async fn create_anchor(&self, cancel: &CancellationToken) -> Option<(AnchorId, Pose)>;

    /// Starts reporting located anchors into `sink`.
    fn start_watching(&self, sink: ObservationSink<AnchorId>, targets: &[AnchorId]);

    fn stop_watching(&self);
}

/// Adapts a [`SpatialAnchorsBackend`] into a [`SensorBackend`].
struct AnchorWatcher {
    backend: Arc<dyn SpatialAnchorsBackend>,
}

impl SensorBackend<AnchorId> for AnchorWatcher {
    fn name(&self) -> &str {
        "spatial-anchors"
    }

    fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    fn start_detecting(&self, sink: ObservationSink<AnchorId>, targets: &[AnchorId]) {
        self.backend.start_watching(sink, targets);
    }

    fn stop_detecting(&self) {
        self.backend.stop_watching();
    }
}

/// Assigns a freshly created anchor; the creator knows its pose at once.
struct AnchorCreator {
    backend: Arc<dyn SpatialAnchorsBackend>,
    service: Arc<CoordinateService<AnchorId>>,
}

#[async_trait]
impl CoordinateAssigner<AnchorId> for AnchorCreator {
    async fn assign(&self, _max_supported_id: i32, cancel: &CancellationToken) -> Option<AnchorId> {
        let (id, pose) = self.backend.create_anchor(cancel).await?;
        debug!("Created spatial anchor {}", id);
        self.service.apply_observation(id.clone(), Some(pose));
        Some(id)
    }
}

/// Localizer backed by cloud spatial anchors.
pub struct SpatialAnchorsLocalizer {
    backend: Arc<dyn SpatialAnchorsBackend>,
    service: Arc<CoordinateService<AnchorId>>,
}

impl SpatialAnchorsLocalizer {
    pub const ID: LocalizerId = LocalizerId::from_u128(0x2B5E5A3C_81E4_4F0F_9E2D_6C3D1A7F4B20);

    pub fn new(backend: Arc<dyn SpatialAnchorsBackend>) -> Self {
        Self::with_config(backend, CoordinateServiceConfig::default())
    }

    pub fn with_config(backend: Arc<dyn SpatialAnchorsBackend>, config: CoordinateServiceConfig) -> Self {
        let watcher = Arc::new(AnchorWatcher {
            backend: Arc::clone(&backend),
        });
        Self {
            backend,
            service: Arc::new(CoordinateService::new(watcher, config)),
        }
    }

    pub fn service(&self) -> &Arc<CoordinateService<AnchorId>> {
        &self.service
    }
}

impl SpatialLocalizer for SpatialAnchorsLocalizer {
    fn id(&self) -> LocalizerId {
        Self::ID
    }

    fn name(&self) -> &str {
        "spatial-anchors"
    }

    fn is_supported(&self) -> bool {
        self.backend.is_available()
    }

    fn default_settings(&self) -> LocalizationSettings {
        LocalizationSettings::SpatialAnchors(SpatialAnchorsSettings::default())
    }

    fn serialize_settings(
        &self,
        settings: &LocalizationSettings,
        writer: &mut CommandWriter,
    ) -> Result<(), LocalizerError> {
        let LocalizationSettings::SpatialAnchors(settings) = settings else {
            return Err(mismatch("spatial anchors", settings));
        };
        writer.write_bool(settings.is_coordinate_creator);
        writer.write_str(&settings.account_domain);
        writer.write_str(&settings.account_id);
        writer.write_str(&settings.account_key);
        Ok(())
    }

    fn deserialize_settings(&self, reader: &mut CommandReader<'_>) -> Result<LocalizationSettings, LocalizerError> {
        Ok(LocalizationSettings::SpatialAnchors(SpatialAnchorsSettings {
            is_coordinate_creator: reader.read_bool()?,
            account_domain: reader.read_string()?,
            account_id: reader.read_string()?,
            account_key: reader.read_string()?,
        }))
    }

    fn create_session(
        &self,
        connection: PeerConnection,
        settings: &LocalizationSettings,
    ) -> Result<Arc<dyn LocalizationSession>, LocalizerError> {
        let LocalizationSettings::SpatialAnchors(settings) = settings else {
            return Err(mismatch("spatial anchors", settings));
        };
        if !self.is_supported() {
            warn!("Spatial anchors service unavailable on this platform");
            return Err(LocalizerError::Unsupported(self.name().to_string()));
        }

        self.backend.configure(settings);
        let role = if settings.is_coordinate_creator {
            HandshakeRole::Initiator
        } else {
            HandshakeRole::Responder
        };
        let assigner = Arc::new(AnchorCreator {
            backend: Arc::clone(&self.backend),
            service: Arc::clone(&self.service),
        });
        Ok(Arc::new(HandshakeSession::new(
            connection,
            role,
            0,
            Arc::clone(&self.service),
            assigner,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localizer::SessionState;
    use crate::protocol::{COORDINATE_ASSIGNED, DISCOVERY_REQUEST};
    use crate::test_support::RecordingTransport;
    use crate::wire::split_command;
    use colocate_env::PeerId;
    use nalgebra::Vector3;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeCloud {
        configured: Mutex<Option<SpatialAnchorsSettings>>,
        watching: Mutex<Option<ObservationSink<AnchorId>>>,
    }

    #[async_trait]
    impl SpatialAnchorsBackend for FakeCloud {
        fn configure(&self, settings: &SpatialAnchorsSettings) {
            *self.configured.lock().unwrap() = Some(settings.clone());
        }

        async fn create_anchor(&self, _cancel: &CancellationToken) -> Option<(AnchorId, Pose)> {
            Some((
                AnchorId("anchor-1".into()),
                Pose { position: Vector3::new(1.0, 2.0, 3.0), ..Pose::identity() },
            ))
        }

        fn start_watching(&self, sink: ObservationSink<AnchorId>, _targets: &[AnchorId]) {
            *self.watching.lock().unwrap() = Some(sink);
        }

        fn stop_watching(&self) {
            self.watching.lock().unwrap().take();
        }
    }

    fn creator_settings() -> LocalizationSettings {
        LocalizationSettings::SpatialAnchors(SpatialAnchorsSettings {
            is_coordinate_creator: true,
            account_domain: "mixedreality.example".into(),
            account_id: "account".into(),
            account_key: "key".into(),
        })
    }

    #[test]
    fn test_settings_round_trip() {
        let localizer = SpatialAnchorsLocalizer::new(Arc::new(FakeCloud::default()));
        let settings = creator_settings();
        let mut writer = CommandWriter::new();
        localizer.serialize_settings(&settings, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(
            localizer.deserialize_settings(&mut CommandReader::new(&bytes)).unwrap(),
            settings
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_creator_assigns_created_anchor() {
        let cloud = Arc::new(FakeCloud::default());
        let localizer = SpatialAnchorsLocalizer::new(cloud.clone());
        let transport = Arc::new(RecordingTransport::new());
        let peer = PeerId::from_seed(4);
        transport.connect_peer(peer);

        let connection = PeerConnection::new(peer, SpatialAnchorsLocalizer::ID, transport.clone());
        let session = localizer.create_session(connection, &creator_settings()).unwrap();
        assert_eq!(cloud.configured.lock().unwrap().as_ref().unwrap().account_id, "account");

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.localize(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut writer = CommandWriter::new();
        writer.write_str(DISCOVERY_REQUEST);
        writer.write_i32(0);
        let bytes = writer.into_bytes();
        session.on_data_received(&mut CommandReader::new(&bytes));

        let coordinate = task.await.unwrap().expect("creator should resolve its own anchor");
        assert_eq!(coordinate.id, "anchor-1");
        assert_eq!(coordinate.pose.position, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(session.state(), SessionState::Resolved);

        let frames = transport.sent_frames(peer);
        let (_, mut reader) = split_command(&frames[0]).unwrap();
        reader.read_uuid().unwrap();
        assert_eq!(reader.read_string().unwrap(), COORDINATE_ASSIGNED);
        assert_eq!(reader.read_string().unwrap(), "anchor-1");
        // Detection released after the discovery
        assert!(cloud.watching.lock().unwrap().is_none());
    }

    fn assign_anchor(session: &Arc<dyn LocalizationSession>, id: &str) {
        let mut writer = CommandWriter::new();
        writer.write_str(COORDINATE_ASSIGNED);
        writer.write_str(id);
        let bytes = writer.into_bytes();
        session.on_data_received(&mut CommandReader::new(&bytes));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_anchor_does_not_block_later_success() {
        let cloud = Arc::new(FakeCloud::default());
        let localizer = SpatialAnchorsLocalizer::new(cloud.clone());
        let transport = Arc::new(RecordingTransport::new());
        let peer = PeerId::from_seed(5);
        transport.connect_peer(peer);
        let watcher_settings = LocalizationSettings::SpatialAnchors(SpatialAnchorsSettings::default());
        let new_session = || {
            let connection = PeerConnection::new(peer, SpatialAnchorsLocalizer::ID, transport.clone());
            localizer.create_session(connection, &watcher_settings).unwrap()
        };

        let abandoned = new_session();
        let cancel = CancellationToken::new();
        let task = {
            let (session, cancel) = (abandoned.clone(), cancel.clone());
            tokio::spawn(async move { session.localize(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assign_anchor(&abandoned, "a1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(localizer.has_unresolved_coordinates());
        cancel.cancel();
        assert!(task.await.unwrap().is_none());
        assert!(!localizer.has_unresolved_coordinates());

        let retry = new_session();
        let task = {
            let session = retry.clone();
            tokio::spawn(async move { session.localize(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assign_anchor(&retry, "a2");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sink = cloud.watching.lock().unwrap().clone().unwrap();
        sink.seen(AnchorId("a2".into()), Pose::identity());

        assert_eq!(task.await.unwrap().unwrap().id, "a2");
        assert!(!localizer.has_unresolved_coordinates());
        assert!(localizer.coordinate("a1").is_none());
    }
}
