//! Simulated localization for desktop testing: no hardware, coordinates
//! appear at a configured pose after a delay.

use crate::coordinate::{Pose, SpatialCoordinate};
use crate::coordinate_service::{CoordinateService, CoordinateServiceConfig, ObservationSink, SensorBackend};
use crate::localizer::session::{FirstIdAssigner, HandshakeRole, HandshakeSession, LocalizationSession};
use crate::localizer::{mismatch, read_role, write_role, LocalizationSettings, LocalizerError, PeerConnection, SpatialLocalizer};
use crate::lock_unpoisoned;
use crate::wire::{CommandReader, CommandWriter};
use colocate_env::{ColocateContext, LocalizerId, TokioContext};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Settings for simulated localization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedSettings {
    /// Handshake role (default: Initiator)
    pub role: HandshakeRole,

    /// Where the coordinate appears (default: origin, rotated 180° about y)
    pub pose: Pose,

    /// Time from detection start to the coordinate appearing (default: 5s)
    pub delay: Duration,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            role: HandshakeRole::Initiator,
            pose: Pose::from_euler_degrees(Vector3::zeros(), 0.0, 180.0, 0.0),
            delay: Duration::from_secs(5),
        }
    }
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;
type Spawner = Arc<dyn Fn(BoxedTask) + Send + Sync>;

fn spawner<C: ColocateContext>(context: Arc<C>) -> Spawner {
    Arc::new(move |task| context.spawn("simulated-sensor", task))
}

/// Reports every requested id at a fixed pose after a delay.
///
/// Pose and delay are session settings, so each session gets its own sensor.
pub struct SimulatedSensor {
    pose: Pose,
    delay: Duration,
    spawn: Spawner,
    running: Mutex<Option<CancellationToken>>,
}

impl SimulatedSensor {
    pub fn new<C: ColocateContext>(context: Arc<C>, pose: Pose, delay: Duration) -> Self {
        Self::with_spawner(spawner(context), pose, delay)
    }

    fn with_spawner(spawn: Spawner, pose: Pose, delay: Duration) -> Self {
        Self {
            pose,
            delay,
            spawn,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.running).is_some()
    }
}

impl SensorBackend<String> for SimulatedSensor {
    fn name(&self) -> &str {
        "simulated"
    }

    fn start_detecting(&self, sink: ObservationSink<String>, targets: &[String]) {
        let stop = CancellationToken::new();
        if let Some(previous) = lock_unpoisoned(&self.running).replace(stop.clone()) {
            previous.cancel();
        }

        let (pose, delay) = (self.pose, self.delay);
        let targets = targets.to_vec();
        (self.spawn)(Box::pin(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    for id in targets {
                        debug!("Simulated coordinate {} appeared", id);
                        sink.seen(id, pose);
                    }
                }
            }
        }));
    }

    fn stop_detecting(&self) {
        if let Some(stop) = lock_unpoisoned(&self.running).take() {
            stop.cancel();
        }
    }
}

/// Localizer that needs no hardware.
pub struct SimulatedLocalizer {
    spawn: Spawner,
    /// One service per session, oldest first
    services: Mutex<Vec<Arc<CoordinateService<String>>>>,
}

impl SimulatedLocalizer {
    pub const ID: LocalizerId = LocalizerId::from_u128(0x6F1C2B9E_3D47_4A5B_A0E8_51F7C2D9B316);

    /// Localizer whose sensors run on plain tokio tasks.
    pub fn new() -> Self {
        Self::with_context(TokioContext::shared())
    }

    /// Localizer whose sensors are spawned through `context`.
    pub fn with_context<C: ColocateContext>(context: Arc<C>) -> Self {
        Self {
            spawn: spawner(context),
            services: Mutex::new(Vec::new()),
        }
    }

    /// Builds the sensor and service for one session.
    fn session_service(&self, settings: &SimulatedSettings) -> Arc<CoordinateService<String>> {
        let sensor = SimulatedSensor::with_spawner(Arc::clone(&self.spawn), settings.pose, settings.delay);
        let service = Arc::new(CoordinateService::new(Arc::new(sensor), CoordinateServiceConfig::default()));
        let mut services = lock_unpoisoned(&self.services);
        // Finished sessions that located nothing have nothing left to report
        services.retain(|s| s.active_discoveries() > 0 || !s.known_coordinates().is_empty());
        services.push(Arc::clone(&service));
        service
    }

    fn services(&self) -> Vec<Arc<CoordinateService<String>>> {
        lock_unpoisoned(&self.services).clone()
    }
}

impl Default for SimulatedLocalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialLocalizer for SimulatedLocalizer {
    fn id(&self) -> LocalizerId {
        Self::ID
    }

    fn name(&self) -> &str {
        "simulated"
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn default_settings(&self) -> LocalizationSettings {
        LocalizationSettings::Simulated(SimulatedSettings::default())
    }

    fn serialize_settings(
        &self,
        settings: &LocalizationSettings,
        writer: &mut CommandWriter,
    ) -> Result<(), LocalizerError> {
        let LocalizationSettings::Simulated(settings) = settings else {
            return Err(mismatch("simulated", settings));
        };
        write_role(writer, settings.role);
        settings.pose.write_to(writer);
        writer.write_u64(settings.delay.as_millis() as u64);
        Ok(())
    }

    fn deserialize_settings(&self, reader: &mut CommandReader<'_>) -> Result<LocalizationSettings, LocalizerError> {
        Ok(LocalizationSettings::Simulated(SimulatedSettings {
            role: read_role(reader)?,
            pose: Pose::read_from(reader)?,
            delay: Duration::from_millis(reader.read_u64()?),
        }))
    }

    fn create_session(
        &self,
        connection: PeerConnection,
        settings: &LocalizationSettings,
    ) -> Result<Arc<dyn LocalizationSession>, LocalizerError> {
        let LocalizationSettings::Simulated(settings) = settings else {
            return Err(mismatch("simulated", settings));
        };
        Ok(Arc::new(HandshakeSession::new(
            connection,
            settings.role,
            0,
            self.session_service(settings),
            Arc::new(FirstIdAssigner::new("0".to_string())),
        )))
    }

    /// The newest session's view of `id`.
    fn coordinate(&self, id: &str) -> Option<SpatialCoordinate> {
        let id = id.to_string();
        self.services()
            .iter()
            .rev()
            .find_map(|s| s.try_get_known_coordinate(&id))
            .map(|c| c.to_spatial())
    }

    fn has_unresolved_coordinates(&self) -> bool {
        self.services().iter().any(|s| s.has_unresolved())
    }

    fn reset_coordinates(&self) {
        for service in self.services() {
            service.reset();
        }
    }
}
