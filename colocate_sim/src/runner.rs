//! Scenario runner - executes localization scenarios on a virtual clock.

use crate::error::{check, SimError};
use crate::peer::{SessionMessage, SimPeer};
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimDevice, SimWorld};

use colocate_core::localizer::{HandshakeRole, MarkerLocalizer, MarkerSettings, SimulatedLocalizer, SimulatedSettings};
use colocate_core::protocol::COORDINATE_STATE;
use colocate_core::{LocalizationSettings, Pose};
use colocate_env::{ColocateContext, LocalizerId, NetworkController, PeerId};
use nalgebra::Vector3;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MARKER: LocalizerId = MarkerLocalizer::MARKER_VISUAL_ID;

/// How long a scripted peer waits for any single expected frame.
const STEP: Duration = Duration::from_secs(10);

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Localize calls that returned `Ok(true)`
    pub localizations_succeeded: u64,

    /// Localize calls that returned `Ok(false)`
    pub localizations_failed: u64,

    /// Transport sends across all nodes
    pub sends: u64,

    /// Payload bytes across all nodes
    pub bytes_sent: u64,

    /// Chunks delivered to inboxes
    pub chunks_delivered: u64,

    /// Links torn down
    pub links_severed: u64,
}

impl ScenarioMetrics {
    fn record(&mut self, localized: bool) {
        if localized {
            self.localizations_succeeded += 1;
        } else {
            self.localizations_failed += 1;
        }
    }
}

/// Runs localization scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// World configuration (its seed is overridden)
    config: SimConfig,

    /// Virtual time after which a scenario is failed
    time_limit: Duration,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            config: SimConfig::default(),
            time_limit: Duration::from_secs(300),
        }
    }

    /// Sets the world configuration.
    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the virtual time limit per scenario.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    /// Runs a scenario on a fresh paused-clock runtime.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(e) => self.finish(scenario, Duration::ZERO, ScenarioMetrics::default(), Err(e.into())),
        }
    }

    /// Runs a scenario on the current runtime, which should have a paused clock.
    pub async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("  {}", scenario.description());

        let mut config = self.config.clone();
        config.seed = self.seed;
        let mut world = SimWorld::new(config);
        let mut metrics = ScenarioMetrics::default();

        let outcome = tokio::time::timeout(self.time_limit, async {
            match scenario {
                ScenarioId::Handshake => run_handshake(&mut world, &mut metrics).await,
                ScenarioId::CancelBeforeAssign => run_cancel_before_assign(&mut world, &mut metrics).await,
                ScenarioId::StaleFound => run_stale_found(&mut world, &mut metrics).await,
                ScenarioId::Supersede => run_supersede(&mut world, &mut metrics).await,
                ScenarioId::Reset => run_reset(&mut world, &mut metrics).await,
                ScenarioId::ChoppyLink => run_choppy_link(&mut world, &mut metrics).await,
                ScenarioId::PeerDisconnect => run_peer_disconnect(&mut world, &mut metrics).await,
                ScenarioId::TwoManagers => run_two_managers(&mut world, &mut metrics).await,
            }
        })
        .await
        .unwrap_or(Err(SimError::TimedOut(self.time_limit)));

        let stats = world.stats();
        metrics.sends = stats.sends;
        metrics.bytes_sent = stats.bytes_sent;
        metrics.chunks_delivered = stats.chunks_delivered;
        metrics.links_severed = stats.links_severed;
        self.finish(scenario, world.context.now(), metrics, outcome)
    }

    fn finish(
        &self,
        scenario: ScenarioId,
        elapsed: Duration,
        metrics: ScenarioMetrics,
        outcome: Result<(), SimError>,
    ) -> ScenarioResult {
        let failure_reason = outcome.err().map(|e| e.to_string());
        if let Some(reason) = &failure_reason {
            warn!("Scenario {} failed: {}", scenario.name(), reason);
        }
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            final_time_secs: elapsed.as_secs_f64(),
            failure_reason,
            metrics,
        }
    }
}

// ============================================================================
// SHARED STEPS
// ============================================================================

fn marker_settings(role: HandshakeRole, max_supported_id: i32) -> LocalizationSettings {
    LocalizationSettings::Marker(MarkerSettings { role, max_supported_id })
}

fn marker_pose(x: f64, yaw_degrees: f64) -> Pose {
    Pose::from_euler_degrees(Vector3::new(x, 1.5, -2.0), 0.0, yaw_degrees, 0.0)
}

fn is_discovery_request(message: &SessionMessage) -> bool {
    matches!(message, SessionMessage::DiscoveryRequest { .. })
}

/// A device plus a scripted peer, linked, with marker 0 in the device's view.
async fn device_and_peer(world: &mut SimWorld) -> Result<(SimDevice, Arc<SimPeer>), SimError> {
    let device = world.add_device("device")?;
    device.place_marker(0, marker_pose(0.5, 90.0));
    let remote = world.add_peer();
    world.connect(device.id(), remote.id())?;
    world.settle().await;
    check(
        device.manager.connected_peers() == vec![remote.id()],
        "device did not register the peer",
    )?;
    Ok((device, remote))
}

fn spawn_localize(
    device: &SimDevice,
    peer: PeerId,
    settings: LocalizationSettings,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<Result<bool, colocate_core::LocalizationError>> {
    let manager = device.manager.clone();
    tokio::spawn(async move { manager.localize_with_cancel(peer, MARKER, settings, &cancel).await })
}

/// Plays the initiator against a responder device: waits for the request,
/// assigns "0", and checks the device reports the marker found.
async fn play_initiator(device: &SimDevice, remote: &SimPeer, max_supported_id: i32) -> Result<(), SimError> {
    let request = remote
        .expect_session(STEP, is_discovery_request)
        .await
        .ok_or_else(|| SimError::Check("no DiscoveryRequest from device".into()))?;
    check(
        request
            == SessionMessage::DiscoveryRequest {
                localizer: MARKER,
                max_supported_id,
            },
        format!("unexpected request {:?}", request),
    )?;

    remote.assign(device.id(), MARKER, "0")?;
    let found = remote
        .expect_session(STEP, |m| matches!(m, SessionMessage::CoordinateFound { .. }))
        .await;
    check(
        found
            == Some(SessionMessage::CoordinateFound {
                localizer: MARKER,
                id: "0".into(),
            }),
        format!("expected CoordinateFound 0, got {:?}", found),
    )
}

/// Full scenario A exchange on an already linked pair.
async fn localize_against_peer(
    world: &SimWorld,
    device: &SimDevice,
    remote: &SimPeer,
    metrics: &mut ScenarioMetrics,
) -> Result<(), SimError> {
    let attempt = spawn_localize(
        device,
        remote.id(),
        marker_settings(HandshakeRole::Responder, 0),
        CancellationToken::new(),
    );
    play_initiator(device, remote, 0).await?;
    let localized = attempt.await??;
    metrics.record(localized);
    check(localized, "localize returned false")?;

    let expected = device.markers.pose_of(colocate_core::localizer::MarkerId(0));
    check(
        device.manager.resolved_pose(remote.id()) == expected,
        "resolved pose differs from the marker's recorded pose",
    )?;
    let state = remote
        .expect(STEP, |m| m.command == COORDINATE_STATE)
        .await
        .and_then(|m| m.coordinate_state());
    check(
        state == Some((MARKER, true, "0".to_string())),
        format!("expected located CoordinateState, got {:?}", state),
    )?;

    remote.found(device.id(), MARKER, "0")?;
    remote.report_located(device.id(), MARKER, "0", &Pose::identity())?;
    world.settle().await;
    Ok(())
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// Scenario A: one handshake, both sides end up located.
async fn run_handshake(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), SimError> {
    let (device, remote) = device_and_peer(world).await?;
    check(
        !device.manager.all_local_coordinates_found(),
        "local coordinates reported found before localizing",
    )?;

    localize_against_peer(world, &device, &remote, metrics).await?;

    check(device.manager.all_local_coordinates_found(), "local coordinates not all found")?;
    check(device.manager.all_peer_coordinates_found(), "peer coordinates not all found")?;
    check(!device.manager.has_active_session(remote.id()), "session still registered")
}

/// Scenario B: cancelled while waiting for CoordinateAssigned.
async fn run_cancel_before_assign(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), SimError> {
    let (device, remote) = device_and_peer(world).await?;
    let cancel = CancellationToken::new();
    let attempt = spawn_localize(
        &device,
        remote.id(),
        marker_settings(HandshakeRole::Responder, 0),
        cancel.clone(),
    );

    remote
        .expect_session(STEP, is_discovery_request)
        .await
        .ok_or_else(|| SimError::Check("no DiscoveryRequest from device".into()))?;
    cancel.cancel();
    let localized = attempt.await??;
    metrics.record(localized);

    check(!localized, "cancelled localize returned true")?;
    check(device.manager.resolved_pose(remote.id()).is_none(), "participant gained a pose")?;
    check(!device.manager.has_active_session(remote.id()), "cancelled session still registered")?;
    check(device.markers.starts() == 0, "detection started without an assignment")?;

    // A late assignment has no session to land in
    remote.assign(device.id(), MARKER, "0")?;
    world.settle().await;
    check(device.manager.resolved_pose(remote.id()).is_none(), "late assignment produced a pose")?;
    check(
        remote.expect_session(Duration::from_secs(3), |_| true).await.is_none(),
        "device kept talking after cancellation",
    )
}

/// Scenario C: a stray CoordinateFound is dropped without harm.
async fn run_stale_found(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), SimError> {
    let (device, remote) = device_and_peer(world).await?;

    remote.found(device.id(), MARKER, "0")?;
    remote.found(device.id(), MARKER, "not-a-marker")?;
    world.settle().await;
    check(
        device.manager.connected_peers() == vec![remote.id()],
        "stray frame dropped the peer",
    )?;
    check(!device.manager.has_active_session(remote.id()), "stray frame created a session")?;

    localize_against_peer(world, &device, &remote, metrics).await
}

/// Scenario D: the first session is gone before the second one speaks.
async fn run_supersede(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), SimError> {
    let (device, remote) = device_and_peer(world).await?;
    let first = spawn_localize(
        &device,
        remote.id(),
        marker_settings(HandshakeRole::Responder, 0),
        CancellationToken::new(),
    );
    remote
        .expect_session(STEP, |m| {
            matches!(m, SessionMessage::DiscoveryRequest { max_supported_id: 0, .. })
        })
        .await
        .ok_or_else(|| SimError::Check("no DiscoveryRequest from first session".into()))?;

    let second = spawn_localize(
        &device,
        remote.id(),
        marker_settings(HandshakeRole::Responder, 1),
        CancellationToken::new(),
    );
    remote
        .expect_session(STEP, |m| {
            matches!(m, SessionMessage::DiscoveryRequest { max_supported_id: 1, .. })
        })
        .await
        .ok_or_else(|| SimError::Check("no DiscoveryRequest from second session".into()))?;
    check(
        first.is_finished(),
        "first attempt still running when the second session spoke",
    )?;

    let first_localized = first.await??;
    metrics.record(first_localized);
    check(!first_localized, "superseded attempt returned true")?;

    remote.assign(device.id(), MARKER, "0")?;
    let second_localized = second.await??;
    metrics.record(second_localized);
    check(second_localized, "second attempt did not localize")?;

    // Nothing from the first session after the second one's first frame
    let requests: Vec<i32> = remote
        .log()
        .iter()
        .filter_map(|m| match m.session() {
            Some(SessionMessage::DiscoveryRequest { max_supported_id, .. }) => Some(max_supported_id),
            _ => None,
        })
        .collect();
    let first_of_second = requests.iter().position(|max| *max == 1).unwrap_or(requests.len());
    check(
        requests[first_of_second..].iter().all(|max| *max == 1),
        format!("first session kept sending after being superseded: {:?}", requests),
    )
}

/// Reset forgets the coordinate and localizes from scratch.
async fn run_reset(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), SimError> {
    let (device, remote) = device_and_peer(world).await?;
    localize_against_peer(world, &device, &remote, metrics).await?;
    remote.drain().await;
    let starts = device.markers.starts();

    let manager = device.manager.clone();
    let peer = remote.id();
    let attempt = tokio::spawn(async move {
        manager
            .reset_localization(peer, MARKER, marker_settings(HandshakeRole::Responder, 0))
            .await
    });

    remote
        .expect_session(STEP, is_discovery_request)
        .await
        .ok_or_else(|| SimError::Check("no DiscoveryRequest after reset".into()))?;
    check(device.manager.resolved_pose(peer).is_none(), "reset kept the old pose")?;
    check(
        device.marker_localizer.service().try_get_by_wire_id("0").map_or(true, |c| !c.is_located()),
        "reset kept the marker located",
    )?;

    remote.assign(device.id(), MARKER, "0")?;
    let localized = attempt.await??;
    metrics.record(localized);
    check(localized, "localize after reset failed")?;
    check(device.markers.starts() == starts + 1, "reset did not rediscover the marker")?;
    check(device.manager.resolved_pose(peer).is_some(), "no pose after reset")
}

/// Two managers, marker handshake over a link that fragments every frame.
async fn run_choppy_link(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), SimError> {
    let a = world.add_device("a")?;
    let b = world.add_device("b")?;
    a.place_marker(0, marker_pose(1.0, 0.0));
    b.place_marker(0, marker_pose(-1.0, 180.0));
    world.connect(a.id(), b.id())?;
    for (from, to) in [(a.id(), b.id()), (b.id(), a.id())] {
        world.network.set_max_chunk(from, to, 3);
        world.network.set_link_latency(from, to, 40);
    }
    world.settle().await;

    let a_role = HandshakeRole::Initiator;
    let a_attempt = {
        let manager = a.manager.clone();
        let peer = b.id();
        tokio::spawn(async move { manager.localize(peer, MARKER, marker_settings(a_role, 0)).await })
    };
    world.settle().await;
    let b_localized = b
        .manager
        .localize(a.id(), MARKER, marker_settings(a_role.opposite(), 0))
        .await?;
    let a_localized = a_attempt.await??;
    metrics.record(a_localized);
    metrics.record(b_localized);
    check(a_localized && b_localized, "choppy handshake failed")?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    check(a.manager.all_peer_coordinates_found(), "a never heard b's coordinate state")?;
    check(b.manager.all_peer_coordinates_found(), "b never heard a's coordinate state")?;
    let stats = world.stats();
    check(stats.chunks_delivered > stats.sends, "link never fragmented a send")
}

/// Link severed mid-handshake; a fresh link localizes normally.
async fn run_peer_disconnect(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), SimError> {
    let (device, remote) = device_and_peer(world).await?;
    let attempt = spawn_localize(
        &device,
        remote.id(),
        marker_settings(HandshakeRole::Responder, 0),
        CancellationToken::new(),
    );
    remote
        .expect_session(STEP, is_discovery_request)
        .await
        .ok_or_else(|| SimError::Check("no DiscoveryRequest from device".into()))?;

    world.network.sever(device.id(), remote.id());
    let localized = attempt.await??;
    metrics.record(localized);
    check(!localized, "localize survived the disconnect")?;
    world.settle().await;
    check(device.manager.connected_peers().is_empty(), "participant kept after disconnect")?;
    check(!remote.is_connected(device.id()), "peer still sees the link")?;

    world.connect(device.id(), remote.id())?;
    world.settle().await;
    remote.drain().await;
    localize_against_peer(world, &device, &remote, metrics).await
}

/// Local and remote simulated localization, plus a capability query.
async fn run_two_managers(world: &mut SimWorld, metrics: &mut ScenarioMetrics) -> Result<(), SimError> {
    let a = world.add_device("a")?;
    let b = world.add_device("b")?;
    world.connect(a.id(), b.id())?;
    world.settle().await;

    let supported = a.manager.request_supported_localizers(b.id()).await?;
    check(
        supported.contains(&MARKER) && supported.contains(&SimulatedLocalizer::ID),
        format!("unexpected supported localizers {:?}", supported),
    )?;

    let coordinate = Pose::from_euler_degrees(Vector3::new(0.0, 0.0, 1.0), 0.0, 180.0, 0.0);
    let local = LocalizationSettings::Simulated(SimulatedSettings {
        role: HandshakeRole::Responder,
        pose: coordinate,
        delay: Duration::from_millis(750),
    });
    let remote = LocalizationSettings::Simulated(SimulatedSettings {
        role: HandshakeRole::Initiator,
        pose: coordinate,
        delay: Duration::from_millis(250),
    });
    let localized = a
        .manager
        .localize_with_peer(b.id(), SimulatedLocalizer::ID, local, remote)
        .await?;
    metrics.record(localized);
    check(localized, "localize_with_peer failed")?;

    world.settle().await;
    check(b.manager.resolved_pose(a.id()).is_some(), "remote side has no pose")?;
    check(a.manager.all_peer_coordinates_found(), "a never heard b's coordinate state")?;
    check(b.manager.all_peer_coordinates_found(), "b never heard a's coordinate state")?;
    check(
        a.manager.participant(b.id()).and_then(|p| p.peer_coordinate_id) == Some("0".to_string()),
        "peer reported a different coordinate id",
    )
}
