//! End-to-end handshakes between a device and a scripted peer.

use colocate_core::localizer::{
    HandshakeRole, MarkerId, MarkerLocalizer, MarkerSettings, SimulatedLocalizer, SimulatedSettings,
};
use colocate_core::protocol::COORDINATE_STATE;
use colocate_core::{LocalizationSettings, Pose};
use colocate_env::LocalizerId;
use colocate_sim::scenarios::ScenarioId;
use colocate_sim::{LinkConfig, ScenarioRunner, SessionMessage, SimConfig, SimDevice, SimPeer, SimWorld};
use nalgebra::Vector3;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MARKER: LocalizerId = MarkerLocalizer::MARKER_VISUAL_ID;
const STEP: Duration = Duration::from_secs(10);

fn marker(role: HandshakeRole, max_supported_id: i32) -> LocalizationSettings {
    LocalizationSettings::Marker(MarkerSettings { role, max_supported_id })
}

async fn linked_pair(world: &mut SimWorld) -> (SimDevice, Arc<SimPeer>) {
    let device = world.add_device("device").unwrap();
    device.place_marker(
        0,
        Pose::from_euler_degrees(Vector3::new(0.25, 1.0, -3.0), 0.0, 45.0, 0.0),
    );
    let remote = world.add_peer();
    world.connect(device.id(), remote.id()).unwrap();
    world.settle().await;
    (device, remote)
}

fn localize(
    device: &SimDevice,
    remote: &SimPeer,
    settings: LocalizationSettings,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<Result<bool, colocate_core::LocalizationError>> {
    let manager = device.manager.clone();
    let peer = remote.id();
    tokio::spawn(async move { manager.localize_with_cancel(peer, MARKER, settings, &cancel).await })
}

fn session_log(remote: &SimPeer) -> Vec<SessionMessage> {
    remote.log().iter().filter_map(|m| m.session()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_responder_handshake_resolves_and_reports_state() {
    let mut world = SimWorld::new(SimConfig::default());
    let (device, remote) = linked_pair(&mut world).await;

    let attempt = localize(&device, &remote, marker(HandshakeRole::Responder, 0), CancellationToken::new());
    let request = remote.expect_session(STEP, |_| true).await;
    assert_eq!(
        request,
        Some(SessionMessage::DiscoveryRequest {
            localizer: MARKER,
            max_supported_id: 0
        })
    );

    remote.assign(device.id(), MARKER, "0").unwrap();
    assert!(attempt.await.unwrap().unwrap());

    let state = remote
        .expect(STEP, |m| m.command == COORDINATE_STATE)
        .await
        .and_then(|m| m.coordinate_state());
    assert_eq!(state, Some((MARKER, true, "0".to_string())));

    // Found goes out before the coordinate state
    let log = remote.log();
    let found_at = log
        .iter()
        .position(|m| matches!(m.session(), Some(SessionMessage::CoordinateFound { .. })));
    let state_at = log.iter().position(|m| m.command == COORDINATE_STATE);
    assert!(found_at.is_some());
    assert!(found_at < state_at);

    assert_eq!(
        device.manager.resolved_pose(remote.id()),
        device.markers.pose_of(MarkerId(0))
    );
    assert!(!device.manager.has_active_session(remote.id()));
}

#[tokio::test(start_paused = true)]
async fn test_initiator_device_assigns_first_id() {
    let mut world = SimWorld::new(SimConfig::default());
    let (device, remote) = linked_pair(&mut world).await;

    let attempt = localize(&device, &remote, marker(HandshakeRole::Initiator, 0), CancellationToken::new());
    world.settle().await;
    remote.request_discovery(device.id(), MARKER, 0).unwrap();

    let assigned = remote
        .expect_session(STEP, |m| matches!(m, SessionMessage::CoordinateAssigned { .. }))
        .await;
    assert_eq!(
        assigned,
        Some(SessionMessage::CoordinateAssigned {
            localizer: MARKER,
            id: "0".into()
        })
    );
    let found = remote
        .expect_session(STEP, |m| matches!(m, SessionMessage::CoordinateFound { .. }))
        .await;
    assert_eq!(
        found,
        Some(SessionMessage::CoordinateFound {
            localizer: MARKER,
            id: "0".into()
        })
    );
    assert!(attempt.await.unwrap().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_found_is_not_echoed_when_peer_found_first() {
    let mut world = SimWorld::new(SimConfig::default());
    let (device, remote) = linked_pair(&mut world).await;

    let attempt = localize(&device, &remote, marker(HandshakeRole::Responder, 0), CancellationToken::new());
    remote.expect_session(STEP, |_| true).await.unwrap();
    remote.assign(device.id(), MARKER, "0").unwrap();
    remote.found(device.id(), MARKER, "0").unwrap();

    assert!(attempt.await.unwrap().unwrap());
    world.settle().await;
    assert!(!session_log(&remote)
        .iter()
        .any(|m| matches!(m, SessionMessage::CoordinateFound { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_assignment() {
    let mut world = SimWorld::new(SimConfig::default());
    let (device, remote) = linked_pair(&mut world).await;

    let cancel = CancellationToken::new();
    let attempt = localize(&device, &remote, marker(HandshakeRole::Responder, 0), cancel.clone());
    remote.expect_session(STEP, |_| true).await.unwrap();

    cancel.cancel();
    assert!(!attempt.await.unwrap().unwrap());
    assert_eq!(device.markers.starts(), 0);
    assert!(device.manager.resolved_pose(remote.id()).is_none());
    assert!(!device.manager.has_active_session(remote.id()));

    remote.drain().await;
    remote.assign(device.id(), MARKER, "0").unwrap();
    assert!(remote.recv(Duration::from_secs(3)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stray_found_keeps_peer_connected() {
    let mut world = SimWorld::new(SimConfig::default());
    let (device, remote) = linked_pair(&mut world).await;
    remote.drain().await;

    remote.found(device.id(), MARKER, "0").unwrap();
    world.settle().await;
    assert_eq!(device.manager.connected_peers(), vec![remote.id()]);
    assert!(remote.recv(Duration::from_secs(1)).await.is_none());

    let attempt = localize(&device, &remote, marker(HandshakeRole::Responder, 0), CancellationToken::new());
    remote.expect_session(STEP, |_| true).await.unwrap();
    remote.assign(device.id(), MARKER, "0").unwrap();
    assert!(attempt.await.unwrap().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_second_localize_supersedes_first() {
    let mut world = SimWorld::new(SimConfig::default());
    let (device, remote) = linked_pair(&mut world).await;

    let first = localize(&device, &remote, marker(HandshakeRole::Responder, 0), CancellationToken::new());
    remote.expect_session(STEP, |_| true).await.unwrap();

    let second = localize(&device, &remote, marker(HandshakeRole::Responder, 1), CancellationToken::new());
    assert!(!first.await.unwrap().unwrap());

    remote
        .expect_session(STEP, |m| {
            matches!(m, SessionMessage::DiscoveryRequest { max_supported_id: 1, .. })
        })
        .await
        .unwrap();
    remote.assign(device.id(), MARKER, "0").unwrap();
    assert!(second.await.unwrap().unwrap());

    let requests: Vec<i32> = session_log(&remote)
        .into_iter()
        .filter_map(|m| match m {
            SessionMessage::DiscoveryRequest { max_supported_id, .. } => Some(max_supported_id),
            _ => None,
        })
        .collect();
    let switch = requests.iter().position(|max| *max == 1).unwrap();
    assert!(requests[..switch].iter().all(|max| *max == 0));
    assert!(requests[switch..].iter().all(|max| *max == 1));
}

#[tokio::test(start_paused = true)]
async fn test_next_peer_sees_marker_where_it_is_now() {
    let mut world = SimWorld::new(SimConfig::default());
    let (device, first) = linked_pair(&mut world).await;
    let second = world.add_peer();
    world.connect(device.id(), second.id()).unwrap();
    world.settle().await;

    let attempt = localize(&device, &first, marker(HandshakeRole::Responder, 0), CancellationToken::new());
    first.expect_session(STEP, |_| true).await.unwrap();
    first.assign(device.id(), MARKER, "0").unwrap();
    assert!(attempt.await.unwrap().unwrap());
    let first_pose = device.markers.pose_of(MarkerId(0));

    device.place_marker(0, Pose::from_euler_degrees(Vector3::new(-2.0, 0.5, 1.0), 0.0, 90.0, 0.0));
    let moved = device.markers.pose_of(MarkerId(0));
    assert_ne!(first_pose, moved);

    let attempt = localize(&device, &second, marker(HandshakeRole::Responder, 0), CancellationToken::new());
    second.expect_session(STEP, |_| true).await.unwrap();
    second.assign(device.id(), MARKER, "0").unwrap();
    assert!(attempt.await.unwrap().unwrap());

    assert_eq!(device.manager.resolved_pose(second.id()), moved);
    assert_eq!(device.manager.resolved_pose(first.id()), first_pose);
    assert_eq!(device.markers.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_retry_after_cancel_clears_aggregate() {
    let mut world = SimWorld::new(SimConfig::default());
    let (device, remote) = linked_pair(&mut world).await;
    let simulated = |x: f64, delay: Duration| {
        LocalizationSettings::Simulated(SimulatedSettings {
            role: HandshakeRole::Responder,
            pose: Pose::from_euler_degrees(Vector3::new(x, 0.0, 0.0), 0.0, 0.0, 0.0),
            delay,
        })
    };
    let spawn = |settings: LocalizationSettings, cancel: CancellationToken| {
        let manager = device.manager.clone();
        let peer = remote.id();
        tokio::spawn(async move {
            manager
                .localize_with_cancel(peer, SimulatedLocalizer::ID, settings, &cancel)
                .await
        })
    };

    let cancel = CancellationToken::new();
    let abandoned = spawn(simulated(1.0, Duration::from_secs(5)), cancel.clone());
    remote.expect_session(STEP, |_| true).await.unwrap();
    remote.assign(device.id(), SimulatedLocalizer::ID, "0").unwrap();
    world.settle().await;
    cancel.cancel();
    assert!(!abandoned.await.unwrap().unwrap());

    remote.drain().await;
    let retry = spawn(simulated(3.0, Duration::from_millis(200)), CancellationToken::new());
    remote.expect_session(STEP, |_| true).await.unwrap();
    remote.assign(device.id(), SimulatedLocalizer::ID, "0").unwrap();
    assert!(retry.await.unwrap().unwrap());

    assert_eq!(device.manager.resolved_pose(remote.id()).map(|p| p.position.x), Some(3.0));
    assert!(device.manager.all_local_coordinates_found());
}

#[test]
fn test_every_scenario_passes_across_seeds() {
    for seed in [1, 42, 0xdead_beef] {
        let runner = ScenarioRunner::new(seed);
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario);
            assert!(
                result.passed,
                "{} seed={} failed: {:?}",
                scenario,
                seed,
                result.failure_reason
            );
        }
    }
}

#[test]
fn test_scenarios_pass_over_slow_fragmenting_links() {
    let config = SimConfig {
        link: LinkConfig {
            latency: Duration::from_millis(30),
            max_chunk: 5,
        },
        ..SimConfig::default()
    };
    let runner = ScenarioRunner::new(9).with_config(config);
    for scenario in [
        ScenarioId::Handshake,
        ScenarioId::CancelBeforeAssign,
        ScenarioId::StaleFound,
        ScenarioId::Supersede,
    ] {
        let result = runner.run(scenario);
        assert!(result.passed, "{} failed: {:?}", scenario, result.failure_reason);
        assert!(result.metrics.chunks_delivered > result.metrics.sends);
    }
}

#[test]
fn test_same_seed_same_traffic() {
    let first = ScenarioRunner::new(5).run(ScenarioId::Handshake);
    let second = ScenarioRunner::new(5).run(ScenarioId::Handshake);
    assert_eq!(first.metrics.sends, second.metrics.sends);
    assert_eq!(first.metrics.bytes_sent, second.metrics.bytes_sent);
}
