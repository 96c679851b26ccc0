//! The handshake localization session shared by every localizer variant.
//!
//! # Protocol
//!
//! ```text
//!   Responder                                   Initiator
//!   ─────────                                   ─────────
//!   DiscoveryRequest{max_supported_id} ───────►
//!        (re-sent every retry interval)         assign id (first in space)
//!                                    ◄───────── CoordinateAssigned{id}
//!   discover(id)                                discover(id)
//!   CoordinateFound{id} ─────────────────────►  (informational)
//!                     ◄─────────────────────── CoordinateFound{id}
//! ```
//!
//! Both roles run the same state machine:
//!
//! ```text
//! Created ─► AwaitingPeerHandshake ─► Discovering ─► Resolved
//!                  │                       │
//!                  └───────────┬───────────┘
//!                              ▼
//!                      Failed | Cancelled
//! ```
//!
//! A session is single-shot: once terminal, `localize` returns `None`.

use crate::coordinate::{CoordinateKey, SpatialCoordinate};
use crate::coordinate_service::{CoordinateService, DiscoveryOutcome};
use crate::localizer::PeerConnection;
use crate::lock_unpoisoned;
use crate::protocol::{COORDINATE_ASSIGNED, COORDINATE_FOUND, DISCOVERY_REQUEST};
use crate::wire::{CommandReader, CommandWriter};
use async_trait::async_trait;
use colocate_env::{LocalizerId, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION & STATE
// ============================================================================

/// Which side of the handshake a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeRole {
    /// Waits for the peer's request and assigns the coordinate id
    Initiator,

    /// Requests an id from the peer
    Responder,
}

impl HandshakeRole {
    /// The role the peer plays opposite this one.
    pub fn opposite(self) -> Self {
        match self {
            HandshakeRole::Initiator => HandshakeRole::Responder,
            HandshakeRole::Responder => HandshakeRole::Initiator,
        }
    }
}

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often the responder re-sends DiscoveryRequest (default: 1s)
    pub handshake_retry_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_retry_interval: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of one localization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    AwaitingPeerHandshake,
    Discovering,
    Resolved,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Resolved | SessionState::Failed | SessionState::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::AwaitingPeerHandshake => "awaiting-peer-handshake",
            SessionState::Discovering => "discovering",
            SessionState::Resolved => "resolved",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// One in-flight localization attempt against one peer.
#[async_trait]
pub trait LocalizationSession: Send + Sync {
    fn peer(&self) -> PeerId;

    fn localizer_id(&self) -> LocalizerId;

    fn state(&self) -> SessionState;

    /// Runs the attempt to completion.
    ///
    /// Returns the resolved coordinate, or `None` if the attempt failed or
    /// `cancel` fired. Cancellation is not an error.
    async fn localize(&self, cancel: &CancellationToken) -> Option<SpatialCoordinate>;

    /// Handles one session message from the peer.
    ///
    /// Called from the connection's receive loop; never blocks.
    fn on_data_received(&self, reader: &mut CommandReader<'_>);

    /// Cancels the attempt and releases its sensor subscription.
    fn dispose(&self);
}

/// Chooses the coordinate id for a handshake on the initiator side.
#[async_trait]
pub trait CoordinateAssigner<K: CoordinateKey>: Send + Sync {
    /// Picks an id within `[0, max_supported_id]` (or creates one).
    ///
    /// `None` fails the session.
    async fn assign(&self, max_supported_id: i32, cancel: &CancellationToken) -> Option<K>;
}

/// Always assigns the first id in the space.
///
/// Two sessions running at once would both get the same id; only one
/// session per peer pair is supported.
pub struct FirstIdAssigner<K> {
    first: K,
}

impl<K: CoordinateKey> FirstIdAssigner<K> {
    pub fn new(first: K) -> Self {
        Self { first }
    }
}

#[async_trait]
impl<K: CoordinateKey> CoordinateAssigner<K> for FirstIdAssigner<K> {
    async fn assign(&self, max_supported_id: i32, _cancel: &CancellationToken) -> Option<K> {
        if max_supported_id < 0 {
            warn!("Peer supports no coordinate ids (max {})", max_supported_id);
            return None;
        }
        Some(self.first.clone())
    }
}

// ============================================================================
// HANDSHAKE SESSION
// ============================================================================

/// The generic request/assign/discover/found session.
pub struct HandshakeSession<K: CoordinateKey> {
    connection: PeerConnection,
    role: HandshakeRole,
    max_supported_id: i32,
    config: SessionConfig,
    service: Arc<CoordinateService<K>>,
    assigner: Arc<dyn CoordinateAssigner<K>>,
    state: Mutex<SessionState>,
    requested: watch::Sender<Option<i32>>,
    assigned: watch::Sender<Option<K>>,
    found_by_peer: watch::Sender<Option<K>>,
    cancel: CancellationToken,
}

impl<K: CoordinateKey> HandshakeSession<K> {
    pub fn new(
        connection: PeerConnection,
        role: HandshakeRole,
        max_supported_id: i32,
        service: Arc<CoordinateService<K>>,
        assigner: Arc<dyn CoordinateAssigner<K>>,
    ) -> Self {
        Self {
            config: connection.session_config().clone(),
            connection,
            role,
            max_supported_id,
            service,
            assigner,
            state: Mutex::new(SessionState::Created),
            requested: watch::Sender::new(None),
            assigned: watch::Sender::new(None),
            found_by_peer: watch::Sender::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// The id agreed for this attempt, once the handshake got that far.
    pub fn assigned_id(&self) -> Option<K> {
        self.assigned.borrow().clone()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock_unpoisoned(&self.state);
        if *state != next {
            debug!(
                "Session {} with peer {}: {} -> {}",
                self.connection.localizer_id(),
                self.connection.peer(),
                *state,
                next
            );
            *state = next;
        }
    }

    fn send_header<F>(&self, header: &str, write: F) -> Result<(), SessionState>
    where
        F: FnOnce(&mut CommandWriter),
    {
        self.connection
            .send_data(|w| {
                w.write_str(header);
                write(w);
            })
            .map_err(|e| {
                warn!("Failed to send {} to peer {}: {}", header, self.connection.peer(), e);
                SessionState::Failed
            })
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<SpatialCoordinate, SessionState> {
        // Poses sighted before this attempt belong to earlier sessions
        let mark = self.service.observation_mark();
        self.set_state(SessionState::AwaitingPeerHandshake);
        let id = match self.role {
            HandshakeRole::Responder => self.request_assignment(cancel).await?,
            HandshakeRole::Initiator => self.assign_for_peer(cancel).await?,
        };

        self.set_state(SessionState::Discovering);
        match self
            .service
            .discover_coordinates_since(cancel, std::slice::from_ref(&id), mark)
            .await
        {
            DiscoveryOutcome::Located => {}
            DiscoveryOutcome::Cancelled => return Err(SessionState::Cancelled),
            DiscoveryOutcome::Unavailable => return Err(SessionState::Failed),
        }

        let coordinate = self
            .service
            .try_get_known_coordinate(&id)
            .filter(|c| c.is_located())
            .ok_or(SessionState::Failed)?;

        let peer_found_first = self.found_by_peer.borrow().as_ref() == Some(&id);
        if !peer_found_first {
            let wire_id = id.to_string();
            self.send_header(COORDINATE_FOUND, |w| w.write_str(&wire_id))?;
        }
        Ok(coordinate.to_spatial())
    }

    /// Responder side: ask for an id until the peer assigns one.
    async fn request_assignment(&self, cancel: &CancellationToken) -> Result<K, SessionState> {
        let mut assigned = self.assigned.subscribe();
        loop {
            self.send_header(DISCOVERY_REQUEST, |w| w.write_i32(self.max_supported_id))?;
            debug!(
                "Sent DiscoveryRequest (max id {}) to peer {}",
                self.max_supported_id,
                self.connection.peer()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionState::Cancelled),
                result = tokio::time::timeout(self.config.handshake_retry_interval, wait_some(&mut assigned)) => {
                    match result {
                        Ok(Some(id)) => return Ok(id),
                        Ok(None) => return Err(SessionState::Failed),
                        Err(_) => debug!("No CoordinateAssigned from peer {} yet", self.connection.peer()),
                    }
                }
            }
        }
    }

    /// Initiator side: wait for the request, assign, reply.
    async fn assign_for_peer(&self, cancel: &CancellationToken) -> Result<K, SessionState> {
        let mut requests = self.requested.subscribe();
        let max_supported_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionState::Cancelled),
            max = wait_some(&mut requests) => max.ok_or(SessionState::Failed)?,
        };

        let id = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionState::Cancelled),
            id = self.assigner.assign(max_supported_id, cancel) => id.ok_or(SessionState::Failed)?,
        };

        self.assigned.send_replace(Some(id.clone()));
        let wire_id = id.to_string();
        self.send_header(COORDINATE_ASSIGNED, |w| w.write_str(&wire_id))?;
        debug!("Assigned coordinate {} to peer {}", id, self.connection.peer());
        Ok(id)
    }

    fn read_id(&self, header: &str, reader: &mut CommandReader<'_>) -> Option<K> {
        let raw = match reader.read_string() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Malformed {} from peer {}: {}", header, self.connection.peer(), e);
                return None;
            }
        };
        match raw.parse::<K>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Unparseable coordinate id '{}' in {} from peer {}", raw, header, self.connection.peer());
                None
            }
        }
    }

    fn on_discovery_request(&self, reader: &mut CommandReader<'_>) {
        let max_supported_id = match reader.read_i32() {
            Ok(max) => max,
            Err(e) => {
                warn!("Malformed DiscoveryRequest from peer {}: {}", self.connection.peer(), e);
                return;
            }
        };
        if self.role != HandshakeRole::Initiator {
            warn!("Responder session got DiscoveryRequest from peer {}; dropped", self.connection.peer());
            return;
        }

        let previous = self.requested.send_replace(Some(max_supported_id));
        if previous.is_none() {
            return;
        }
        // Duplicate request: the peer may have missed our reply
        let assigned = self.assigned.borrow().clone();
        if let Some(id) = assigned {
            let wire_id = id.to_string();
            if self.send_header(COORDINATE_ASSIGNED, |w| w.write_str(&wire_id)).is_ok() {
                debug!("Re-sent CoordinateAssigned {} to peer {}", id, self.connection.peer());
            }
        }
    }

    fn on_coordinate_assigned(&self, reader: &mut CommandReader<'_>) {
        let Some(id) = self.read_id(COORDINATE_ASSIGNED, reader) else {
            return;
        };
        if self.role != HandshakeRole::Responder {
            warn!("Initiator session got CoordinateAssigned from peer {}; dropped", self.connection.peer());
            return;
        }
        let kept = self.assigned.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(id.clone());
                true
            } else {
                false
            }
        });
        if kept {
            debug!("Peer {} assigned coordinate {}", self.connection.peer(), id);
        }
    }

    fn on_coordinate_found(&self, reader: &mut CommandReader<'_>) {
        if let Some(id) = self.read_id(COORDINATE_FOUND, reader) {
            debug!("Peer {} found coordinate {}", self.connection.peer(), id);
            self.found_by_peer.send_replace(Some(id));
        }
    }
}

#[async_trait]
impl<K: CoordinateKey> LocalizationSession for HandshakeSession<K> {
    fn peer(&self) -> PeerId {
        self.connection.peer()
    }

    fn localizer_id(&self) -> LocalizerId {
        self.connection.localizer_id()
    }

    fn state(&self) -> SessionState {
        *lock_unpoisoned(&self.state)
    }

    async fn localize(&self, cancel: &CancellationToken) -> Option<SpatialCoordinate> {
        {
            let state = lock_unpoisoned(&self.state);
            if *state != SessionState::Created {
                warn!("Session with peer {} already ran ({})", self.connection.peer(), *state);
                return None;
            }
        }

        let linked = self.cancel.child_token();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                linked.cancel();
                Err(SessionState::Cancelled)
            }
            result = self.run(&linked) => result,
        };

        match result {
            Ok(coordinate) => {
                self.set_state(SessionState::Resolved);
                info!(
                    "Localized with peer {} on coordinate {} ({:?})",
                    self.connection.peer(),
                    coordinate.id,
                    self.role
                );
                Some(coordinate)
            }
            Err(state) => {
                self.set_state(state);
                info!("Localization with peer {} ended {}", self.connection.peer(), state);
                None
            }
        }
    }

    fn on_data_received(&self, reader: &mut CommandReader<'_>) {
        let header = match reader.read_string() {
            Ok(header) => header,
            Err(e) => {
                warn!("Malformed session message from peer {}: {}", self.connection.peer(), e);
                return;
            }
        };
        match header.as_str() {
            DISCOVERY_REQUEST => self.on_discovery_request(reader),
            COORDINATE_ASSIGNED => self.on_coordinate_assigned(reader),
            COORDINATE_FOUND => self.on_coordinate_found(reader),
            other => warn!("Unknown session header '{}' from peer {}; dropped", other, self.connection.peer()),
        }
    }

    fn dispose(&self) {
        self.cancel.cancel();
    }
}

impl<K: CoordinateKey> Drop for HandshakeSession<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Waits until the watched value is set; `None` if the sender is gone.
async fn wait_some<T: Clone>(rx: &mut watch::Receiver<Option<T>>) -> Option<T> {
    match rx.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::Pose;
    use crate::coordinate_service::{ObservationSink, SensorBackend};
    use crate::protocol::LOCALIZATION_DATA;
    use crate::test_support::RecordingTransport;
    use crate::wire::split_command;
    use colocate_env::NetworkTransport;

    const LOCALIZER: LocalizerId = LocalizerId::from_u128(0x42);

    /// Reports every target as seen as soon as detection starts.
    struct InstantBackend {
        enabled: bool,
    }

    impl SensorBackend<u32> for InstantBackend {
        fn name(&self) -> &str {
            "instant"
        }

        fn start_detecting(&self, sink: ObservationSink<u32>, targets: &[u32]) {
            if self.enabled {
                for id in targets {
                    sink.seen(*id, Pose::identity());
                }
            }
        }

        fn stop_detecting(&self) {}
    }

    struct Fixture {
        transport: Arc<RecordingTransport>,
        peer: PeerId,
        session: Arc<HandshakeSession<u32>>,
    }

    fn fixture(role: HandshakeRole, sees_marker: bool) -> Fixture {
        let service = Arc::new(CoordinateService::with_defaults(Arc::new(InstantBackend {
            enabled: sees_marker,
        })));
        fixture_on(role, service)
    }

    fn fixture_on(role: HandshakeRole, service: Arc<CoordinateService<u32>>) -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let peer = PeerId::from_seed(7);
        transport.connect_peer(peer);
        let connection = PeerConnection::new(peer, LOCALIZER, transport.clone());
        let session = Arc::new(HandshakeSession::new(
            connection,
            role,
            0,
            service,
            Arc::new(FirstIdAssigner::new(0u32)),
        ));
        Fixture { transport, peer, session }
    }

    /// Session payloads sent to the peer as `(header, field bytes)`.
    fn sent_headers(fixture: &Fixture) -> Vec<String> {
        fixture
            .transport
            .sent_frames(fixture.peer)
            .iter()
            .map(|body| {
                let (command, mut reader) = split_command(body).unwrap();
                assert_eq!(command, LOCALIZATION_DATA);
                assert_eq!(reader.read_uuid().unwrap(), LOCALIZER.0);
                reader.read_string().unwrap()
            })
            .collect()
    }

    fn deliver<F: FnOnce(&mut CommandWriter)>(session: &HandshakeSession<u32>, header: &str, write: F) {
        let mut writer = CommandWriter::new();
        writer.write_str(header);
        write(&mut writer);
        let bytes = writer.into_bytes();
        session.on_data_received(&mut CommandReader::new(&bytes));
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_resolves_after_assignment() {
        let f = fixture(HandshakeRole::Responder, true);
        let task = {
            let session = f.session.clone();
            tokio::spawn(async move { session.localize(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.session.state(), SessionState::AwaitingPeerHandshake);
        deliver(&f.session, COORDINATE_ASSIGNED, |w| w.write_str("0"));

        let coordinate = task.await.unwrap().expect("should resolve");
        assert_eq!(coordinate.id, "0");
        assert_eq!(f.session.state(), SessionState::Resolved);
        assert_eq!(sent_headers(&f), vec![DISCOVERY_REQUEST, COORDINATE_FOUND]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_resends_request_until_assigned() {
        let f = fixture(HandshakeRole::Responder, true);
        let task = {
            let session = f.session.clone();
            tokio::spawn(async move { session.localize(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(sent_headers(&f), vec![DISCOVERY_REQUEST; 3]);

        deliver(&f.session, COORDINATE_ASSIGNED, |w| w.write_str("0"));
        assert!(task.await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_assigns_first_id() {
        let f = fixture(HandshakeRole::Initiator, true);
        let task = {
            let session = f.session.clone();
            tokio::spawn(async move { session.localize(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        deliver(&f.session, DISCOVERY_REQUEST, |w| w.write_i32(0));

        let coordinate = task.await.unwrap().expect("should resolve");
        assert_eq!(coordinate.id, "0");
        assert_eq!(f.session.assigned_id(), Some(0));
        assert_eq!(sent_headers(&f), vec![COORDINATE_ASSIGNED, COORDINATE_FOUND]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_answers_duplicate_request_with_same_id() {
        let f = fixture(HandshakeRole::Initiator, false);
        let task = {
            let session = f.session.clone();
            tokio::spawn(async move { session.localize(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        deliver(&f.session, DISCOVERY_REQUEST, |w| w.write_i32(0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        deliver(&f.session, DISCOVERY_REQUEST, |w| w.write_i32(0));

        assert_eq!(sent_headers(&f), vec![COORDINATE_ASSIGNED, COORDINATE_ASSIGNED]);
        assert_eq!(f.session.state(), SessionState::Discovering);

        f.session.dispose();
        assert!(task.await.unwrap().is_none());
        assert_eq!(f.session.state(), SessionState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_assignment_yields_cancelled() {
        let f = fixture(HandshakeRole::Responder, true);
        let cancel = CancellationToken::new();
        let task = {
            let session = f.session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.localize(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_none());
        assert_eq!(f.session.state(), SessionState::Cancelled);

        // Late assignment is recorded but the session stays terminal
        deliver(&f.session, COORDINATE_ASSIGNED, |w| w.write_str("0"));
        assert!(f.session.localize(&CancellationToken::new()).await.is_none());
        assert_eq!(f.session.state(), SessionState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_found_first_suppresses_own_found() {
        let f = fixture(HandshakeRole::Responder, true);
        deliver(&f.session, COORDINATE_FOUND, |w| w.write_str("0"));
        deliver(&f.session, COORDINATE_ASSIGNED, |w| w.write_str("0"));

        assert!(f.session.localize(&CancellationToken::new()).await.is_some());
        assert_eq!(sent_headers(&f), vec![DISCOVERY_REQUEST]);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_headers_are_dropped() {
        let f = fixture(HandshakeRole::Responder, true);
        deliver(&f.session, "Bogus", |w| w.write_u8(1));
        deliver(&f.session, COORDINATE_ASSIGNED, |w| w.write_str("not-a-number"));
        deliver(&f.session, DISCOVERY_REQUEST, |_| {});
        assert_eq!(f.session.assigned_id(), None);
        assert_eq!(f.session.state(), SessionState::Created);
    }

    #[tokio::test]
    async fn test_send_failure_fails_session() {
        let f = fixture(HandshakeRole::Responder, true);
        f.transport.disconnect(f.peer);
        assert!(f.session.localize(&CancellationToken::new()).await.is_none());
        assert_eq!(f.session.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pose_from_earlier_session_is_not_reused() {
        let service = Arc::new(CoordinateService::with_defaults(Arc::new(InstantBackend { enabled: false })));
        service.apply_observation(0, Some(Pose::identity()));
        let f = fixture_on(HandshakeRole::Responder, service.clone());
        let task = {
            let session = f.session.clone();
            tokio::spawn(async move { session.localize(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        deliver(&f.session, COORDINATE_ASSIGNED, |w| w.write_str("0"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.session.state(), SessionState::Discovering);

        let fresh = Pose { position: nalgebra::Vector3::new(5.0, 0.0, 0.0), ..Pose::identity() };
        service.sink().seen(0, fresh);
        let coordinate = task.await.unwrap().expect("should resolve on the new sighting");
        assert_eq!(coordinate.pose.position.x, 5.0);
    }

    #[test]
    fn test_first_id_assigner_rejects_empty_space() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let assigner = FirstIdAssigner::new(0u32);
        let cancel = CancellationToken::new();
        assert_eq!(runtime.block_on(assigner.assign(3, &cancel)), Some(0));
        assert_eq!(runtime.block_on(assigner.assign(-1, &cancel)), None);
    }
}
