//! The coordinate system manager: top-level orchestrator of localization.
//!
//! The manager attaches to one network transport, keeps a [`Participant`]
//! per connected peer, and runs localization sessions against those peers.
//! It is itself a command channel handler: session traffic arrives as
//! `LocalizationData` and is routed by localizer id to the peer's live
//! session.
//!
//! # One session per peer
//!
//! ```text
//!  localize(P) #1 ──► cancel newest attempt ──► gate(P).lock ──► session #1 ──► dispose ──► unlock
//!  localize(P) #2 ──► cancel #1 ─────────────► gate(P).lock (waits for #1 to dispose) ──► session #2
//! ```
//!
//! A new attempt cancels whatever attempt is newest, then queues on the
//! peer's gate. The gate is held from before a session is created until it
//! is disposed, so handshake traffic from two sessions of one peer never
//! interleaves.

use crate::command_channel::{send_command, CommandChannel};
use crate::coordinate::{Pose, SpatialCoordinate};
use crate::error::LocalizationError;
use crate::localizer::{LocalizationSettings, LocalizerError, PeerConnection, SessionConfig, SpatialLocalizer};
use crate::participant::{ActiveSession, Participant, ParticipantSnapshot};
use crate::protocol::{
    COORDINATE_STATE, LOCALIZATION_DATA, LOCALIZE, LOCALIZE_COMPLETE, SUPPORTED_LOCALIZERS,
    SUPPORTED_LOCALIZERS_REQUEST,
};
use crate::wire::{CommandReader, CommandWriter, WireError, DEFAULT_MAX_FRAME_LEN};
use crate::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};
use colocate_env::{ColocateContext, LocalizerId, NetworkTransport, PeerId, TransportEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the coordinate system manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Tuning passed to every session
    pub session: SessionConfig,

    /// How long to wait for the peer's LocalizeComplete (default: 30s)
    pub remote_localization_timeout: Duration,

    /// How long to wait for answers to queries (default: 5s)
    pub query_timeout: Duration,

    /// Largest accepted frame body in bytes (default: 16 MiB)
    pub max_frame_len: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            remote_localization_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ManagerConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ============================================================================
// TRACKING
// ============================================================================

/// Whether the local device is tracking its own reference frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingState {
    Unknown,
    Tracking,
    LostTracking,
}

/// Reports the device's tracking state (the platform's head tracker).
pub trait TrackingObserver: Send + Sync {
    fn tracking_state(&self) -> TrackingState;
}

// ============================================================================
// MANAGER
// ============================================================================

type RemoteKey = (PeerId, LocalizerId);

struct Shared<Ctx: ColocateContext> {
    ctx: Arc<Ctx>,
    config: ManagerConfig,
    channel: CommandChannel,
    localizers: RwLock<HashMap<LocalizerId, Arc<dyn SpatialLocalizer>>>,
    participants: Mutex<HashMap<PeerId, Participant>>,
    transport: RwLock<Option<Arc<dyn NetworkTransport>>>,
    transport_stop: Mutex<Option<CancellationToken>>,
    pending_remote: Mutex<HashMap<RemoteKey, Vec<oneshot::Sender<bool>>>>,
    pending_supported: Mutex<HashMap<PeerId, Vec<oneshot::Sender<Vec<LocalizerId>>>>>,
    tracking_observer: RwLock<Option<Arc<dyn TrackingObserver>>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Tracks connected peers and runs localization against them.
///
/// Cheap to clone; clones share state.
pub struct CoordinateSystemManager<Ctx: ColocateContext> {
    shared: Arc<Shared<Ctx>>,
}

impl<Ctx: ColocateContext> Clone for CoordinateSystemManager<Ctx> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Ctx: ColocateContext> CoordinateSystemManager<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: ManagerConfig) -> Self {
        let shared = Arc::new(Shared {
            ctx,
            channel: CommandChannel::new(config.max_frame_len),
            config,
            localizers: RwLock::new(HashMap::new()),
            participants: Mutex::new(HashMap::new()),
            transport: RwLock::new(None),
            transport_stop: Mutex::new(None),
            pending_remote: Mutex::new(HashMap::new()),
            pending_supported: Mutex::new(HashMap::new()),
            tracking_observer: RwLock::new(None),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        Shared::register_handlers(&shared);
        Self { shared }
    }

    pub fn with_defaults(ctx: Arc<Ctx>) -> Self {
        Self::new(ctx, ManagerConfig::default())
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// The channel the manager's commands are registered on; applications
    /// may register their own commands alongside.
    pub fn command_channel(&self) -> &CommandChannel {
        &self.shared.channel
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    pub fn register_localizer(&self, localizer: Arc<dyn SpatialLocalizer>) -> Result<(), LocalizationError> {
        let id = localizer.id();
        let mut localizers = write_unpoisoned(&self.shared.localizers);
        if localizers.contains_key(&id) {
            return Err(LocalizationError::DuplicateLocalizer(id));
        }
        info!("Registered {} localizer ({})", localizer.name(), id);
        localizers.insert(id, localizer);
        Ok(())
    }

    pub fn unregister_localizer(&self, id: LocalizerId) -> bool {
        write_unpoisoned(&self.shared.localizers).remove(&id).is_some()
    }

    pub fn localizer(&self, id: LocalizerId) -> Option<Arc<dyn SpatialLocalizer>> {
        read_unpoisoned(&self.shared.localizers).get(&id).cloned()
    }

    /// Ids of registered localizers, sorted.
    pub fn localizer_ids(&self) -> Vec<LocalizerId> {
        self.shared.localizer_ids()
    }

    /// Attaches the transport and starts consuming its events.
    ///
    /// Peers the transport already has are registered immediately.
    pub fn register_network_manager(&self, transport: Arc<dyn NetworkTransport>) -> Result<(), LocalizationError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(LocalizationError::ShutDown);
        }
        {
            let mut slot = write_unpoisoned(&self.shared.transport);
            if slot.is_some() {
                return Err(LocalizationError::TransportAlreadyRegistered);
            }
            *slot = Some(Arc::clone(&transport));
        }

        let stop = self.shared.shutdown.child_token();
        if let Some(previous) = lock_unpoisoned(&self.shared.transport_stop).replace(stop.clone()) {
            previous.cancel();
        }
        for peer in transport.connections() {
            self.shared.on_connected(peer);
        }

        let weak = Arc::downgrade(&self.shared);
        self.shared.ctx.spawn("colocate-transport-events", async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    event = transport.next_event() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.handle_event(event);
            }
            debug!("Transport event pump stopped");
        });
        info!("Network transport registered");
        Ok(())
    }

    /// Detaches the transport; every participant is treated as disconnected.
    pub fn unregister_network_manager(&self) -> bool {
        let removed = write_unpoisoned(&self.shared.transport).take();
        if let Some(stop) = lock_unpoisoned(&self.shared.transport_stop).take() {
            stop.cancel();
        }
        if removed.is_none() {
            return false;
        }
        let peers: Vec<PeerId> = lock_unpoisoned(&self.shared.participants).keys().copied().collect();
        for peer in peers {
            self.shared.on_disconnected(peer);
        }
        info!("Network transport unregistered");
        true
    }

    pub fn set_tracking_observer(&self, observer: Option<Arc<dyn TrackingObserver>>) {
        *write_unpoisoned(&self.shared.tracking_observer) = observer;
    }

    // ------------------------------------------------------------------------
    // Localization
    // ------------------------------------------------------------------------

    /// Runs one localization attempt against `peer`.
    ///
    /// Any live or queued attempt for the peer is cancelled and awaited
    /// first. On success the coordinate is stored on the participant and
    /// reported to the peer; on failure the participant keeps its previous
    /// coordinate.
    ///
    /// # Returns
    /// `Ok(true)` if localized, `Ok(false)` if the attempt did not succeed
    /// (cancelled, superseded, discovery failed).
    pub async fn localize(
        &self,
        peer: PeerId,
        localizer_id: LocalizerId,
        settings: LocalizationSettings,
    ) -> Result<bool, LocalizationError> {
        self.localize_with_cancel(peer, localizer_id, settings, &CancellationToken::new())
            .await
    }

    /// [`localize`](Self::localize) with a caller-owned cancellation handle.
    pub async fn localize_with_cancel(
        &self,
        peer: PeerId,
        localizer_id: LocalizerId,
        settings: LocalizationSettings,
        cancel: &CancellationToken,
    ) -> Result<bool, LocalizationError> {
        self.run_attempt(peer, localizer_id, settings, cancel, false).await
    }

    /// Discards the peer's coordinate and the localizer's known coordinates,
    /// then localizes again from a fresh handshake.
    pub async fn reset_localization(
        &self,
        peer: PeerId,
        localizer_id: LocalizerId,
        settings: LocalizationSettings,
    ) -> Result<bool, LocalizationError> {
        self.run_attempt(peer, localizer_id, settings, &CancellationToken::new(), true)
            .await
    }

    /// Asks the peer to run `localizer_id` against us with `settings`.
    ///
    /// # Returns
    /// The peer's reported success; `Ok(false)` if it disconnected or did
    /// not answer within the remote localization timeout.
    pub async fn run_remote_localization(
        &self,
        peer: PeerId,
        localizer_id: LocalizerId,
        settings: &LocalizationSettings,
    ) -> Result<bool, LocalizationError> {
        let localizer = self.shared.localizer(localizer_id)?;
        let transport = self.shared.transport()?;
        self.shared.require_participant(peer)?;

        let mut payload = CommandWriter::new();
        localizer.serialize_settings(settings, &mut payload)?;
        let payload = payload.into_bytes();

        let (tx, rx) = oneshot::channel();
        lock_unpoisoned(&self.shared.pending_remote)
            .entry((peer, localizer_id))
            .or_default()
            .push(tx);

        let sent = send_command(transport.as_ref(), peer, LOCALIZE, |w| {
            w.write_uuid(&localizer_id.0);
            w.write_blob(&payload);
        });
        if let Err(e) = sent {
            drop(rx);
            self.shared.prune_remote((peer, localizer_id));
            return Err(e.into());
        }
        debug!("Asked peer {} to run {}", peer, localizer.name());

        match tokio::time::timeout(self.shared.config.remote_localization_timeout, rx).await {
            Ok(Ok(success)) => Ok(success),
            Ok(Err(_)) => {
                debug!("Peer {} went away before completing remote localization", peer);
                Ok(false)
            }
            Err(_) => {
                warn!("Remote localization with peer {} timed out", peer);
                self.shared.prune_remote((peer, localizer_id));
                Ok(false)
            }
        }
    }

    /// Localizes locally and has the peer localize against us, concurrently.
    ///
    /// # Returns
    /// `Ok(true)` only if both sides succeeded.
    pub async fn localize_with_peer(
        &self,
        peer: PeerId,
        localizer_id: LocalizerId,
        local_settings: LocalizationSettings,
        peer_settings: LocalizationSettings,
    ) -> Result<bool, LocalizationError> {
        let (local, remote) = tokio::join!(
            self.localize(peer, localizer_id, local_settings),
            self.run_remote_localization(peer, localizer_id, &peer_settings),
        );
        Ok(local? && remote?)
    }

    /// Asks the peer which localizers it has registered.
    pub async fn request_supported_localizers(&self, peer: PeerId) -> Result<Vec<LocalizerId>, LocalizationError> {
        let transport = self.shared.transport()?;
        self.shared.require_participant(peer)?;

        let (tx, rx) = oneshot::channel();
        lock_unpoisoned(&self.shared.pending_supported)
            .entry(peer)
            .or_default()
            .push(tx);
        send_command(transport.as_ref(), peer, SUPPORTED_LOCALIZERS_REQUEST, |_| {})?;

        match tokio::time::timeout(self.shared.config.query_timeout, rx).await {
            Ok(Ok(ids)) => Ok(ids),
            Ok(Err(_)) => Err(LocalizationError::PeerNotConnected(peer)),
            Err(_) => {
                if let Some(waiting) = lock_unpoisoned(&self.shared.pending_supported).get_mut(&peer) {
                    waiting.retain(|tx| !tx.is_closed());
                }
                Err(LocalizationError::Timeout(peer))
            }
        }
    }

    /// Cancels the peer's running or queued attempt.
    pub fn cancel_localization(&self, peer: PeerId) -> bool {
        lock_unpoisoned(&self.shared.participants)
            .get_mut(&peer)
            .map(|p| p.cancel_attempt())
            .unwrap_or(false)
    }

    /// Cancels every attempt and detaches the transport. Irreversible.
    pub fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();
        for participant in lock_unpoisoned(&self.shared.participants).values_mut() {
            participant.cancel_attempt();
        }
        self.unregister_network_manager();
        lock_unpoisoned(&self.shared.pending_remote).clear();
        lock_unpoisoned(&self.shared.pending_supported).clear();
        info!("Coordinate system manager shut down");
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn participant(&self, peer: PeerId) -> Option<ParticipantSnapshot> {
        lock_unpoisoned(&self.shared.participants)
            .get(&peer)
            .map(Participant::snapshot)
    }

    pub fn participants(&self) -> Vec<ParticipantSnapshot> {
        let mut snapshots: Vec<_> = lock_unpoisoned(&self.shared.participants)
            .values()
            .map(Participant::snapshot)
            .collect();
        snapshots.sort_by_key(|s| s.peer);
        snapshots
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.participants().into_iter().map(|s| s.peer).collect()
    }

    /// Pose of the shared coordinate for `peer` in this device's frame.
    pub fn resolved_pose(&self, peer: PeerId) -> Option<Pose> {
        lock_unpoisoned(&self.shared.participants)
            .get(&peer)
            .and_then(|p| p.coordinate.as_ref().map(|c| c.pose))
    }

    pub fn has_active_session(&self, peer: PeerId) -> bool {
        lock_unpoisoned(&self.shared.participants)
            .get(&peer)
            .map(|p| p.active.is_some())
            .unwrap_or(false)
    }

    /// True when every participant is locally located and its localizer has
    /// no unresolved coordinates. Vacuously true with no participants.
    pub fn all_local_coordinates_found(&self) -> bool {
        let localizers = read_unpoisoned(&self.shared.localizers);
        let participants = lock_unpoisoned(&self.shared.participants);
        participants.values().all(|p| {
            let service_clear = p
                .localizer_id
                .and_then(|id| localizers.get(&id))
                .map(|l| !l.has_unresolved_coordinates())
                .unwrap_or(true);
            p.is_located() && service_clear
        })
    }

    /// True when every participant reported it located the shared
    /// coordinate. Vacuously true with no participants.
    pub fn all_peer_coordinates_found(&self) -> bool {
        lock_unpoisoned(&self.shared.participants)
            .values()
            .all(|p| p.peer_coordinate_located)
    }

    pub fn tracking_state(&self) -> TrackingState {
        read_unpoisoned(&self.shared.tracking_observer)
            .as_ref()
            .map(|o| o.tracking_state())
            .unwrap_or(TrackingState::Unknown)
    }

    // ------------------------------------------------------------------------
    // Attempt
    // ------------------------------------------------------------------------

    async fn run_attempt(
        &self,
        peer: PeerId,
        localizer_id: LocalizerId,
        settings: LocalizationSettings,
        cancel: &CancellationToken,
        reset: bool,
    ) -> Result<bool, LocalizationError> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(LocalizationError::ShutDown);
        }
        let localizer = shared.localizer(localizer_id)?;
        let transport = shared.transport()?;

        let attempt = cancel.child_token();
        let gate = {
            let mut participants = lock_unpoisoned(&shared.participants);
            let participant = participants
                .get_mut(&peer)
                .ok_or(LocalizationError::PeerNotConnected(peer))?;
            if participant.cancel_attempt() {
                debug!("Superseding localization with peer {}", peer);
            }
            participant.attempt = Some(attempt.clone());
            Arc::clone(&participant.gate)
        };

        let _turn = tokio::select! {
            biased;
            _ = attempt.cancelled() => {
                debug!("Localization with peer {} cancelled before it started", peer);
                return Ok(false);
            }
            turn = Arc::clone(&gate).lock_owned() => turn,
        };
        if attempt.is_cancelled() {
            return Ok(false);
        }

        let connection =
            PeerConnection::new(peer, localizer_id, transport).with_session_config(shared.config.session.clone());
        let session = localizer.create_session(connection, &settings)?;
        let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut participants = lock_unpoisoned(&shared.participants);
            // A reconnected peer has a new participant; this attempt belongs to the old one
            let Some(participant) = participants.get_mut(&peer).filter(|p| Arc::ptr_eq(&p.gate, &gate)) else {
                session.dispose();
                return Ok(false);
            };
            if reset {
                participant.coordinate = None;
                participant.localizer_id = None;
                participant.last_local_pose = None;
                localizer.reset_coordinates();
                debug!("Reset localization state for peer {}", peer);
            }
            participant.active = Some(ActiveSession {
                session: Arc::clone(&session),
                localizer_id,
                generation,
            });
        }

        info!("Starting {} localization with peer {}", localizer.name(), peer);
        let resolved = session.localize(&attempt).await;
        session.dispose();

        let stored = {
            let mut participants = lock_unpoisoned(&shared.participants);
            match participants.get_mut(&peer).filter(|p| Arc::ptr_eq(&p.gate, &gate)) {
                Some(participant) => {
                    if participant.active.as_ref().map(|a| a.generation) == Some(generation) {
                        participant.active = None;
                    }
                    if let Some(coordinate) = &resolved {
                        participant.coordinate = Some(coordinate.clone());
                        participant.localizer_id = Some(localizer_id);
                        participant.last_local_pose = Some(coordinate.pose);
                    }
                    resolved
                }
                None => None,
            }
        };

        match stored {
            Some(coordinate) => {
                shared.send_coordinate_state(peer, localizer_id, &coordinate);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<Ctx: ColocateContext> Shared<Ctx> {
    fn register_handlers(shared: &Arc<Self>) {
        Self::route(shared, LOCALIZATION_DATA, Self::on_localization_data);
        Self::route(shared, LOCALIZE, Self::on_localize);
        Self::route(shared, LOCALIZE_COMPLETE, Self::on_localize_complete);
        Self::route(shared, COORDINATE_STATE, Self::on_coordinate_state);
        Self::route(shared, SUPPORTED_LOCALIZERS_REQUEST, Self::on_supported_localizers_request);
        Self::route(shared, SUPPORTED_LOCALIZERS, Self::on_supported_localizers);
    }

    /// Registers a handler that holds the manager weakly.
    fn route<F>(shared: &Arc<Self>, command: &str, handler: F)
    where
        F: Fn(&Arc<Self>, PeerId, &mut CommandReader<'_>) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(shared);
        shared.channel.register(command, move |peer, reader, _| {
            if let Some(shared) = weak.upgrade() {
                handler(&shared, peer, reader);
            }
        });
    }

    fn localizer(&self, id: LocalizerId) -> Result<Arc<dyn SpatialLocalizer>, LocalizationError> {
        read_unpoisoned(&self.localizers)
            .get(&id)
            .cloned()
            .ok_or(LocalizationError::UnknownLocalizer(id))
    }

    fn localizer_ids(&self) -> Vec<LocalizerId> {
        let mut ids: Vec<_> = read_unpoisoned(&self.localizers).keys().copied().collect();
        ids.sort();
        ids
    }

    fn transport(&self) -> Result<Arc<dyn NetworkTransport>, LocalizationError> {
        read_unpoisoned(&self.transport)
            .clone()
            .ok_or(LocalizationError::NoTransport)
    }

    fn require_participant(&self, peer: PeerId) -> Result<(), LocalizationError> {
        if lock_unpoisoned(&self.participants).contains_key(&peer) {
            Ok(())
        } else {
            Err(LocalizationError::PeerNotConnected(peer))
        }
    }

    fn prune_remote(&self, key: RemoteKey) {
        let mut pending = lock_unpoisoned(&self.pending_remote);
        if let Some(waiting) = pending.get_mut(&key) {
            waiting.retain(|tx| !tx.is_closed());
            if waiting.is_empty() {
                pending.remove(&key);
            }
        }
    }

    fn send(&self, peer: PeerId, command: &str, write: impl FnOnce(&mut CommandWriter)) {
        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Cannot send {} to peer {}: {}", command, peer, e);
                return;
            }
        };
        if let Err(e) = send_command(transport.as_ref(), peer, command, write) {
            warn!("Failed to send {} to peer {}: {}", command, peer, e);
        }
    }

    fn send_coordinate_state(&self, peer: PeerId, localizer_id: LocalizerId, coordinate: &SpatialCoordinate) {
        self.send(peer, COORDINATE_STATE, |w| {
            w.write_uuid(&localizer_id.0);
            w.write_bool(coordinate.state.is_located());
            w.write_str(&coordinate.id);
            coordinate.pose.write_to(w);
        });
    }

    fn send_localize_complete(&self, peer: PeerId, localizer_id: LocalizerId, success: bool) {
        self.send(peer, LOCALIZE_COMPLETE, |w| {
            w.write_uuid(&localizer_id.0);
            w.write_bool(success);
        });
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(peer) => self.on_connected(peer),
            TransportEvent::Disconnected(peer) => self.on_disconnected(peer),
            TransportEvent::Received { peer, bytes } => {
                self.channel.receive(peer, &bytes);
            }
        }
    }

    fn on_connected(&self, peer: PeerId) {
        let mut participants = lock_unpoisoned(&self.participants);
        if participants.contains_key(&peer) {
            return;
        }
        participants.insert(peer, Participant::new(peer, self.ctx.now()));
        info!("Peer {} connected", peer);
    }

    fn on_disconnected(&self, peer: PeerId) {
        let removed = lock_unpoisoned(&self.participants).remove(&peer);
        if let Some(mut participant) = removed {
            participant.cancel_attempt();
            if let Some(active) = participant.active.take() {
                active.session.dispose();
            }
            info!("Peer {} disconnected", peer);
        }
        self.channel.disconnect(peer);
        // Dropping the senders completes the waiters with "not localized"
        lock_unpoisoned(&self.pending_remote).retain(|(p, _), _| *p != peer);
        lock_unpoisoned(&self.pending_supported).remove(&peer);
    }

    // ------------------------------------------------------------------------
    // Command handlers
    // ------------------------------------------------------------------------

    fn on_localization_data(self: &Arc<Self>, peer: PeerId, reader: &mut CommandReader<'_>) {
        let localizer_id = match reader.read_uuid() {
            Ok(id) => LocalizerId(id),
            Err(e) => {
                warn!("Malformed LocalizationData from peer {}: {}", peer, e);
                return;
            }
        };
        let session = {
            let participants = lock_unpoisoned(&self.participants);
            participants
                .get(&peer)
                .and_then(|p| p.active.as_ref())
                .filter(|a| a.localizer_id == localizer_id)
                .map(|a| Arc::clone(&a.session))
        };
        match session {
            Some(session) => session.on_data_received(reader),
            None => warn!(
                "No live {} session for peer {}; LocalizationData dropped",
                localizer_id, peer
            ),
        }
    }

    fn on_localize(self: &Arc<Self>, peer: PeerId, reader: &mut CommandReader<'_>) {
        let localizer_id = match reader.read_uuid() {
            Ok(id) => LocalizerId(id),
            Err(e) => {
                warn!("Malformed Localize from peer {}: {}", peer, e);
                return;
            }
        };
        let settings = self.localizer(localizer_id).and_then(|localizer| {
            let blob = reader.read_blob().map_err(LocalizerError::from)?;
            Ok(localizer.deserialize_settings(&mut CommandReader::new(blob))?)
        });
        let settings = match settings {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Rejecting Localize from peer {}: {}", peer, e);
                self.send_localize_complete(peer, localizer_id, false);
                return;
            }
        };

        let manager = CoordinateSystemManager {
            shared: Arc::clone(self),
        };
        self.ctx.spawn("colocate-remote-localize", async move {
            let success = match manager.localize(peer, localizer_id, settings).await {
                Ok(success) => success,
                Err(e) => {
                    warn!("Localization requested by peer {} failed: {}", peer, e);
                    false
                }
            };
            manager.shared.send_localize_complete(peer, localizer_id, success);
        });
    }

    fn on_localize_complete(self: &Arc<Self>, peer: PeerId, reader: &mut CommandReader<'_>) {
        let (localizer_id, success) = match read_localize_complete(reader) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Malformed LocalizeComplete from peer {}: {}", peer, e);
                return;
            }
        };
        let key = (peer, localizer_id);
        let waiter = {
            let mut pending = lock_unpoisoned(&self.pending_remote);
            let waiter = match pending.get_mut(&key) {
                Some(waiting) if !waiting.is_empty() => Some(waiting.remove(0)),
                _ => None,
            };
            if pending.get(&key).map_or(false, Vec::is_empty) {
                pending.remove(&key);
            }
            waiter
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(success);
            }
            None => warn!("Unexpected LocalizeComplete from peer {}; dropped", peer),
        }
    }

    fn on_coordinate_state(self: &Arc<Self>, peer: PeerId, reader: &mut CommandReader<'_>) {
        let (localizer_id, located, coordinate_id, pose) = match read_coordinate_state(reader) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Malformed CoordinateState from peer {}: {}", peer, e);
                return;
            }
        };

        let mut participants = lock_unpoisoned(&self.participants);
        let Some(participant) = participants.get_mut(&peer) else {
            warn!("CoordinateState from unknown peer {}; dropped", peer);
            return;
        };
        let current = participant
            .active
            .as_ref()
            .map(|a| a.localizer_id)
            .or(participant.localizer_id);
        if let Some(current) = current.filter(|id| *id != localizer_id) {
            warn!(
                "CoordinateState for {} from peer {} while localizing with {}; dropped",
                localizer_id, peer, current
            );
            return;
        }
        participant.peer_coordinate_located = located;
        participant.peer_coordinate_id = Some(coordinate_id);
        if located {
            participant.last_peer_pose = Some(pose);
        }
        debug!(
            "Peer {} reports {} coordinate located={}",
            peer, localizer_id, located
        );
    }

    fn on_supported_localizers_request(self: &Arc<Self>, peer: PeerId, _reader: &mut CommandReader<'_>) {
        let ids = self.localizer_ids();
        self.send(peer, SUPPORTED_LOCALIZERS, |w| {
            w.write_u32(ids.len() as u32);
            for id in &ids {
                w.write_uuid(&id.0);
            }
        });
    }

    fn on_supported_localizers(self: &Arc<Self>, peer: PeerId, reader: &mut CommandReader<'_>) {
        let ids = match read_localizer_ids(reader) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Malformed SupportedLocalizers from peer {}: {}", peer, e);
                return;
            }
        };
        let waiting = lock_unpoisoned(&self.pending_supported).remove(&peer);
        match waiting {
            Some(waiting) => {
                for tx in waiting {
                    let _ = tx.send(ids.clone());
                }
            }
            None => warn!("Unexpected SupportedLocalizers from peer {}; dropped", peer),
        }
    }
}

fn read_localize_complete(reader: &mut CommandReader<'_>) -> Result<(LocalizerId, bool), WireError> {
    let localizer_id = LocalizerId(reader.read_uuid()?);
    let success = reader.read_bool()?;
    Ok((localizer_id, success))
}

fn read_coordinate_state(reader: &mut CommandReader<'_>) -> Result<(LocalizerId, bool, String, Pose), WireError> {
    let localizer_id = LocalizerId(reader.read_uuid()?);
    let located = reader.read_bool()?;
    let coordinate_id = reader.read_string()?;
    let pose = Pose::read_from(reader)?;
    Ok((localizer_id, located, coordinate_id, pose))
}

fn read_localizer_ids(reader: &mut CommandReader<'_>) -> Result<Vec<LocalizerId>, WireError> {
    let count = reader.read_u32()? as usize;
    // 16 bytes per id; reject counts the payload cannot hold
    if count > reader.remaining() / 16 {
        return Err(WireError::InvalidValue(format!("{} localizer ids", count)));
    }
    (0..count).map(|_| Ok(LocalizerId(reader.read_uuid()?))).collect()
}
