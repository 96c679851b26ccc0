//! The generic coordinate discovery/tracking engine.
//!
//! A [`CoordinateService`] owns the `known coordinates` map for one
//! localization algorithm. Sensor backends never touch the map directly: they
//! push [`Observation`]s into an [`ObservationSink`], and whichever task is
//! reading the service (a discovery loop or a lookup) drains the queue and
//! applies it under the map lock. The lock is only held for map mutation and
//! never across an await.
//!
//! # Located state transitions
//!
//! ```text
//!              seen                     lost / absent from snapshot
//! (absent) ──────────► Tracking ◄────────────────────────► Resolved
//!    │                    ▲                 seen
//!    │ requested          │ seen (first pose => new-coordinate notification)
//!    └──────► Unresolved ─┘
//! ```
//!
//! Located entries are demoted, never removed; only
//! [`CoordinateService::reset`] forgets them. An `Unresolved` placeholder
//! lives only while some discovery is waiting for its id.
//!
//! # Freshness
//!
//! Every sighting gets a sequence number. A discovery only accepts sightings
//! made at or after its [`ObservationMark`], so a pose left behind by an
//! earlier session never satisfies a later one.

use crate::coordinate::{Coordinate, CoordinateKey, LocatedState, Pose};
use crate::lock_unpoisoned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the new-coordinate broadcast channel.
const NEW_COORDINATE_CAPACITY: usize = 64;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for a CoordinateService.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinateServiceConfig {
    /// How often a targeted discovery re-checks its ids (default: 1s)
    pub poll_interval: Duration,
}

impl Default for CoordinateServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// SENSOR SIDE
// ============================================================================

/// One sensor update.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation<K> {
    /// The coordinate was observed at a pose this tick
    Seen { id: K, pose: Pose },

    /// The coordinate is no longer observed
    Lost { id: K },

    /// Everything currently observed; known ids missing from it are lost
    Snapshot(Vec<(K, Pose)>),
}

/// Handle a sensor backend uses to report observations.
///
/// Cheap to clone. Sends never block; they return `false` once the owning
/// service is gone.
pub struct ObservationSink<K> {
    tx: mpsc::UnboundedSender<Observation<K>>,
    wakeup: Arc<Notify>,
}

impl<K> Clone for ObservationSink<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            wakeup: Arc::clone(&self.wakeup),
        }
    }
}

impl<K: CoordinateKey> ObservationSink<K> {
    pub fn send(&self, observation: Observation<K>) -> bool {
        let delivered = self.tx.send(observation).is_ok();
        if delivered {
            self.wakeup.notify_waiters();
        }
        delivered
    }

    pub fn seen(&self, id: K, pose: Pose) -> bool {
        self.send(Observation::Seen { id, pose })
    }

    pub fn lost(&self, id: K) -> bool {
        self.send(Observation::Lost { id })
    }

    pub fn snapshot(&self, observed: Vec<(K, Pose)>) -> bool {
        self.send(Observation::Snapshot(observed))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A device-specific sensing algorithm (marker tracker, QR watcher, anchor
/// SDK, simulation).
///
/// `start_detecting` and `stop_detecting` are always paired: the service
/// calls `stop_detecting` on every exit path of the discovery that started
/// detection, including cancellation.
pub trait SensorBackend<K: CoordinateKey>: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// False when the backing hardware or service is missing on this platform.
    fn is_available(&self) -> bool {
        true
    }

    /// Begins producing observations into `sink`.
    ///
    /// `targets` lists the ids the first discovery asked for (empty for an
    /// open-ended scan); backends may use it to narrow their search.
    fn start_detecting(&self, sink: ObservationSink<K>, targets: &[K]);

    /// Stops producing observations.
    fn stop_detecting(&self);
}

// ============================================================================
// SERVICE
// ============================================================================

/// Result of a discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Every requested id reached a located state
    Located,

    /// The cancellation handle fired first
    Cancelled,

    /// The sensor backend is not available on this platform
    Unavailable,
}

impl DiscoveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DiscoveryOutcome::Located)
    }
}

/// Point in the sighting sequence; see [`CoordinateService::observation_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObservationMark(u64);

/// The known map plus the bookkeeping discoveries need.
struct Known<K: CoordinateKey> {
    coordinates: HashMap<K, Coordinate<K>>,
    /// Sequence number of each id's latest sighting
    sightings: HashMap<K, u64>,
    next_sighting: u64,
    /// Discoveries currently waiting on each id
    waiting: HashMap<K, usize>,
}

impl<K: CoordinateKey> Known<K> {
    fn new() -> Self {
        Self {
            coordinates: HashMap::new(),
            sightings: HashMap::new(),
            next_sighting: 0,
            waiting: HashMap::new(),
        }
    }

    fn seen_since(&self, id: &K, mark: ObservationMark) -> bool {
        self.sightings.get(id).map_or(false, |seq| *seq >= mark.0)
            && self.coordinates.get(id).map_or(false, |c| c.is_located())
    }
}

/// Tracks known coordinates for one algorithm and runs discovery.
pub struct CoordinateService<K: CoordinateKey> {
    config: CoordinateServiceConfig,
    backend: Arc<dyn SensorBackend<K>>,
    known: Mutex<Known<K>>,
    pending: Mutex<mpsc::UnboundedReceiver<Observation<K>>>,
    sink: ObservationSink<K>,
    new_coordinates: broadcast::Sender<Coordinate<K>>,
    active_discoveries: Mutex<usize>,
}

impl<K: CoordinateKey> CoordinateService<K> {
    pub fn new(backend: Arc<dyn SensorBackend<K>>, config: CoordinateServiceConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (new_coordinates, _) = broadcast::channel(NEW_COORDINATE_CAPACITY);
        Self {
            config,
            backend,
            known: Mutex::new(Known::new()),
            pending: Mutex::new(rx),
            sink: ObservationSink {
                tx,
                wakeup: Arc::new(Notify::new()),
            },
            new_coordinates,
            active_discoveries: Mutex::new(0),
        }
    }

    pub fn with_defaults(backend: Arc<dyn SensorBackend<K>>) -> Self {
        Self::new(backend, CoordinateServiceConfig::default())
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// A sink feeding this service, for backends that report outside of
    /// discovery.
    pub fn sink(&self) -> ObservationSink<K> {
        self.sink.clone()
    }

    /// Receives every coordinate the first time a pose is obtained for it.
    pub fn subscribe_new_coordinates(&self) -> broadcast::Receiver<Coordinate<K>> {
        self.new_coordinates.subscribe()
    }

    /// Non-blocking lookup.
    pub fn try_get_known_coordinate(&self, id: &K) -> Option<Coordinate<K>> {
        self.drain_observations();
        lock_unpoisoned(&self.known).coordinates.get(id).cloned()
    }

    /// Lookup by the id's wire (string) form.
    pub fn try_get_by_wire_id(&self, id: &str) -> Option<Coordinate<K>> {
        let key = id.parse::<K>().ok()?;
        self.try_get_known_coordinate(&key)
    }

    /// Snapshot of every known coordinate.
    pub fn known_coordinates(&self) -> Vec<Coordinate<K>> {
        self.drain_observations();
        lock_unpoisoned(&self.known).coordinates.values().cloned().collect()
    }

    /// True if a discovery is waiting on an id that has never had a pose.
    pub fn has_unresolved(&self) -> bool {
        self.drain_observations();
        lock_unpoisoned(&self.known)
            .coordinates
            .values()
            .any(|c| !c.is_located())
    }

    /// Marks the current point in the sighting sequence.
    ///
    /// Queued observations are applied first, so they count as older than
    /// the mark.
    pub fn observation_mark(&self) -> ObservationMark {
        self.drain_observations();
        ObservationMark(lock_unpoisoned(&self.known).next_sighting)
    }

    /// Applies one sensor update directly.
    ///
    /// `Some(pose)` inserts or updates the entry as `Tracking`; `None`
    /// demotes an existing entry to `Resolved` keeping its last pose.
    pub fn apply_observation(&self, id: K, pose: Option<Pose>) {
        self.drain_observations();
        let observation = match pose {
            Some(pose) => Observation::Seen { id, pose },
            None => Observation::Lost { id },
        };
        let announced = {
            let mut known = lock_unpoisoned(&self.known);
            apply(&mut known, observation)
        };
        self.announce(announced);
    }

    /// Forgets every known coordinate and any queued observations.
    pub fn reset(&self) {
        let mut pending = lock_unpoisoned(&self.pending);
        while pending.try_recv().is_ok() {}
        let mut known = lock_unpoisoned(&self.known);
        known.coordinates.clear();
        known.sightings.clear();
        // Running discoveries keep their placeholders
        let waiting: Vec<K> = known.waiting.keys().cloned().collect();
        for id in waiting {
            known.coordinates.insert(id.clone(), Coordinate::unresolved(id));
        }
        drop(known);
        debug!("{}: known coordinates cleared", self.backend.name());
    }

    /// Runs the sensing algorithm until the requested ids are located or
    /// `cancel` fires.
    ///
    /// With no `ids`, scans until cancelled (open-ended discovery); the
    /// outcome is then `Cancelled` and callers inspect the known coordinates.
    /// With ids, every id must be sighted after this call starts. Ids that
    /// are never observed keep the call pending until cancellation.
    pub async fn discover_coordinates(&self, cancel: &CancellationToken, ids: &[K]) -> DiscoveryOutcome {
        let mark = self.observation_mark();
        self.discover_coordinates_since(cancel, ids, mark).await
    }

    /// Like [`discover_coordinates`](Self::discover_coordinates), accepting
    /// any sighting made at or after `mark`.
    pub async fn discover_coordinates_since(
        &self,
        cancel: &CancellationToken,
        ids: &[K],
        mark: ObservationMark,
    ) -> DiscoveryOutcome {
        if !self.backend.is_available() {
            warn!("{}: sensor backend unavailable on this platform", self.backend.name());
            return DiscoveryOutcome::Unavailable;
        }
        if cancel.is_cancelled() {
            return DiscoveryOutcome::Cancelled;
        }

        let _waiting = self.wait_for(ids);
        let _sensing = self.begin_sensing(ids);
        debug!("{}: discovering {:?}", self.backend.name(), ids);

        loop {
            let notified = self.sink.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.drain_observations();
            if !ids.is_empty() && self.all_seen_since(ids, mark) {
                debug!("{}: located {:?}", self.backend.name(), ids);
                return DiscoveryOutcome::Located;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("{}: discovery cancelled", self.backend.name());
                    return DiscoveryOutcome::Cancelled;
                }
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.poll_interval), if !ids.is_empty() => {}
            }
        }
    }

    /// Number of discoveries currently holding the sensor.
    pub fn active_discoveries(&self) -> usize {
        *lock_unpoisoned(&self.active_discoveries)
    }

    fn all_seen_since(&self, ids: &[K], mark: ObservationMark) -> bool {
        let known = lock_unpoisoned(&self.known);
        ids.iter().all(|id| known.seen_since(id, mark))
    }

    fn wait_for<'a>(&'a self, ids: &'a [K]) -> WaitingGuard<'a, K> {
        let mut known = lock_unpoisoned(&self.known);
        for id in ids {
            *known.waiting.entry(id.clone()).or_default() += 1;
            known
                .coordinates
                .entry(id.clone())
                .or_insert_with(|| Coordinate::unresolved(id.clone()));
        }
        WaitingGuard { service: self, ids }
    }

    fn drain_observations(&self) {
        let mut announced = Vec::new();
        {
            let mut pending = lock_unpoisoned(&self.pending);
            let mut queued = Vec::new();
            while let Ok(observation) = pending.try_recv() {
                queued.push(observation);
            }
            if queued.is_empty() {
                return;
            }
            let mut known = lock_unpoisoned(&self.known);
            for observation in queued {
                announced.extend(apply(&mut known, observation));
            }
        }
        self.announce(announced);
    }

    fn announce(&self, coordinates: Vec<Coordinate<K>>) {
        for coordinate in coordinates {
            debug!("{}: new coordinate {}", self.backend.name(), coordinate.id);
            // No subscribers is fine
            let _ = self.new_coordinates.send(coordinate);
        }
    }

    fn begin_sensing(&self, targets: &[K]) -> SensingGuard<'_, K> {
        let mut active = lock_unpoisoned(&self.active_discoveries);
        if *active == 0 {
            debug!("{}: starting detection", self.backend.name());
            self.backend.start_detecting(self.sink.clone(), targets);
        }
        *active += 1;
        SensingGuard { service: self }
    }
}

/// Holds one discovery's claim on its ids; the last claim on a never-located
/// id drops its placeholder.
struct WaitingGuard<'a, K: CoordinateKey> {
    service: &'a CoordinateService<K>,
    ids: &'a [K],
}

impl<K: CoordinateKey> Drop for WaitingGuard<'_, K> {
    fn drop(&mut self) {
        let mut known = lock_unpoisoned(&self.service.known);
        for id in self.ids {
            let remaining = match known.waiting.get_mut(id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => continue,
            };
            if remaining > 0 {
                continue;
            }
            known.waiting.remove(id);
            if known.coordinates.get(id).map_or(false, |c| !c.is_located()) {
                known.coordinates.remove(id);
                debug!("{}: dropped placeholder {}", self.service.backend.name(), id);
            }
        }
    }
}

/// Keeps the sensor subscription alive for one discovery.
struct SensingGuard<'a, K: CoordinateKey> {
    service: &'a CoordinateService<K>,
}

impl<K: CoordinateKey> Drop for SensingGuard<'_, K> {
    fn drop(&mut self) {
        let mut active = lock_unpoisoned(&self.service.active_discoveries);
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.service.backend.stop_detecting();
            debug!("{}: stopped detection", self.service.backend.name());
        }
    }
}

/// Applies one observation; returns coordinates that got their first pose.
fn apply<K: CoordinateKey>(known: &mut Known<K>, observation: Observation<K>) -> Vec<Coordinate<K>> {
    let mut announced = Vec::new();
    match observation {
        Observation::Seen { id, pose } => {
            announced.extend(mark_seen(known, id, pose));
        }
        Observation::Lost { id } => {
            mark_lost(known, &id);
        }
        Observation::Snapshot(observed) => {
            let mut seen = HashSet::with_capacity(observed.len());
            for (id, pose) in observed {
                seen.insert(id.clone());
                announced.extend(mark_seen(known, id, pose));
            }
            let missing: Vec<K> = known
                .coordinates
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            for id in missing {
                mark_lost(known, &id);
            }
        }
    }
    announced
}

fn mark_seen<K: CoordinateKey>(known: &mut Known<K>, id: K, pose: Pose) -> Option<Coordinate<K>> {
    let sequence = known.next_sighting;
    known.next_sighting += 1;
    known.sightings.insert(id.clone(), sequence);
    let entry = known
        .coordinates
        .entry(id.clone())
        .or_insert_with(|| Coordinate::unresolved(id));
    let first_pose = !entry.is_located();
    entry.pose = pose;
    entry.state = LocatedState::Tracking;
    first_pose.then(|| entry.clone())
}

fn mark_lost<K: CoordinateKey>(known: &mut Known<K>, id: &K) {
    if let Some(entry) = known.coordinates.get_mut(id) {
        if entry.state == LocatedState::Tracking {
            entry.state = LocatedState::Resolved;
        }
    }
}
