//! # Colocate Core - Shared Coordinate Space Localization
//!
//! Lets two devices that each keep their own local 3D reference frame agree
//! on a shared coordinate, so content placed on one renders in the right
//! place on the other.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────── CoordinateSystemManager ───────────────────────────┐
//!  │  participants: PeerId → Participant        localizers: LocalizerId → Localizer │
//!  │        │                                              │                        │
//!  │        │ one live session per peer                    │ create_session         │
//!  │        ▼                                              ▼                        │
//!  │  HandshakeSession ──── discover(id) ────► CoordinateService<K> ◄── SensorBackend│
//!  │        │  ▲                                                                    │
//!  └────────┼──┼────────────────────────────────────────────────────────────────────┘
//!           ▼  │ LocalizationData{localizer_id, DiscoveryRequest | CoordinateAssigned | CoordinateFound}
//!      CommandChannel  (length-framed named commands over NetworkTransport)
//! ```
//!
//! ## Modules
//!
//! - [`wire`]: frame and payload codec
//! - [`command_channel`]: framing, reassembly and dispatch of named commands
//! - [`coordinate`]: poses, located state and coordinate records
//! - [`coordinate_service`]: generic discovery/tracking engine
//! - [`localizer`]: localization strategies and the handshake session
//! - [`manager`]: the top-level orchestrator

pub mod wire;
pub mod protocol;
pub mod command_channel;
pub mod coordinate;
pub mod coordinate_service;
pub mod localizer;
pub mod participant;
pub mod error;
pub mod manager;

#[cfg(test)]
pub(crate) mod test_support;

pub use wire::{CommandReader, CommandWriter, FrameDecoder, WireError};
pub use command_channel::{CommandChannel, CommandHandler};
pub use coordinate::{Coordinate, CoordinateKey, LocatedState, Pose, SpatialCoordinate};
pub use coordinate_service::{
    CoordinateService, CoordinateServiceConfig, DiscoveryOutcome, Observation, ObservationMark, ObservationSink,
    SensorBackend,
};
pub use localizer::{
    HandshakeRole, LocalizationSession, LocalizationSettings, LocalizerError, PeerConnection, SessionConfig,
    SessionState, SpatialLocalizer,
};
pub use participant::ParticipantSnapshot;
pub use error::LocalizationError;
pub use manager::{CoordinateSystemManager, ManagerConfig, TrackingObserver, TrackingState};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_unpoisoned<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_unpoisoned<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
