//! Manager-level error types.

use crate::localizer::LocalizerError;
use colocate_env::{EnvError, LocalizerId, PeerId};
use thiserror::Error;

/// Errors from coordinate system manager operations.
///
/// These are caller mistakes or missing collaborators. An attempt that
/// simply did not localize (cancelled, superseded, discovery failed) is
/// reported as `Ok(false)` instead.
#[derive(Debug, Error)]
pub enum LocalizationError {
    #[error("Peer {0} is not connected")]
    PeerNotConnected(PeerId),

    #[error("Localizer {0} is not registered")]
    UnknownLocalizer(LocalizerId),

    #[error("Localizer {0} is already registered")]
    DuplicateLocalizer(LocalizerId),

    #[error("A network transport is already registered")]
    TransportAlreadyRegistered,

    #[error("No network transport registered")]
    NoTransport,

    #[error("Peer {0} did not answer in time")]
    Timeout(PeerId),

    #[error("Coordinate system manager is shut down")]
    ShutDown,

    #[error(transparent)]
    Localizer(#[from] LocalizerError),

    #[error(transparent)]
    Network(#[from] EnvError),
}
