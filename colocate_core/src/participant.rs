//! Per-peer localization state kept by the manager.

use crate::coordinate::{Pose, SpatialCoordinate};
use crate::localizer::LocalizationSession;
use colocate_env::{LocalizerId, PeerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The session currently registered for a peer.
pub(crate) struct ActiveSession {
    pub session: Arc<dyn LocalizationSession>,
    pub localizer_id: LocalizerId,
    /// Distinguishes this attempt from later ones for the same peer
    pub generation: u64,
}

/// One connected peer's localization context.
///
/// Created on connect, dropped on disconnect. The `gate` serializes
/// attempts: an attempt holds it from before its session is created until
/// that session is disposed, so two sessions for one peer never overlap.
pub(crate) struct Participant {
    pub peer: PeerId,
    pub connected_since: Duration,

    /// Coordinate from the last successful local localization
    pub coordinate: Option<SpatialCoordinate>,
    pub localizer_id: Option<LocalizerId>,
    pub last_local_pose: Option<Pose>,

    /// What the peer last reported about its own localization
    pub last_peer_pose: Option<Pose>,
    pub peer_coordinate_id: Option<String>,
    pub peer_coordinate_located: bool,

    pub gate: Arc<tokio::sync::Mutex<()>>,
    /// Cancels the newest attempt, whether it is running or still queued
    pub attempt: Option<CancellationToken>,
    pub active: Option<ActiveSession>,
}

impl Participant {
    pub fn new(peer: PeerId, connected_since: Duration) -> Self {
        Self {
            peer,
            connected_since,
            coordinate: None,
            localizer_id: None,
            last_local_pose: None,
            last_peer_pose: None,
            peer_coordinate_id: None,
            peer_coordinate_located: false,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            attempt: None,
            active: None,
        }
    }

    /// Cancels the running or queued attempt, if any.
    pub fn cancel_attempt(&mut self) -> bool {
        match self.attempt.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// True if a located coordinate is stored.
    pub fn is_located(&self) -> bool {
        self.coordinate.as_ref().map(|c| c.state.is_located()).unwrap_or(false)
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            peer: self.peer,
            connected_since: self.connected_since,
            coordinate: self.coordinate.clone(),
            localizer_id: self.localizer_id,
            last_local_pose: self.last_local_pose,
            last_peer_pose: self.last_peer_pose,
            peer_coordinate_id: self.peer_coordinate_id.clone(),
            peer_coordinate_located: self.peer_coordinate_located,
            has_active_session: self.active.is_some(),
        }
    }
}

/// Read-only view of a participant for pose consumers and UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub peer: PeerId,
    pub connected_since: Duration,
    pub coordinate: Option<SpatialCoordinate>,
    pub localizer_id: Option<LocalizerId>,
    pub last_local_pose: Option<Pose>,
    pub last_peer_pose: Option<Pose>,
    pub peer_coordinate_id: Option<String>,
    pub peer_coordinate_located: bool,
    pub has_active_session: bool,
}

impl ParticipantSnapshot {
    /// Pose of the shared coordinate in this device's frame.
    pub fn resolved_pose(&self) -> Option<Pose> {
        self.coordinate.as_ref().map(|c| c.pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::LocatedState;

    #[test]
    fn test_new_participant_is_unlocated() {
        let participant = Participant::new(PeerId::from_seed(1), Duration::from_secs(3));
        assert!(!participant.is_located());
        let snapshot = participant.snapshot();
        assert_eq!(snapshot.connected_since, Duration::from_secs(3));
        assert!(snapshot.resolved_pose().is_none());
        assert!(!snapshot.has_active_session);
    }

    #[test]
    fn test_cancel_attempt_fires_token_once() {
        let mut participant = Participant::new(PeerId::from_seed(1), Duration::ZERO);
        let token = CancellationToken::new();
        participant.attempt = Some(token.clone());
        assert!(participant.cancel_attempt());
        assert!(token.is_cancelled());
        assert!(!participant.cancel_attempt());
    }

    #[test]
    fn test_snapshot_exposes_resolved_pose() {
        let mut participant = Participant::new(PeerId::from_seed(1), Duration::ZERO);
        participant.coordinate = Some(SpatialCoordinate {
            id: "0".into(),
            pose: Pose::identity(),
            state: LocatedState::Tracking,
        });
        assert!(participant.is_located());
        assert_eq!(participant.snapshot().resolved_pose(), Some(Pose::identity()));
    }
}
