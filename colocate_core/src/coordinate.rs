//! Coordinates: named poses produced by a sensing algorithm.

use crate::wire::{CommandReader, CommandWriter, WireError};
use nalgebra::{Isometry3, Point3, Quaternion, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

/// Requirements on an algorithm-defined coordinate identifier.
///
/// Ids travel on the wire as strings, so they must round-trip through
/// `Display` / `FromStr`.
pub trait CoordinateKey:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
}

impl<T> CoordinateKey for T where
    T: Clone + Eq + Hash + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
}

/// How much is known about a coordinate's pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocatedState {
    /// Id known, pose never obtained
    Unresolved,
    /// Pose known, not currently observed
    Resolved,
    /// Pose known and observed this tick
    Tracking,
}

impl LocatedState {
    /// True for `Resolved` and `Tracking`.
    pub fn is_located(&self) -> bool {
        !matches!(self, LocatedState::Unresolved)
    }
}

impl fmt::Display for LocatedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LocatedState::Unresolved => "unresolved",
            LocatedState::Resolved => "resolved",
            LocatedState::Tracking => "tracking",
        };
        f.write_str(name)
    }
}

/// Rigid transform in a device's local (world) frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// World position in meters
    pub position: Vector3<f64>,

    /// World rotation
    pub rotation: UnitQuaternion<f64>,
}

impl Pose {
    pub fn new(position: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    /// Pose from a position and Euler angles in degrees (roll, pitch, yaw
    /// about x, y, z).
    pub fn from_euler_degrees(position: Vector3<f64>, x: f64, y: f64, z: f64) -> Self {
        let rotation = UnitQuaternion::from_euler_angles(x.to_radians(), y.to_radians(), z.to_radians());
        Self::new(position, rotation)
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.rotation)
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self::new(iso.translation.vector, iso.rotation)
    }

    /// Maps a point from this pose's local frame into the world frame.
    pub fn transform_point(&self, local: &Point3<f64>) -> Point3<f64> {
        self.to_isometry().transform_point(local)
    }

    /// Transform taking world coordinates into this pose's frame.
    pub fn inverse(&self) -> Pose {
        Self::from_isometry(&self.to_isometry().inverse())
    }

    /// `self * other`
    pub fn compose(&self, other: &Pose) -> Pose {
        Self::from_isometry(&(self.to_isometry() * other.to_isometry()))
    }

    pub fn write_to(&self, writer: &mut CommandWriter) {
        writer.write_f64(self.position.x);
        writer.write_f64(self.position.y);
        writer.write_f64(self.position.z);
        let q = self.rotation.quaternion();
        writer.write_f64(q.i);
        writer.write_f64(q.j);
        writer.write_f64(q.k);
        writer.write_f64(q.w);
    }

    pub fn read_from(reader: &mut CommandReader<'_>) -> Result<Self, WireError> {
        let mut values = [0.0f64; 7];
        for value in values.iter_mut() {
            *value = reader.read_f64()?;
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(WireError::InvalidValue("non-finite pose component".to_string()));
        }
        let [x, y, z, i, j, k, w] = values;
        let quaternion = Quaternion::new(w, i, j, k);
        if quaternion.norm() < 1e-9 {
            return Err(WireError::InvalidValue("zero-length rotation".to_string()));
        }
        Ok(Self::new(
            Vector3::new(x, y, z),
            UnitQuaternion::from_quaternion(quaternion),
        ))
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// A coordinate tracked by a coordinate service.
#[derive(Debug, Clone, PartialEq)]
pub struct Coordinate<K> {
    pub id: K,
    pub pose: Pose,
    pub state: LocatedState,
}

impl<K: CoordinateKey> Coordinate<K> {
    /// A coordinate whose id is known but whose pose is not.
    pub fn unresolved(id: K) -> Self {
        Self {
            id,
            pose: Pose::identity(),
            state: LocatedState::Unresolved,
        }
    }

    pub fn tracking(id: K, pose: Pose) -> Self {
        Self {
            id,
            pose,
            state: LocatedState::Tracking,
        }
    }

    pub fn is_located(&self) -> bool {
        self.state.is_located()
    }

    /// Type-erased copy for consumers that don't know the key type.
    pub fn to_spatial(&self) -> SpatialCoordinate {
        SpatialCoordinate {
            id: self.id.to_string(),
            pose: self.pose,
            state: self.state,
        }
    }
}

/// A coordinate with its id rendered to its wire (string) form.
///
/// This is what sessions resolve to and what participants store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialCoordinate {
    pub id: String,
    pub pose: Pose,
    pub state: LocatedState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_located_state() {
        assert!(!LocatedState::Unresolved.is_located());
        assert!(LocatedState::Resolved.is_located());
        assert!(LocatedState::Tracking.is_located());
    }

    #[test]
    fn test_pose_wire_form_preserves_values() {
        let pose = Pose::from_euler_degrees(Vector3::new(1.0, -2.0, 0.5), 0.0, 180.0, 0.0);
        let mut writer = CommandWriter::new();
        pose.write_to(&mut writer);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 56);

        let decoded = Pose::read_from(&mut CommandReader::new(&bytes)).unwrap();
        assert_relative_eq!(decoded.position, pose.position, epsilon = 1e-12);
        assert_relative_eq!(decoded.rotation.angle_to(&pose.rotation), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pose_rejects_zero_rotation() {
        let mut writer = CommandWriter::new();
        for _ in 0..7 {
            writer.write_f64(0.0);
        }
        let bytes = writer.into_bytes();
        assert!(Pose::read_from(&mut CommandReader::new(&bytes)).is_err());
    }

    #[test]
    fn test_pose_inverse_compose_is_identity() {
        let pose = Pose::from_euler_degrees(Vector3::new(3.0, 1.0, -4.0), 10.0, 20.0, 30.0);
        let round = pose.compose(&pose.inverse());
        assert_relative_eq!(round.position, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(round.rotation.angle(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_coordinate_to_spatial_uses_display_form() {
        let coordinate = Coordinate::tracking(7u32, Pose::identity());
        let spatial = coordinate.to_spatial();
        assert_eq!(spatial.id, "7");
        assert_eq!(spatial.state, LocatedState::Tracking);
    }
}
