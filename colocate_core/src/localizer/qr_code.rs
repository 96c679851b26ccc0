//! QR codes as markers.
//!
//! A platform QR watcher reports codes by its own native id. Codes whose
//! text is `sv<N>` stand for marker `N`; everything else is ignored. The
//! watcher reports the code's top-left corner, so the marker pose is moved
//! to the code's center and flipped about its normal so +y points up the
//! printed marker.

use crate::coordinate::Pose;
use crate::coordinate_service::{ObservationSink, SensorBackend};
use crate::localizer::marker::MarkerId;
use crate::lock_unpoisoned;
use nalgebra::{UnitQuaternion, Vector3};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Text prefix of codes that encode a marker id.
const MARKER_CODE_PREFIX: &str = "sv";

/// One detected QR code.
#[derive(Debug, Clone, PartialEq)]
pub struct QrCode {
    /// Watcher-assigned id, stable while the code stays known
    pub id: Uuid,

    /// Decoded text
    pub data: String,

    /// Edge length in meters
    pub physical_size: f64,

    /// Pose of the code's corner in world space
    pub pose: Pose,
}

/// Change reported by a [`QrCodeWatcher`].
#[derive(Debug, Clone, PartialEq)]
pub enum QrCodeEvent {
    Added(QrCode),
    Updated(QrCode),
    Removed(QrCode),
}

/// Receives watcher events. Must not block.
pub type QrCodeCallback = Arc<dyn Fn(QrCodeEvent) + Send + Sync>;

/// Platform QR code tracking.
pub trait QrCodeWatcher: Send + Sync + 'static {
    fn is_supported(&self) -> bool {
        true
    }

    fn start(&self, on_event: QrCodeCallback);

    fn stop(&self);
}

/// Parses `sv<N>` into a marker id.
pub fn marker_id_from_code(data: &str) -> Option<MarkerId> {
    data.strip_prefix(MARKER_CODE_PREFIX)?.parse::<u32>().ok().map(MarkerId)
}

/// Marker pose for a code: its center, rotated 180° about its normal.
pub fn marker_pose(code: &QrCode) -> Pose {
    let rotation = code.pose.rotation * UnitQuaternion::from_axis_angle(&Vector3::z_axis(), PI);
    let offset = -code.physical_size / 2.0;
    let position = code.pose.position + rotation * Vector3::new(offset, offset, 0.0);
    Pose::new(position, rotation)
}

/// Adapts a [`QrCodeWatcher`] into a marker [`SensorBackend`].
pub struct QrCodeMarkerDetector {
    watcher: Arc<dyn QrCodeWatcher>,
    /// Marker id per native code id, so removals can be mapped back
    markers: Arc<Mutex<HashMap<Uuid, MarkerId>>>,
}

impl QrCodeMarkerDetector {
    pub fn new(watcher: Arc<dyn QrCodeWatcher>) -> Self {
        Self {
            watcher,
            markers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl SensorBackend<MarkerId> for QrCodeMarkerDetector {
    fn name(&self) -> &str {
        "qr-code"
    }

    fn is_available(&self) -> bool {
        self.watcher.is_supported()
    }

    fn start_detecting(&self, sink: ObservationSink<MarkerId>, _targets: &[MarkerId]) {
        let markers = Arc::clone(&self.markers);
        self.watcher.start(Arc::new(move |event| match event {
            QrCodeEvent::Added(code) | QrCodeEvent::Updated(code) => {
                let Some(marker) = marker_id_from_code(&code.data) else {
                    debug!("Ignoring QR code '{}'", code.data);
                    return;
                };
                lock_unpoisoned(&markers).insert(code.id, marker);
                sink.seen(marker, marker_pose(&code));
            }
            QrCodeEvent::Removed(code) => {
                let removed = lock_unpoisoned(&markers).remove(&code.id);
                if let Some(marker) = removed {
                    sink.lost(marker);
                }
            }
        }));
    }

    fn stop_detecting(&self) {
        self.watcher.stop();
        lock_unpoisoned(&self.markers).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::LocatedState;
    use crate::coordinate_service::CoordinateService;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    #[derive(Default)]
    struct ManualWatcher {
        callback: Mutex<Option<QrCodeCallback>>,
        stopped: Mutex<bool>,
    }

    impl ManualWatcher {
        fn emit(&self, event: QrCodeEvent) {
            let callback = self.callback.lock().unwrap().clone().expect("not started");
            callback(event);
        }
    }

    impl QrCodeWatcher for ManualWatcher {
        fn start(&self, on_event: QrCodeCallback) {
            *self.callback.lock().unwrap() = Some(on_event);
        }

        fn stop(&self) {
            *self.stopped.lock().unwrap() = true;
        }
    }

    fn code(data: &str, size: f64) -> QrCode {
        QrCode {
            id: Uuid::from_u128(1),
            data: data.to_string(),
            physical_size: size,
            pose: Pose::identity(),
        }
    }

    #[test]
    fn test_marker_id_from_code() {
        assert_eq!(marker_id_from_code("sv3"), Some(MarkerId(3)));
        assert_eq!(marker_id_from_code("sv"), None);
        assert_eq!(marker_id_from_code("https://example.com"), None);
    }

    #[test]
    fn test_marker_pose_is_centered_and_flipped() {
        let pose = marker_pose(&code("sv0", 0.2));
        assert_relative_eq!(pose.position, Vector3::new(0.1, 0.1, 0.0), epsilon = 1e-9);

        // +x of the flipped marker points along -x of the code
        let tip = pose.transform_point(&Point3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(tip.x, -0.9, epsilon = 1e-9);
    }

    #[test]
    fn test_watcher_events_drive_service() {
        let watcher = Arc::new(ManualWatcher::default());
        let detector = Arc::new(QrCodeMarkerDetector::new(watcher.clone()));
        let service = CoordinateService::with_defaults(detector.clone());
        detector.start_detecting(service.sink(), &[]);

        watcher.emit(QrCodeEvent::Added(code("sv0", 0.1)));
        watcher.emit(QrCodeEvent::Added(QrCode {
            id: Uuid::from_u128(2),
            ..code("hello", 0.1)
        }));
        assert_eq!(service.known_coordinates().len(), 1);
        assert_eq!(
            service.try_get_known_coordinate(&MarkerId(0)).unwrap().state,
            LocatedState::Tracking
        );

        watcher.emit(QrCodeEvent::Removed(code("sv0", 0.1)));
        assert_eq!(
            service.try_get_known_coordinate(&MarkerId(0)).unwrap().state,
            LocatedState::Resolved
        );

        detector.stop_detecting();
        assert!(*watcher.stopped.lock().unwrap());
    }
}
