//! Scene-driven sensor backends.
//!
//! A scene holds the markers (or QR codes) physically present around one
//! simulated device, at poses expressed in that device's local frame. Once
//! detection starts, the scene reports what the device would see.

use colocate_core::localizer::qr_code::QrCodeCallback;
use colocate_core::localizer::{MarkerId, QrCode, QrCodeEvent, QrCodeWatcher};
use colocate_core::{ObservationSink, Pose, SensorBackend};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Timing of a scene sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneTiming {
    /// Time from detection start to the first frame (default: 200ms)
    pub detection_delay: Duration,

    /// Time between frames (default: 100ms)
    pub frame_interval: Duration,
}

impl Default for SceneTiming {
    fn default() -> Self {
        Self {
            detection_delay: Duration::from_millis(200),
            frame_interval: Duration::from_millis(100),
        }
    }
}

// ============================================================================
// MARKERS
// ============================================================================

/// Visual markers around one device, reported as full-frame snapshots.
pub struct SceneMarkerDetector {
    markers: Arc<Mutex<BTreeMap<MarkerId, Pose>>>,
    timing: SceneTiming,
    running: Mutex<Option<CancellationToken>>,
    starts: AtomicU64,
}

impl SceneMarkerDetector {
    pub fn new(timing: SceneTiming) -> Self {
        Self {
            markers: Arc::new(Mutex::new(BTreeMap::new())),
            timing,
            running: Mutex::new(None),
            starts: AtomicU64::new(0),
        }
    }

    /// Puts a marker in view (or moves it).
    pub fn place(&self, id: MarkerId, pose: Pose) {
        lock(&self.markers).insert(id, pose);
    }

    /// Takes a marker out of view.
    pub fn remove(&self, id: MarkerId) -> bool {
        lock(&self.markers).remove(&id).is_some()
    }

    pub fn pose_of(&self, id: MarkerId) -> Option<Pose> {
        lock(&self.markers).get(&id).copied()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// How many times detection was started.
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }
}

impl SensorBackend<MarkerId> for SceneMarkerDetector {
    fn name(&self) -> &str {
        "scene-markers"
    }

    fn start_detecting(&self, sink: ObservationSink<MarkerId>, _targets: &[MarkerId]) {
        let stop = CancellationToken::new();
        if let Some(previous) = lock(&self.running).replace(stop.clone()) {
            previous.cancel();
        }
        self.starts.fetch_add(1, Ordering::Relaxed);

        let markers = Arc::clone(&self.markers);
        let timing = self.timing;
        tokio::spawn(async move {
            let mut wait = timing.detection_delay;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let frame: Vec<(MarkerId, Pose)> = lock(&markers).iter().map(|(id, pose)| (*id, *pose)).collect();
                if !sink.snapshot(frame) {
                    break;
                }
                wait = timing.frame_interval;
            }
            debug!("Scene marker detection stopped");
        });
    }

    fn stop_detecting(&self) {
        if let Some(stop) = lock(&self.running).take() {
            stop.cancel();
        }
    }
}

// ============================================================================
// QR CODES
// ============================================================================

/// QR codes around one device, announced once each after the detection delay.
pub struct SceneQrCodes {
    codes: Mutex<Vec<QrCode>>,
    timing: SceneTiming,
    running: Mutex<Option<CancellationToken>>,
}

impl SceneQrCodes {
    pub fn new(timing: SceneTiming) -> Self {
        Self {
            codes: Mutex::new(Vec::new()),
            timing,
            running: Mutex::new(None),
        }
    }

    /// Places a code with text `data` whose corner sits at `pose`.
    pub fn place(&self, data: impl Into<String>, physical_size: f64, pose: Pose) {
        let mut codes = lock(&self.codes);
        let id = Uuid::from_u128(codes.len() as u128 + 1);
        codes.push(QrCode {
            id,
            data: data.into(),
            physical_size,
            pose,
        });
    }
}

impl QrCodeWatcher for SceneQrCodes {
    fn start(&self, on_event: QrCodeCallback) {
        let stop = CancellationToken::new();
        if let Some(previous) = lock(&self.running).replace(stop.clone()) {
            previous.cancel();
        }
        let codes = lock(&self.codes).clone();
        let delay = self.timing.detection_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    for code in codes {
                        on_event(QrCodeEvent::Added(code));
                    }
                }
            }
        });
    }

    fn stop(&self) {
        if let Some(stop) = lock(&self.running).take() {
            stop.cancel();
        }
    }
}
