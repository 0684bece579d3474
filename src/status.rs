use parking_lot::RwLock;

use crate::frame::Frame;
use crate::supervisor::ConnectionHealth;

/// Read-side diagnostics, updated once per capture loop iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnostics {
    pub camera_connected: bool,
    pub brightness: f64,
    pub low_light: bool,
    pub total_frames: u64,
    pub frame_errors: u64,
    pub corrupted_frames: u64,
    pub motion_area: u32,
    pub motion_min_area: u32,
}

impl Diagnostics {
    pub fn motion_detected(&self) -> bool {
        self.motion_area > self.motion_min_area
    }
}

/// State shared between the capture loop and the HTTP handlers.
///
/// These are the only two lock domains on the read side: the cached
/// last-good frame and the diagnostics snapshot. The capture loop copies
/// data in, handlers copy data out, and neither lock is ever held across
/// camera I/O, so a wedged device can never stall a status request.
#[derive(Default)]
pub struct StatusCache {
    last_frame: RwLock<Option<Frame>>,
    diagnostics: RwLock<Diagnostics>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a copy of the latest good frame
    pub fn store_frame(&self, frame: &Frame) {
        *self.last_frame.write() = Some(frame.clone());
    }

    /// Copy out the last cached frame, if any.
    ///
    /// Never triggers a camera read; returns whatever the loop last stored.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.last_frame.read().clone()
    }

    pub fn set_brightness(&self, brightness: f64, low_light: bool) {
        let mut diag = self.diagnostics.write();
        diag.brightness = brightness;
        diag.low_light = low_light;
    }

    pub fn set_motion(&self, area: u32, min_area: u32) {
        let mut diag = self.diagnostics.write();
        diag.motion_area = area;
        diag.motion_min_area = min_area;
    }

    pub fn set_connection(&self, connected: bool, health: ConnectionHealth) {
        let mut diag = self.diagnostics.write();
        diag.camera_connected = connected;
        diag.total_frames = health.total_frames;
        diag.frame_errors = health.frame_errors;
        diag.corrupted_frames = health.corrupted_frames;
    }

    /// Copy out the current diagnostics snapshot
    pub fn diagnostics(&self) -> Diagnostics {
        *self.diagnostics.read()
    }
}
