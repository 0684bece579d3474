use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Capture state machine states.
///
/// Cooldown is not a separate state: `last_capture` gates the
/// `Pending -> Capturing` transition, so the machine idles normally while the
/// cooldown runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Feeding frames to the background model; motion is ignored
    Warmup { remaining: u32 },
    /// Watching for motion
    Idle,
    /// Motion seen; waiting for it to persist for the settle delay
    Pending { motion_started_at: Instant },
    /// A capture is in progress
    Capturing,
}

/// Result of stepping the state machine with one frame's motion reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Warmup finished; the controller is now watching
    WarmupComplete,
    /// Motion appeared; the settle timer started
    MotionStarted,
    /// Motion vanished before settling; debounce rejected it
    MotionLost,
    /// Motion persisted and the cooldown has elapsed; capture now
    BeginCapture,
}

/// Coordinates warmup, debounce, capture, and cooldown.
///
/// Transitions are pure functions of `(detected, now)` so the machine is unit
/// testable without a camera; the capture loop supplies real readings and
/// real time.
pub struct CaptureController {
    state: CaptureState,
    motion_delay: Duration,
    cooldown: Duration,
    last_capture: Option<Instant>,
}

impl CaptureController {
    pub fn new(motion_delay: Duration, cooldown: Duration, warmup_frames: u32) -> Self {
        let state = if warmup_frames == 0 {
            CaptureState::Idle
        } else {
            CaptureState::Warmup {
                remaining: warmup_frames,
            }
        };

        Self {
            state,
            motion_delay,
            cooldown,
            last_capture: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn last_capture(&self) -> Option<Instant> {
        self.last_capture
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_capture
            .map_or(true, |t| now.duration_since(t) >= self.cooldown)
    }

    /// Advance the machine with one frame's motion verdict.
    pub fn step(&mut self, detected: bool, now: Instant) -> Transition {
        match self.state {
            CaptureState::Warmup { remaining } => {
                let remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    info!("Warmup complete, watching for motion");
                    self.state = CaptureState::Idle;
                    Transition::WarmupComplete
                } else {
                    self.state = CaptureState::Warmup { remaining };
                    Transition::None
                }
            }
            CaptureState::Idle => {
                if detected {
                    debug!("Motion started, entering settle delay");
                    self.state = CaptureState::Pending {
                        motion_started_at: now,
                    };
                    Transition::MotionStarted
                } else {
                    Transition::None
                }
            }
            CaptureState::Pending { motion_started_at } => {
                if !detected {
                    debug!("Motion vanished before settling, debounce reject");
                    self.state = CaptureState::Idle;
                    return Transition::MotionLost;
                }

                let settled = now.duration_since(motion_started_at) >= self.motion_delay;
                if settled && self.cooldown_elapsed(now) {
                    self.state = CaptureState::Capturing;
                    Transition::BeginCapture
                } else {
                    Transition::None
                }
            }
            // The capture runs inline in the loop iteration that got
            // BeginCapture; nothing to do until finish_capture.
            CaptureState::Capturing => Transition::None,
        }
    }

    /// Record a completed capture attempt and return to watching.
    ///
    /// Called whether or not the artifact was persisted: the cooldown starts
    /// either way so a failing disk does not turn into a capture storm.
    pub fn finish_capture(&mut self, now: Instant) {
        self.last_capture = Some(now);
        self.state = CaptureState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(delay_ms: u64, cooldown_ms: u64, warmup: u32) -> CaptureController {
        CaptureController::new(
            Duration::from_millis(delay_ms),
            Duration::from_millis(cooldown_ms),
            warmup,
        )
    }

    #[test]
    fn test_warmup_counts_down_and_completes() {
        let mut c = controller(0, 0, 3);
        let now = Instant::now();

        assert_eq!(c.step(true, now), Transition::None);
        assert_eq!(c.step(true, now), Transition::None);
        assert_eq!(c.step(true, now), Transition::WarmupComplete);
        assert_eq!(c.state(), CaptureState::Idle);
    }

    #[test]
    fn test_no_capture_during_warmup() {
        let mut c = controller(0, 0, 100);
        let mut now = Instant::now();

        for _ in 0..99 {
            let t = c.step(true, now);
            assert_ne!(t, Transition::BeginCapture);
            now += Duration::from_millis(100);
        }
    }

    #[test]
    fn test_idle_never_jumps_straight_to_capturing() {
        // Even with a zero settle delay, Pending is always visited
        let mut c = controller(0, 0, 0);
        let now = Instant::now();

        assert_eq!(c.step(true, now), Transition::MotionStarted);
        assert_eq!(c.state(), CaptureState::Pending {
            motion_started_at: now
        });
        assert_eq!(c.step(true, now), Transition::BeginCapture);
    }

    #[test]
    fn test_interrupted_motion_resets_settle_timer() {
        let mut c = controller(1000, 0, 0);
        let start = Instant::now();

        assert_eq!(c.step(true, start), Transition::MotionStarted);
        assert_eq!(
            c.step(false, start + Duration::from_millis(500)),
            Transition::MotionLost
        );
        assert_eq!(c.state(), CaptureState::Idle);

        // Motion returns; the old 500ms of persistence must not count
        let restart = start + Duration::from_millis(600);
        assert_eq!(c.step(true, restart), Transition::MotionStarted);
        assert_eq!(
            c.step(true, restart + Duration::from_millis(900)),
            Transition::None
        );
        assert_eq!(
            c.step(true, restart + Duration::from_millis(1000)),
            Transition::BeginCapture
        );
    }

    #[test]
    fn test_motion_must_persist_for_delay() {
        let mut c = controller(1500, 0, 0);
        let start = Instant::now();

        assert_eq!(c.step(true, start), Transition::MotionStarted);
        assert_eq!(
            c.step(true, start + Duration::from_millis(1400)),
            Transition::None
        );
        assert_eq!(
            c.step(true, start + Duration::from_millis(1500)),
            Transition::BeginCapture
        );
    }

    #[test]
    fn test_cooldown_gates_next_capture() {
        let mut c = controller(0, 5000, 0);
        let start = Instant::now();

        assert_eq!(c.step(true, start), Transition::MotionStarted);
        assert_eq!(c.step(true, start), Transition::BeginCapture);
        c.finish_capture(start);

        // Continuous motion during cooldown re-enters Pending but cannot fire
        let t1 = start + Duration::from_millis(100);
        assert_eq!(c.step(true, t1), Transition::MotionStarted);
        for ms in (200..5000).step_by(400) {
            assert_eq!(
                c.step(true, start + Duration::from_millis(ms)),
                Transition::None
            );
        }

        assert_eq!(
            c.step(true, start + Duration::from_millis(5000)),
            Transition::BeginCapture
        );
    }

    #[test]
    fn test_capture_spacing_never_below_cooldown() {
        let cooldown = Duration::from_millis(5000);
        let mut c = controller(0, 5000, 0);
        let start = Instant::now();
        let mut captures = Vec::new();

        // Continuous motion for 20 simulated seconds at 10 steps/second
        for tick in 0..200u64 {
            let now = start + Duration::from_millis(tick * 100);
            if c.step(true, now) == Transition::BeginCapture {
                captures.push(now);
                c.finish_capture(now);
            }
        }

        assert!(captures.len() >= 2);
        for pair in captures.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= cooldown);
        }
    }

    #[test]
    fn test_first_capture_not_gated_by_cooldown() {
        let mut c = controller(0, 60_000, 0);
        let now = Instant::now();

        assert_eq!(c.step(true, now), Transition::MotionStarted);
        assert_eq!(c.step(true, now), Transition::BeginCapture);
    }
}
