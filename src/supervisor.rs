use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::camera::FrameSource;
use crate::config::SystemConfig;
use crate::frame::{Frame, FrameValidator};

/// Connection health counters.
///
/// `consecutive_errors` is shared by read failures and validator rejections;
/// a valid frame resets it. The cumulative counters are diagnostics and are
/// never reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionHealth {
    pub consecutive_errors: u32,
    pub total_frames: u64,
    pub frame_errors: u64,
    pub corrupted_frames: u64,
    pub reconnects: u64,
}

/// Thresholds and delays governing reconnection.
#[derive(Debug, Clone)]
pub struct ResilienceLimits {
    /// Consecutive failures that force a camera reconnect
    pub max_consecutive_errors: u32,
    /// Fixed sleep before and after reopen attempts
    pub reconnect_delay: Duration,
    /// Short pause after an individual failed read
    pub read_error_backoff: Duration,
}

impl From<&SystemConfig> for ResilienceLimits {
    fn from(config: &SystemConfig) -> Self {
        Self {
            max_consecutive_errors: config.max_consecutive_errors,
            reconnect_delay: Duration::from_secs_f64(config.reconnect_delay_seconds),
            read_error_backoff: Duration::from_millis(100),
        }
    }
}

/// Outcome of one supervised read attempt.
#[derive(Debug)]
pub enum FrameOutcome {
    /// A validated frame
    Valid(Frame),
    /// The source is closed and could not be reopened this round
    OpenFailed,
    /// Transient read failure (no frame produced)
    ReadFailed,
    /// A frame arrived but failed validation (garbage payload)
    Corrupted,
    /// The failure threshold was hit and a reconnect cycle ran
    Reconnected,
}

/// Wraps a frame source with failure counting and forced reconnection.
///
/// Read failures and validation failures are logged separately but funnel
/// into the same counter and the same reconnect trigger. Reconnection loops
/// with bounded sleeps and never panics the capture loop.
pub struct ResilienceSupervisor<S: FrameSource> {
    source: S,
    validator: FrameValidator,
    limits: ResilienceLimits,
    health: ConnectionHealth,
}

impl<S: FrameSource> ResilienceSupervisor<S> {
    pub fn new(source: S, validator: FrameValidator, limits: ResilienceLimits) -> Self {
        Self {
            source,
            validator,
            limits,
            health: ConnectionHealth::default(),
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health
    }

    pub fn is_connected(&self) -> bool {
        self.source.is_open()
    }

    pub fn source_id(&self) -> String {
        self.source.source_id()
    }

    /// Direct access to the source for capture-time burst sampling.
    ///
    /// Only the capture loop holds the supervisor, so this never races the
    /// per-frame reads.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub async fn close(&mut self) {
        self.source.close().await;
    }

    /// Read and validate one frame, driving reconnection as needed.
    pub async fn next_frame(&mut self) -> FrameOutcome {
        if !self.source.is_open() {
            match self.source.open().await {
                Ok(()) => {
                    self.health.consecutive_errors = 0;
                    info!("Camera source {} opened", self.source.source_id());
                }
                Err(e) => {
                    warn!("Failed to open camera source: {}", e);
                    sleep(self.limits.reconnect_delay).await;
                    return FrameOutcome::OpenFailed;
                }
            }
        }

        self.health.total_frames += 1;

        let frame = match self.source.read().await {
            Ok(frame) => frame,
            Err(e) => {
                self.health.frame_errors += 1;
                self.health.consecutive_errors += 1;

                if self.health.frame_errors % 100 == 0 {
                    warn!(
                        "Frame read failed: {} (total errors: {}, consecutive: {})",
                        e, self.health.frame_errors, self.health.consecutive_errors
                    );
                }

                if self.health.consecutive_errors >= self.limits.max_consecutive_errors {
                    self.reconnect().await;
                    return FrameOutcome::Reconnected;
                }

                sleep(self.limits.read_error_backoff).await;
                return FrameOutcome::ReadFailed;
            }
        };

        if !self.validator.is_valid(&frame) {
            self.health.corrupted_frames += 1;
            self.health.consecutive_errors += 1;

            if self.health.corrupted_frames % 100 == 0 {
                warn!(
                    "Skipped corrupted frame (total corrupted: {}, consecutive: {})",
                    self.health.corrupted_frames, self.health.consecutive_errors
                );
            }

            if self.health.consecutive_errors >= self.limits.max_consecutive_errors {
                self.reconnect().await;
                return FrameOutcome::Reconnected;
            }

            return FrameOutcome::Corrupted;
        }

        self.health.consecutive_errors = 0;
        FrameOutcome::Valid(frame)
    }

    /// Force-close and reopen the source with bounded sleeps around it.
    async fn reconnect(&mut self) {
        warn!(
            "Too many consecutive errors ({}), reconnecting camera",
            self.health.consecutive_errors
        );

        self.health.reconnects += 1;
        self.source.close().await;
        sleep(self.limits.reconnect_delay).await;

        match self.source.open().await {
            Ok(()) => {
                self.health.consecutive_errors = 0;
                info!("Camera reconnected after {} reconnects", self.health.reconnects);
            }
            Err(e) => {
                warn!("Reconnection failed, will retry: {}", e);
                sleep(self.limits.reconnect_delay).await;
            }
        }

        debug!("Reconnect cycle complete");
    }
}
