use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::camera::FrameSource;
use crate::clip::{export_clip, ClipBuffer};
use crate::config::PerchcamConfig;
use crate::controller::{CaptureController, Transition};
use crate::error::StorageError;
use crate::frame::{Frame, FrameValidator};
use crate::motion::MotionDetector;
use crate::queue::{CaptureEvent, EventSink, MOTION_SCORE_SENTINEL};
use crate::sharpness::SharpnessRanker;
use crate::snapshot::SnapshotSource;
use crate::status::StatusCache;
use crate::storage::ImageStore;
use crate::supervisor::{FrameOutcome, ResilienceLimits, ResilienceSupervisor};

/// Interval between status heartbeat log lines
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Which arm of the capture fallback chain produced the persisted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// External on-demand snapshot endpoint
    Snapshot,
    /// Sharpest frame from a live burst
    Burst,
    /// The frame already in hand when the burst produced nothing
    CurrentFrame,
}

impl CaptureStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStrategy::Snapshot => "snapshot",
            CaptureStrategy::Burst => "burst",
            CaptureStrategy::CurrentFrame => "current_frame",
        }
    }
}

/// The sequential capture loop.
///
/// One iteration per target frame: read -> validate -> motion-detect ->
/// state-transition -> maybe-capture -> pace to the configured fps. The loop
/// owns the camera exclusively; everything the read-side surface needs is
/// copied into the status cache.
pub struct CapturePipeline<S: FrameSource> {
    config: PerchcamConfig,
    supervisor: ResilienceSupervisor<S>,
    detector: MotionDetector,
    controller: CaptureController,
    ranker: SharpnessRanker,
    validator: FrameValidator,
    clip_buffer: Option<ClipBuffer>,
    storage: Arc<ImageStore>,
    publisher: Box<dyn EventSink>,
    snapshot: Option<Arc<SnapshotSource>>,
    status: Arc<StatusCache>,
    captures: u64,
}

impl<S: FrameSource> CapturePipeline<S> {
    pub fn new(
        config: PerchcamConfig,
        source: S,
        storage: Arc<ImageStore>,
        publisher: Box<dyn EventSink>,
        snapshot: Option<Arc<SnapshotSource>>,
        status: Arc<StatusCache>,
    ) -> Self {
        let warmup_frames = config.warmup_frames();
        let validator = FrameValidator::default();

        let supervisor = ResilienceSupervisor::new(
            source,
            validator.clone(),
            ResilienceLimits::from(&config.system),
        );

        let detector = MotionDetector::new(config.motion.clone(), warmup_frames);

        let controller = CaptureController::new(
            Duration::from_secs_f64(config.capture.motion_delay_seconds),
            Duration::from_secs_f64(config.capture.cooldown_seconds),
            warmup_frames,
        );

        let ranker = SharpnessRanker {
            samples: config.capture.samples,
            sample_interval: Duration::from_millis(config.capture.sample_interval_ms),
            buffer_flush: config.capture.buffer_flush,
        };

        let clip_buffer = config
            .clip
            .enabled
            .then(|| ClipBuffer::new(config.clip.duration_seconds, config.clip.fps));

        Self {
            config,
            supervisor,
            detector,
            controller,
            ranker,
            validator,
            clip_buffer,
            storage,
            publisher,
            snapshot,
            status,
            captures: 0,
        }
    }

    /// Run until cancelled, then release the camera.
    pub async fn run(mut self, cancel: CancellationToken) {
        let frame_interval = self.config.frame_interval();
        let mut last_heartbeat = Instant::now();

        info!(
            "Capture loop starting (warmup: {} frames, target: {} fps)",
            self.config.warmup_frames(),
            self.config.camera.fps
        );

        while !cancel.is_cancelled() {
            let iteration_started = Instant::now();

            match self.supervisor.next_frame().await {
                FrameOutcome::Valid(frame) => self.handle_frame(frame).await,
                FrameOutcome::Reconnected => {
                    // The source was recreated wholesale; retrain the model
                    // against whatever the new handle sees
                    self.detector.reset();
                }
                FrameOutcome::OpenFailed
                | FrameOutcome::ReadFailed
                | FrameOutcome::Corrupted => {}
            }

            self.status
                .set_connection(self.supervisor.is_connected(), self.supervisor.health());

            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                self.log_heartbeat();
                last_heartbeat = Instant::now();
            }

            if let Some(remaining) = frame_interval.checked_sub(iteration_started.elapsed()) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(remaining) => {}
                }
            }
        }

        self.supervisor.close().await;
        info!("Capture loop stopped ({} captures)", self.captures);
    }

    async fn handle_frame(&mut self, frame: Frame) {
        let brightness = frame.mean_brightness();
        self.status
            .set_brightness(brightness, brightness < self.config.system.low_light_threshold);
        self.status.store_frame(&frame);

        if let Some(buffer) = &mut self.clip_buffer {
            buffer.push(frame.clone());
        }

        let reading = self.detector.process(&frame);
        self.status
            .set_motion(reading.foreground_pixels, reading.min_area);

        match self.controller.step(reading.detected, Instant::now()) {
            Transition::BeginCapture => {
                self.captures += 1;
                info!(
                    "Motion settled, capturing (event #{}, area: {})",
                    self.captures, reading.foreground_pixels
                );

                self.perform_capture(&frame).await;
                self.controller.finish_capture(Instant::now());
            }
            Transition::MotionStarted => {
                debug!("Motion started (area: {})", reading.foreground_pixels);
            }
            Transition::MotionLost => {
                debug!("Motion vanished before settling");
            }
            Transition::WarmupComplete | Transition::None => {}
        }
    }

    /// Acquire the best frame, persist artifacts, and publish the event.
    async fn perform_capture(&mut self, current: &Frame) {
        // Brief extra wait for the motion to settle before sampling
        sleep(Duration::from_millis(self.config.capture.settle_ms)).await;

        let timestamp = Utc::now();

        let (image_path, strategy) = match self.acquire_image(current, &timestamp).await {
            Ok(result) => result,
            Err(e) => {
                // Nothing to point a queue message at; the event is dropped
                warn!("Image persistence failed, aborting capture event: {}", e);
                return;
            }
        };

        info!(
            "Captured image via {} strategy: {}",
            strategy.as_str(),
            image_path
        );

        let video_path = self.export_clip_artifact(&timestamp).await;

        let event = CaptureEvent {
            image_path,
            timestamp,
            motion_score: MOTION_SCORE_SENTINEL,
            source: self.supervisor.source_id(),
            video_path,
        };

        // Fire-and-forget: a publish failure must not stall frame production
        if let Err(e) = self.publisher.publish(&event).await {
            warn!("Failed to publish capture event: {}", e);
        }
    }

    /// Ordered frame-acquisition fallback chain:
    /// snapshot endpoint -> sharpness burst -> current frame.
    async fn acquire_image(
        &mut self,
        current: &Frame,
        timestamp: &DateTime<Utc>,
    ) -> Result<(String, CaptureStrategy), StorageError> {
        if let Some(snapshot) = &self.snapshot {
            match snapshot.fetch().await {
                Ok(bytes) => {
                    let path = self.storage.save_jpeg_bytes(&bytes, timestamp).await?;
                    return Ok((path, CaptureStrategy::Snapshot));
                }
                Err(e) => {
                    warn!("Snapshot fetch failed, falling back to burst: {}", e);
                }
            }
        }

        let quality = self.config.capture.jpeg_quality;
        match self
            .ranker
            .sample_burst(self.supervisor.source_mut(), &self.validator)
            .await
        {
            Ok(best) => {
                let path = self.storage.save_image(&best, timestamp, quality).await?;
                Ok((path, CaptureStrategy::Burst))
            }
            Err(e) => {
                warn!("Burst failed, using current frame: {}", e);
                let path = self
                    .storage
                    .save_image(current, timestamp, quality)
                    .await?;
                Ok((path, CaptureStrategy::CurrentFrame))
            }
        }
    }

    /// Materialize the in-window clip frames to a video artifact.
    ///
    /// Any failure here degrades to image-only; the still has already been
    /// persisted.
    async fn export_clip_artifact(&mut self, timestamp: &DateTime<Utc>) -> Option<String> {
        let buffer = self.clip_buffer.as_ref()?;

        let frames = buffer.snapshot(SystemTime::now());
        if frames.is_empty() {
            warn!("Clip buffer empty, skipping clip export");
            return None;
        }

        let (absolute, relative) = match self.storage.clip_destination(timestamp).await {
            Ok(destination) => destination,
            Err(e) => {
                warn!("Failed to allocate clip path: {}", e);
                return None;
            }
        };

        match export_clip(&frames, &absolute, self.config.clip.fps).await {
            Ok(codec) => {
                info!(
                    "Clip saved ({} codec, {} frames): {}",
                    codec.as_str(),
                    frames.len(),
                    relative
                );
                Some(relative)
            }
            Err(e) => {
                warn!("Clip export failed, continuing image-only: {}", e);
                None
            }
        }
    }

    fn log_heartbeat(&self) {
        let health = self.supervisor.health();
        let error_rate = (health.frame_errors + health.corrupted_frames) as f64
            / health.total_frames.max(1) as f64
            * 100.0;
        let diag = self.status.diagnostics();

        if self.detector.is_warming_up() {
            info!(
                "Status: warming up ({} frames, {:.1}% error rate)",
                health.total_frames, error_rate
            );
        } else {
            info!(
                "Status: {} frames, {} captures, {:.1}% error rate, motion area {}/{}",
                health.total_frames,
                self.captures,
                error_rate,
                diag.motion_area,
                diag.motion_min_area
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CameraError, QueueError};
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use parking_lot::Mutex;

    const WIDTH: u32 = 160;
    const HEIGHT: u32 = 120;

    /// Synthetic scene with an optional bright blob that jumps around while
    /// visible, so the background model never absorbs it.
    struct SceneSource {
        open: bool,
        counter: u64,
        start: Instant,
        blob_window: Option<(Duration, Duration)>,
    }

    impl SceneSource {
        fn new(start: Instant, blob_window: Option<(Duration, Duration)>) -> Self {
            Self {
                open: false,
                counter: 0,
                start,
                blob_window,
            }
        }
    }

    #[async_trait]
    impl FrameSource for SceneSource {
        async fn open(&mut self) -> Result<(), CameraError> {
            self.open = true;
            Ok(())
        }

        async fn read(&mut self) -> Result<Frame, CameraError> {
            if !self.open {
                return Err(CameraError::NotOpen);
            }

            let elapsed = self.start.elapsed();
            let blob_visible = self
                .blob_window
                .map_or(false, |(from, to)| elapsed >= from && elapsed < to);
            let blob_x = (self.counter * 7 % 100) as u32;

            let image = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
                if blob_visible && x >= blob_x && x < blob_x + 40 && (40..80).contains(&y) {
                    Rgb([255, 255, 255])
                } else {
                    let v = ((x + 2 * y) % 180) as u8;
                    Rgb([v, v, v])
                }
            });

            let id = self.counter;
            self.counter += 1;
            Ok(Frame::new(id, SystemTime::now(), image))
        }

        async fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn source_id(&self) -> String {
            "scene".to_string()
        }
    }

    /// Source whose reads always fail; used for the degraded-capture path.
    struct DeadSource;

    #[async_trait]
    impl FrameSource for DeadSource {
        async fn open(&mut self) -> Result<(), CameraError> {
            Ok(())
        }

        async fn read(&mut self) -> Result<Frame, CameraError> {
            Err(CameraError::Read {
                details: "dead".to_string(),
            })
        }

        async fn close(&mut self) {}

        fn is_open(&self) -> bool {
            true
        }

        fn source_id(&self) -> String {
            "dead".to_string()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<(Instant, CaptureEvent)>>>,
    }

    impl RecordingSink {
        fn recorded(&self) -> Vec<(Instant, CaptureEvent)> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&mut self, event: &CaptureEvent) -> Result<(), QueueError> {
            self.events.lock().push((Instant::now(), event.clone()));
            Ok(())
        }
    }

    fn test_config() -> PerchcamConfig {
        let mut config = PerchcamConfig::default();
        config.camera.resolution = (WIDTH, HEIGHT);
        config.camera.fps = 10;
        config.motion.warmup_seconds = 5;
        config.motion.min_area = 400;
        config.motion.blur_sigma = 1.5;
        config.capture.motion_delay_seconds = 1.5;
        config.capture.cooldown_seconds = 5.0;
        config.capture.samples = 3;
        config.capture.sample_interval_ms = 50;
        config.capture.buffer_flush = 0;
        config.capture.jpeg_quality = 80;
        config.clip.enabled = false;
        config.system.reconnect_delay_seconds = 0.0;
        config
    }

    fn build_pipeline<S: FrameSource>(
        config: PerchcamConfig,
        source: S,
        storage_root: &std::path::Path,
    ) -> (CapturePipeline<S>, RecordingSink, Arc<StatusCache>) {
        let sink = RecordingSink::default();
        let status = Arc::new(StatusCache::new());
        let pipeline = CapturePipeline::new(
            config,
            source,
            Arc::new(ImageStore::new(storage_root)),
            Box::new(sink.clone()),
            None,
            Arc::clone(&status),
        );
        (pipeline, sink, status)
    }

    async fn run_scene(
        blob_window: Option<(Duration, Duration)>,
        run_for: Duration,
    ) -> (Vec<(Instant, CaptureEvent)>, Instant) {
        let dir = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let source = SceneSource::new(start, blob_window);
        let (pipeline, sink, _) = build_pipeline(test_config(), source, dir.path());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(cancel.clone()));

        sleep(run_for).await;
        cancel.cancel();
        task.await.unwrap();

        (sink.recorded(), start)
    }

    // Scenario: a static scene must never trigger, warmup included
    #[tokio::test(start_paused = true)]
    async fn test_static_scene_emits_no_events() {
        let (events, _) = run_scene(None, Duration::from_secs(10)).await;
        assert!(events.is_empty(), "got {} unexpected events", events.len());
    }

    // Scenario: 2s of continuous motion with a 1.5s settle delay yields
    // exactly one event, at least 1.5s after onset
    #[tokio::test(start_paused = true)]
    async fn test_single_motion_episode_emits_one_event() {
        let onset = Duration::from_secs(6);
        let window = Some((onset, Duration::from_secs(8)));
        let (events, start) = run_scene(window, Duration::from_secs(12)).await;

        assert_eq!(events.len(), 1, "expected exactly one capture event");

        let (captured_at, event) = &events[0];
        assert!(captured_at.duration_since(start + onset) >= Duration::from_secs_f64(1.5));
        assert_eq!(event.motion_score, MOTION_SCORE_SENTINEL);
        assert_eq!(event.source, "scene");
        assert!(event.image_path.ends_with(".jpg"));
    }

    // Scenario: continuous motion for 20s with a 5s cooldown yields exactly
    // four events, spaced at least the cooldown apart
    #[tokio::test(start_paused = true)]
    async fn test_cooldown_spaces_repeated_captures() {
        let window = Some((Duration::from_secs(6), Duration::from_secs(26)));
        let (events, _) = run_scene(window, Duration::from_secs(27)).await;

        assert_eq!(events.len(), 4, "expected exactly four capture events");

        for pair in events.windows(2) {
            let spacing = pair[1].0.duration_since(pair[0].0);
            assert!(
                spacing >= Duration::from_secs(5),
                "events only {:?} apart",
                spacing
            );
        }
    }

    // The published artifact lands under the date-partitioned layout and is
    // resolvable against the image root
    #[tokio::test(start_paused = true)]
    async fn test_published_path_resolves_under_image_root() {
        let dir = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let window = Some((Duration::from_secs(6), Duration::from_secs(8)));
        let source = SceneSource::new(start, window);
        let (pipeline, sink, _) = build_pipeline(test_config(), source, dir.path());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(cancel.clone()));
        sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        task.await.unwrap();

        let events = sink.recorded();
        assert_eq!(events.len(), 1);

        let image_path = &events[0].1.image_path;
        assert!(dir.path().join(image_path).exists());

        // YYYY-MM/DD/<stamp>.jpg
        let segments: Vec<&str> = image_path.split('/').collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len(), 7);
        assert_eq!(segments[1].len(), 2);
    }

    // Burst failure falls back to the in-hand frame instead of dropping the
    // event
    #[tokio::test(start_paused = true)]
    async fn test_acquire_falls_back_to_current_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, _, _) = build_pipeline(test_config(), DeadSource, dir.path());

        let image = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
            let v = ((x + y) % 200) as u8;
            Rgb([v, v, v])
        });
        let current = Frame::new(7, SystemTime::now(), image);

        let (path, strategy) = pipeline
            .acquire_image(&current, &Utc::now())
            .await
            .unwrap();

        assert_eq!(strategy, CaptureStrategy::CurrentFrame);
        assert!(dir.path().join(path).exists());
    }

    // The status cache tracks what the loop saw
    #[tokio::test(start_paused = true)]
    async fn test_status_cache_updated_by_loop() {
        let dir = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let source = SceneSource::new(start, None);
        let (pipeline, _, status) = build_pipeline(test_config(), source, dir.path());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(cancel.clone()));
        sleep(Duration::from_secs(2)).await;

        let diag = status.diagnostics();
        assert!(diag.camera_connected);
        assert!(diag.total_frames > 0);
        assert!(diag.brightness > 0.0);
        assert!(status.latest_frame().is_some());

        cancel.cancel();
        task.await.unwrap();
    }
}
