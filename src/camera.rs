use async_trait::async_trait;
use image::RgbImage;
use std::time::SystemTime;
use tracing::info;

#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
use std::time::Duration;
#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
use tracing::{debug, warn};

use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::frame::Frame;

#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
use gstreamer::prelude::*;
#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
use gstreamer::Pipeline;
#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
use gstreamer_app::AppSink;
#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
use gstreamer_video::VideoInfo;

/// A source of raw frames backed by a camera device or stream.
///
/// Exactly one capture thread drives `read()`; the read-side query surface
/// never touches the source directly, it reads the cached copies published by
/// the capture loop. Opening is best-effort: requested resolution and frame
/// rate are applied where the device supports them and ignored otherwise.
#[async_trait]
pub trait FrameSource: Send {
    /// Open the underlying device or stream
    async fn open(&mut self) -> Result<(), CameraError>;

    /// Read the most recent frame, with a short internal timeout
    async fn read(&mut self) -> Result<Frame, CameraError>;

    /// Release the device handle
    async fn close(&mut self);

    /// Whether the source currently holds an open handle
    fn is_open(&self) -> bool;

    /// Identifier published on capture events (device path or stream URL)
    fn source_id(&self) -> String;
}

/// GStreamer-backed camera source for V4L2 devices and RTSP streams.
///
/// The appsink is configured with `max-buffers=1 drop=true` so `read()`
/// always returns the freshest frame instead of a stale queued one.
#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
pub struct GstCamera {
    config: CameraConfig,
    pipeline: Option<Pipeline>,
    appsink: Option<AppSink>,
    frame_counter: u64,
}

#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
impl GstCamera {
    pub fn new(config: CameraConfig) -> Result<Self, CameraError> {
        gstreamer::init().map_err(|e| CameraError::Open {
            source_id: config.source.clone(),
            details: format!("Failed to initialize GStreamer: {}", e),
        })?;

        Ok(Self {
            config,
            pipeline: None,
            appsink: None,
            frame_counter: 0,
        })
    }

    fn build_pipeline_string(&self) -> String {
        let (width, height) = self.config.resolution;
        let fps = self.config.fps;
        let source = &self.config.source;

        if source.starts_with("rtsp://") || source.starts_with("http://") {
            // Stream sources negotiate their own resolution; the caps filter
            // only pins the output format.
            format!(
                "rtspsrc location={} latency=100 ! \
                 decodebin ! \
                 videoconvert ! \
                 video/x-raw,format=RGB ! \
                 appsink name=sink sync=false max-buffers=1 drop=true",
                source
            )
        } else {
            format!(
                "v4l2src device=/dev/video{} io-mode=mmap do-timestamp=true ! \
                 image/jpeg,width={},height={},framerate={}/1 ! \
                 jpegdec ! \
                 videoconvert ! \
                 video/x-raw,format=RGB ! \
                 appsink name=sink sync=false max-buffers=1 drop=true",
                source, width, height, fps
            )
        }
    }

    fn sample_to_frame(&mut self, sample: gstreamer::Sample) -> Result<Frame, CameraError> {
        let buffer = sample.buffer().ok_or_else(|| CameraError::Read {
            details: "No buffer in sample".to_string(),
        })?;

        let caps = sample.caps().ok_or_else(|| CameraError::Read {
            details: "No caps in sample".to_string(),
        })?;

        let video_info = VideoInfo::from_caps(caps).map_err(|e| CameraError::Read {
            details: format!("Failed to get video info: {}", e),
        })?;

        let width = video_info.width();
        let height = video_info.height();
        let stride = video_info.stride()[0] as usize;

        let map = buffer.map_readable().map_err(|e| CameraError::Read {
            details: format!("Failed to map buffer: {}", e),
        })?;

        let row_bytes = width as usize * 3;
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            if end > map.len() {
                return Err(CameraError::Decode {
                    details: format!(
                        "Sample too short: {} bytes for {}x{} RGB",
                        map.len(),
                        width,
                        height
                    ),
                });
            }
            pixels.extend_from_slice(&map[start..end]);
        }

        let image = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
            CameraError::Decode {
                details: "Failed to assemble RGB image from sample".to_string(),
            }
        })?;

        let id = self.frame_counter;
        self.frame_counter += 1;

        Ok(Frame::new(id, SystemTime::now(), image))
    }
}

#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
#[async_trait]
impl FrameSource for GstCamera {
    async fn open(&mut self) -> Result<(), CameraError> {
        self.close().await;

        let pipeline_desc = self.build_pipeline_string();
        info!("Opening camera pipeline: {}", pipeline_desc);

        let pipeline = gstreamer::parse::launch(&pipeline_desc)
            .map_err(|e| CameraError::Open {
                source_id: self.config.source.clone(),
                details: format!("Failed to create pipeline: {}", e),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| CameraError::Open {
                source_id: self.config.source.clone(),
                details: "Failed to downcast to Pipeline".to_string(),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CameraError::Open {
                source_id: self.config.source.clone(),
                details: "Failed to get appsink element".to_string(),
            })?
            .downcast::<AppSink>()
            .map_err(|_| CameraError::Open {
                source_id: self.config.source.clone(),
                details: "Failed to downcast to AppSink".to_string(),
            })?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| CameraError::Open {
                source_id: self.config.source.clone(),
                details: format!("Failed to start pipeline: {}", e),
            })?;

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);

        info!("Camera source {} opened", self.config.source);
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, CameraError> {
        let timeout = Duration::from_millis(self.config.read_timeout_ms);
        let appsink = self.appsink.as_ref().ok_or(CameraError::NotOpen)?;

        let sample = appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                self.config.read_timeout_ms,
            ))
            .ok_or(CameraError::Timeout { timeout })?;

        self.sample_to_frame(sample)
    }

    async fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            debug!("Stopping camera pipeline");
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                warn!("Failed to stop camera pipeline cleanly: {}", e);
            }
        }
        self.appsink = None;
    }

    fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }

    fn source_id(&self) -> String {
        let source = &self.config.source;
        if source.starts_with("rtsp://") || source.starts_with("http://") {
            source.clone()
        } else {
            format!("device_{}", source)
        }
    }
}

/// Synthetic camera producing a static gradient scene.
///
/// Used on platforms without GStreamer and as the frame source in tests.
/// The scene is static so it trains the background model without ever
/// flagging motion.
pub struct SyntheticCamera {
    config: CameraConfig,
    open: bool,
    frame_counter: u64,
}

impl SyntheticCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            open: false,
            frame_counter: 0,
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticCamera {
    async fn open(&mut self) -> Result<(), CameraError> {
        info!(
            "Opening synthetic camera ({}x{})",
            self.config.resolution.0, self.config.resolution.1
        );
        self.open = true;
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, CameraError> {
        if !self.open {
            return Err(CameraError::NotOpen);
        }

        let (width, height) = self.config.resolution;
        let image = RgbImage::from_fn(width, height, |x, y| {
            let v = (((x * 255) / width.max(1) + (y * 255) / height.max(1)) / 2) as u8;
            image::Rgb([v, v, v])
        });

        let id = self.frame_counter;
        self.frame_counter += 1;

        Ok(Frame::new(id, SystemTime::now(), image))
    }

    async fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn source_id(&self) -> String {
        "synthetic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameValidator;

    fn test_config() -> CameraConfig {
        CameraConfig {
            source: "0".to_string(),
            resolution: (64, 48),
            fps: 15,
            read_timeout_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_synthetic_camera_lifecycle() {
        let mut camera = SyntheticCamera::new(test_config());
        assert!(!camera.is_open());
        assert!(matches!(
            camera.read().await,
            Err(CameraError::NotOpen)
        ));

        camera.open().await.unwrap();
        assert!(camera.is_open());

        let frame = camera.read().await.unwrap();
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
        assert_eq!(frame.id, 0);

        let next = camera.read().await.unwrap();
        assert_eq!(next.id, 1);

        camera.close().await;
        assert!(!camera.is_open());
    }

    #[tokio::test]
    async fn test_synthetic_frames_pass_validation() {
        let mut camera = SyntheticCamera::new(test_config());
        camera.open().await.unwrap();

        let frame = camera.read().await.unwrap();
        assert!(FrameValidator::default().is_valid(&frame));
    }
}
