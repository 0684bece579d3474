use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::error::ClipError;
use crate::frame::Frame;

/// Extra slots beyond `duration x fps` so eviction never races the window
const CAPACITY_SLACK: usize = 10;

/// Rolling time-window store of recent frames for on-demand clip export.
///
/// Entries are keyed by the frame's wall-clock capture time. Frames are only
/// persisted when a capture event materializes the in-window subset to a
/// video artifact; otherwise they age out of the ring.
pub struct ClipBuffer {
    entries: VecDeque<(SystemTime, Frame)>,
    capacity: usize,
    duration: Duration,
    fps: f64,
}

impl ClipBuffer {
    pub fn new(duration_seconds: f64, fps: f64) -> Self {
        let capacity = (duration_seconds * fps).ceil() as usize + CAPACITY_SLACK;
        debug!(
            "Created clip buffer ({}s @ {} fps, capacity {})",
            duration_seconds, fps, capacity
        );

        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            duration: Duration::from_secs_f64(duration_seconds),
            fps,
        }
    }

    /// Append a frame, evicting the oldest entry on overflow
    pub fn push(&mut self, frame: Frame) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((frame.timestamp, frame));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Frames within `[now - duration, now]`, oldest first.
    ///
    /// If nothing falls inside the window (the buffer is younger than the
    /// clip duration), fall back to the most recent `fps x duration` frames.
    pub fn snapshot(&self, now: SystemTime) -> Vec<Frame> {
        let cutoff = now - self.duration;

        let in_window: Vec<Frame> = self
            .entries
            .iter()
            .filter(|(captured, _)| *captured >= cutoff && *captured <= now)
            .map(|(_, frame)| frame.clone())
            .collect();

        if !in_window.is_empty() {
            return in_window;
        }

        let fallback_count = (self.duration.as_secs_f64() * self.fps).ceil() as usize;
        let skip = self.entries.len().saturating_sub(fallback_count);
        self.entries
            .iter()
            .skip(skip)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

/// Codecs attempted for clip export, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipCodec {
    H264,
    Mpeg4,
}

impl ClipCodec {
    /// Ordered fallback chain: the preferred codec first
    pub fn chain() -> [ClipCodec; 2] {
        [ClipCodec::H264, ClipCodec::Mpeg4]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClipCodec::H264 => "h264",
            ClipCodec::Mpeg4 => "mpeg4",
        }
    }

    #[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
    fn encoder_fragment(&self) -> &'static str {
        match self {
            ClipCodec::H264 => {
                "x264enc speed-preset=medium bitrate=4000 key-int-max=60 ! \
                 video/x-h264,stream-format=byte-stream,alignment=au ! \
                 h264parse config-interval=1"
            }
            ClipCodec::Mpeg4 => "avenc_mpeg4 bitrate=4000000 ! mpeg4videoparse",
        }
    }
}

/// Render buffered frames to a video file, trying each codec in the chain.
///
/// Returns the codec that succeeded so callers can log which strategy was
/// used. Export failure is non-fatal to the capture: the caller degrades to
/// image-only.
pub async fn export_clip(
    frames: &[Frame],
    path: &Path,
    fps: f64,
) -> Result<ClipCodec, ClipError> {
    if frames.is_empty() {
        return Err(ClipError::Empty);
    }

    let mut failures = Vec::new();
    for codec in ClipCodec::chain() {
        match encode_clip(frames, path, fps, codec).await {
            Ok(()) => {
                info!(
                    "Clip exported with {} codec: {} ({} frames)",
                    codec.as_str(),
                    path.display(),
                    frames.len()
                );
                return Ok(codec);
            }
            Err(e) => {
                warn!("Clip codec {} failed: {}", codec.as_str(), e);
                failures.push(format!("{}: {}", codec.as_str(), e));
            }
        }
    }

    Err(ClipError::AllCodecsFailed {
        details: failures.join("; "),
    })
}

#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
async fn encode_clip(
    frames: &[Frame],
    path: &Path,
    fps: f64,
    codec: ClipCodec,
) -> Result<(), ClipError> {
    use gstreamer::prelude::*;
    use gstreamer_app::AppSrc;

    gstreamer::init().map_err(|e| ClipError::Pipeline {
        details: format!("Failed to initialize GStreamer: {}", e),
    })?;

    let width = frames[0].width();
    let height = frames[0].height();
    let fps_n = fps.round().max(1.0) as i32;

    let pipeline_desc = format!(
        "appsrc name=src format=time is-live=false \
         caps=video/x-raw,format=RGB,width={},height={},framerate={}/1 ! \
         videoconvert ! \
         {} ! \
         mp4mux faststart=true ! \
         filesink location={}",
        width,
        height,
        fps_n,
        codec.encoder_fragment(),
        path.to_string_lossy()
    );

    debug!("Clip pipeline ({}): {}", codec.as_str(), pipeline_desc);

    let pipeline = gstreamer::parse::launch(&pipeline_desc)
        .map_err(|e| ClipError::Pipeline {
            details: format!("Failed to create pipeline: {}", e),
        })?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| ClipError::Pipeline {
            details: "Failed to downcast to Pipeline".to_string(),
        })?;

    let appsrc = pipeline
        .by_name("src")
        .ok_or_else(|| ClipError::Pipeline {
            details: "Failed to get appsrc element".to_string(),
        })?
        .downcast::<AppSrc>()
        .map_err(|_| ClipError::Pipeline {
            details: "Failed to downcast to AppSrc".to_string(),
        })?;

    pipeline
        .set_state(gstreamer::State::Playing)
        .map_err(|e| ClipError::Pipeline {
            details: format!("Failed to start pipeline: {}", e),
        })?;

    let frame_duration_ns = 1_000_000_000u64 / fps_n as u64;

    for (index, frame) in frames.iter().enumerate() {
        let data = frame.image.as_raw();
        let mut buffer =
            gstreamer::Buffer::with_size(data.len()).map_err(|e| ClipError::Pipeline {
                details: format!("Failed to create buffer: {}", e),
            })?;

        {
            let buffer_ref = buffer.get_mut().unwrap();
            let mut map = buffer_ref
                .map_writable()
                .map_err(|e| ClipError::Pipeline {
                    details: format!("Failed to map buffer: {}", e),
                })?;
            map.copy_from_slice(data);
        }

        let pts = index as u64 * frame_duration_ns;
        buffer
            .get_mut()
            .unwrap()
            .set_pts(gstreamer::ClockTime::from_nseconds(pts));
        buffer
            .get_mut()
            .unwrap()
            .set_duration(gstreamer::ClockTime::from_nseconds(frame_duration_ns));

        appsrc.push_buffer(buffer).map_err(|e| {
            let _ = pipeline.set_state(gstreamer::State::Null);
            ClipError::Pipeline {
                details: format!("Failed to push buffer: {:?}", e),
            }
        })?;
    }

    appsrc.end_of_stream().map_err(|e| ClipError::Pipeline {
        details: format!("Failed to signal EOS: {:?}", e),
    })?;

    let bus = pipeline.bus().expect("pipeline has a bus");
    let mut result = Ok(());
    for msg in bus.iter_timed(gstreamer::ClockTime::from_seconds(30)) {
        match msg.view() {
            gstreamer::MessageView::Eos(..) => break,
            gstreamer::MessageView::Error(err) => {
                result = Err(ClipError::Pipeline {
                    details: format!(
                        "Encoding error: {} ({})",
                        err.error(),
                        err.debug().unwrap_or_default()
                    ),
                });
                break;
            }
            _ => {}
        }
    }

    let _ = pipeline.set_state(gstreamer::State::Null);
    result
}

#[cfg(not(all(target_os = "linux", feature = "camera-gstreamer")))]
async fn encode_clip(
    _frames: &[Frame],
    _path: &Path,
    _fps: f64,
    _codec: ClipCodec,
) -> Result<(), ClipError> {
    Err(ClipError::EncoderUnavailable)
}
