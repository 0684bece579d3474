pub mod app;
pub mod camera;
pub mod clip;
pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod motion;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod sharpness;
pub mod snapshot;
pub mod status;
pub mod storage;
pub mod supervisor;

pub use app::PerchcamApp;
pub use camera::{FrameSource, SyntheticCamera};
pub use clip::{export_clip, ClipBuffer, ClipCodec};
pub use config::PerchcamConfig;
pub use controller::{CaptureController, CaptureState, Transition};
pub use error::{PerchcamError, Result};
pub use frame::{Frame, FrameValidator};
pub use motion::{MotionDetector, MotionReading};
pub use pipeline::{CapturePipeline, CaptureStrategy};
pub use queue::{
    CaptureEvent, ConsumerLoop, EventSink, QueueConsumer, RedisEventPublisher,
    MOTION_SCORE_SENTINEL,
};
pub use server::ReadSurface;
pub use sharpness::SharpnessRanker;
pub use snapshot::SnapshotSource;
pub use status::{Diagnostics, StatusCache};
pub use storage::{CleanupResult, ImageStore};
pub use supervisor::{ConnectionHealth, FrameOutcome, ResilienceLimits, ResilienceSupervisor};

#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
pub use camera::GstCamera;
