use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PerchcamConfig {
    pub camera: CameraConfig,
    pub motion: MotionConfig,
    pub capture: CaptureConfig,
    pub clip: ClipConfig,
    pub queue: QueueConfig,
    pub http: HttpConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Camera source: a device index (e.g. "0" for /dev/video0) or an
    /// rtsp:// / http:// stream URL
    #[serde(default = "default_camera_source")]
    pub source: String,

    /// Requested resolution (width, height), applied best-effort
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Target frames per second for the capture loop
    #[serde(default = "default_camera_fps")]
    pub fps: u32,

    /// Per-read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MotionConfig {
    /// Seconds of frames fed to the background model before motion is reported
    #[serde(default = "default_warmup_seconds")]
    pub warmup_seconds: u32,

    /// Squared-distance multiplier on per-pixel variance; lower = more sensitive
    #[serde(default = "default_var_threshold")]
    pub var_threshold: f64,

    /// Binarization threshold on the foreground mask; values at or below the
    /// shadow level (127) are discarded
    #[serde(default = "default_binary_threshold")]
    pub binary_threshold: u8,

    /// Minimum foreground pixel count to flag motion
    #[serde(default = "default_min_area")]
    pub min_area: u32,

    /// Gaussian blur sigma applied before differencing
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,

    /// Background model learning rate per frame
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// Seconds motion must persist continuously before a capture triggers
    #[serde(default = "default_motion_delay_seconds")]
    pub motion_delay_seconds: f64,

    /// Minimum spacing between two capture events, in seconds
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,

    /// Extra settle wait before frame acquisition, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Number of frames sampled for sharpness ranking
    #[serde(default = "default_capture_samples")]
    pub samples: u32,

    /// Delay between burst samples, in milliseconds
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Frames discarded before sampling so the burst sees fresh frames
    #[serde(default = "default_buffer_flush")]
    pub buffer_flush: u32,

    /// JPEG quality for persisted still images (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Optional on-demand snapshot endpoint; takes precedence over the burst
    pub snapshot_url: Option<String>,

    /// Snapshot fetch timeout in seconds
    #[serde(default = "default_snapshot_timeout_seconds")]
    pub snapshot_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClipConfig {
    /// Enable short video clip export alongside still images
    #[serde(default = "default_clip_enabled")]
    pub enabled: bool,

    /// Clip duration in seconds
    #[serde(default = "default_clip_duration_seconds")]
    pub duration_seconds: f64,

    /// Clip playback frame rate
    #[serde(default = "default_clip_fps")]
    pub fps: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueConfig {
    /// Broker connection URL
    #[serde(default = "default_queue_url")]
    pub url: String,

    /// Queue the capture service pushes events onto
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Queue the consumer publishes enriched detections onto
    #[serde(default = "default_detections_queue_name")]
    pub detections_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    /// Address to bind the read-side surface to
    #[serde(default = "default_http_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// JPEG quality for the /live endpoint
    #[serde(default = "default_live_jpeg_quality")]
    pub live_jpeg_quality: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Root directory for the date-partitioned artifact tree
    #[serde(default = "default_images_path")]
    pub images_path: String,

    /// Consecutive read/validation failures before the camera is reconnected
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Fixed delay around camera reconnect attempts, in seconds
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: f64,

    /// Mean-luminance fraction below which the scene counts as low light
    #[serde(default = "default_low_light_threshold")]
    pub low_light_threshold: f64,

    /// Enable the periodic artifact retention sweep
    #[serde(default = "default_retention_enabled")]
    pub retention_enabled: bool,

    /// Days of artifacts to keep
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl PerchcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("perchcam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("camera.source", default_camera_source())?
            .set_default(
                "camera.resolution",
                vec![default_camera_resolution().0, default_camera_resolution().1],
            )?
            .set_default("camera.fps", default_camera_fps())?
            .set_default("camera.read_timeout_ms", default_read_timeout_ms())?
            .set_default("motion.warmup_seconds", default_warmup_seconds())?
            .set_default("motion.var_threshold", default_var_threshold())?
            .set_default("motion.binary_threshold", default_binary_threshold() as i64)?
            .set_default("motion.min_area", default_min_area())?
            .set_default("motion.blur_sigma", default_blur_sigma() as f64)?
            .set_default("motion.learning_rate", default_learning_rate() as f64)?
            .set_default(
                "capture.motion_delay_seconds",
                default_motion_delay_seconds(),
            )?
            .set_default("capture.cooldown_seconds", default_cooldown_seconds())?
            .set_default("capture.settle_ms", default_settle_ms())?
            .set_default("capture.samples", default_capture_samples())?
            .set_default("capture.sample_interval_ms", default_sample_interval_ms())?
            .set_default("capture.buffer_flush", default_buffer_flush())?
            .set_default("capture.jpeg_quality", default_jpeg_quality() as i64)?
            .set_default(
                "capture.snapshot_timeout_seconds",
                default_snapshot_timeout_seconds(),
            )?
            .set_default("clip.enabled", default_clip_enabled())?
            .set_default("clip.duration_seconds", default_clip_duration_seconds())?
            .set_default("clip.fps", default_clip_fps())?
            .set_default("queue.url", default_queue_url())?
            .set_default("queue.name", default_queue_name())?
            .set_default("queue.detections_name", default_detections_queue_name())?
            .set_default("http.host", default_http_host())?
            .set_default("http.port", default_http_port() as i64)?
            .set_default(
                "http.live_jpeg_quality",
                default_live_jpeg_quality() as i64,
            )?
            .set_default("system.images_path", default_images_path())?
            .set_default(
                "system.max_consecutive_errors",
                default_max_consecutive_errors(),
            )?
            .set_default(
                "system.reconnect_delay_seconds",
                default_reconnect_delay_seconds(),
            )?
            .set_default("system.low_light_threshold", default_low_light_threshold())?
            .set_default("system.retention_enabled", default_retention_enabled())?
            .set_default("system.retention_days", default_retention_days())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("PERCHCAM").separator("_"))
            .build()?;

        let config: PerchcamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Camera resolution must be greater than 0".to_string(),
            ));
        }

        if self.camera.fps == 0 {
            return Err(ConfigError::Message(
                "Camera fps must be greater than 0".to_string(),
            ));
        }

        if self.motion.min_area == 0 {
            return Err(ConfigError::Message(
                "Motion min_area must be greater than 0".to_string(),
            ));
        }

        if self.capture.jpeg_quality == 0 || self.capture.jpeg_quality > 100 {
            return Err(ConfigError::Message(
                "JPEG quality must be between 1 and 100".to_string(),
            ));
        }

        if self.capture.samples == 0 {
            return Err(ConfigError::Message(
                "Capture samples must be greater than 0".to_string(),
            ));
        }

        if self.clip.enabled && (self.clip.duration_seconds <= 0.0 || self.clip.fps <= 0.0) {
            return Err(ConfigError::Message(
                "Clip duration and fps must be greater than 0".to_string(),
            ));
        }

        if self.system.max_consecutive_errors == 0 {
            return Err(ConfigError::Message(
                "max_consecutive_errors must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of frames the background model trains on before motion is reported
    pub fn warmup_frames(&self) -> u32 {
        self.camera.fps * self.motion.warmup_seconds
    }

    /// Target interval between capture loop iterations
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.camera.fps as f64)
    }
}

impl Default for PerchcamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                source: default_camera_source(),
                resolution: default_camera_resolution(),
                fps: default_camera_fps(),
                read_timeout_ms: default_read_timeout_ms(),
            },
            motion: MotionConfig {
                warmup_seconds: default_warmup_seconds(),
                var_threshold: default_var_threshold(),
                binary_threshold: default_binary_threshold(),
                min_area: default_min_area(),
                blur_sigma: default_blur_sigma(),
                learning_rate: default_learning_rate(),
            },
            capture: CaptureConfig {
                motion_delay_seconds: default_motion_delay_seconds(),
                cooldown_seconds: default_cooldown_seconds(),
                settle_ms: default_settle_ms(),
                samples: default_capture_samples(),
                sample_interval_ms: default_sample_interval_ms(),
                buffer_flush: default_buffer_flush(),
                jpeg_quality: default_jpeg_quality(),
                snapshot_url: None,
                snapshot_timeout_seconds: default_snapshot_timeout_seconds(),
            },
            clip: ClipConfig {
                enabled: default_clip_enabled(),
                duration_seconds: default_clip_duration_seconds(),
                fps: default_clip_fps(),
            },
            queue: QueueConfig {
                url: default_queue_url(),
                name: default_queue_name(),
                detections_name: default_detections_queue_name(),
            },
            http: HttpConfig {
                host: default_http_host(),
                port: default_http_port(),
                live_jpeg_quality: default_live_jpeg_quality(),
            },
            system: SystemConfig {
                images_path: default_images_path(),
                max_consecutive_errors: default_max_consecutive_errors(),
                reconnect_delay_seconds: default_reconnect_delay_seconds(),
                low_light_threshold: default_low_light_threshold(),
                retention_enabled: default_retention_enabled(),
                retention_days: default_retention_days(),
            },
        }
    }
}

// Default value functions
fn default_camera_source() -> String {
    "0".to_string()
}
fn default_camera_resolution() -> (u32, u32) {
    (1920, 1080)
}
fn default_camera_fps() -> u32 {
    15
}
fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_warmup_seconds() -> u32 {
    5
}
fn default_var_threshold() -> f64 {
    35.0
}
fn default_binary_threshold() -> u8 {
    175
}
fn default_min_area() -> u32 {
    3000
}
fn default_blur_sigma() -> f32 {
    3.0
}
fn default_learning_rate() -> f32 {
    0.05
}

fn default_motion_delay_seconds() -> f64 {
    1.5
}
fn default_cooldown_seconds() -> f64 {
    5.0
}
fn default_settle_ms() -> u64 {
    300
}
fn default_capture_samples() -> u32 {
    5
}
fn default_sample_interval_ms() -> u64 {
    100
}
fn default_buffer_flush() -> u32 {
    10
}
fn default_jpeg_quality() -> u8 {
    95
}
fn default_snapshot_timeout_seconds() -> u64 {
    5
}

fn default_clip_enabled() -> bool {
    true
}
fn default_clip_duration_seconds() -> f64 {
    3.0
}
fn default_clip_fps() -> f64 {
    15.0
}

fn default_queue_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_queue_name() -> String {
    "images".to_string()
}
fn default_detections_queue_name() -> String {
    "detections".to_string()
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_live_jpeg_quality() -> u8 {
    85
}

fn default_images_path() -> String {
    "data/images".to_string()
}
fn default_max_consecutive_errors() -> u32 {
    50
}
fn default_reconnect_delay_seconds() -> f64 {
    5.0
}
fn default_low_light_threshold() -> f64 {
    0.2
}
fn default_retention_enabled() -> bool {
    true
}
fn default_retention_days() -> u32 {
    30
}
