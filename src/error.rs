use thiserror::Error;

#[derive(Error, Debug)]
pub enum PerchcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Clip error: {0}")]
    Clip(#[from] ClipError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl PerchcamError {
    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the error is expected to clear on its own given retries.
    ///
    /// Everything on the capture path is transient by design; only broken
    /// configuration warrants giving up.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}

/// Errors from the camera acquisition layer.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera source {source_id}: {details}")]
    Open { source_id: String, details: String },

    #[error("Camera source is not open")]
    NotOpen,

    #[error("Frame read failed: {details}")]
    Read { details: String },

    #[error("Frame read timed out after {timeout:?}")]
    Timeout { timeout: std::time::Duration },

    #[error("Frame decode failed: {details}")]
    Decode { details: String },
}

/// Errors from the capture-time frame acquisition chain.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Snapshot fetch failed: {details}")]
    SnapshotFetch { details: String },

    #[error("Burst sampling produced no usable frame")]
    BurstFailed,

    #[error("JPEG encoding failed: {details}")]
    JpegEncoding { details: String },
}

/// Errors from clip buffering and video export.
#[derive(Error, Debug)]
pub enum ClipError {
    #[error("Video encoding is not available on this platform")]
    EncoderUnavailable,

    #[error("No frames available for clip export")]
    Empty,

    #[error("All clip codecs failed: {details}")]
    AllCodecsFailed { details: String },

    #[error("Encoding pipeline error: {details}")]
    Pipeline { details: String },
}

/// Errors from artifact persistence.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("JPEG encoding failed: {details}")]
    Encode { details: String },

    #[error("Retention sweep failed: {details}")]
    Sweep { details: String },
}

/// Errors from the work queue broker.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("Message decode failed: {details}")]
    Decode { details: String },
}

/// Errors from the read-side HTTP surface.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Server startup failed: {details}")]
    StartupFailed { details: String },
}

pub type Result<T> = std::result::Result<T, PerchcamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        let err = PerchcamError::Camera(CameraError::NotOpen);
        assert!(err.is_recoverable());

        let err = PerchcamError::Config(config::ConfigError::Message("bad".to_string()));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_component_error_display() {
        let err = PerchcamError::component("pipeline", "loop stalled");
        assert_eq!(
            err.to_string(),
            "Component error in pipeline: loop stalled"
        );
    }
}
