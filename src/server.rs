use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::HttpConfig;
use crate::error::ServerError;
use crate::snapshot::SnapshotSource;
use crate::status::StatusCache;

/// Read-side HTTP query surface.
///
/// Every handler reads only cached, already-copied state (or the external
/// snapshot endpoint); none of them can block on camera I/O or stall the
/// capture loop.
pub struct ReadSurface {
    config: HttpConfig,
    status: Arc<StatusCache>,
    snapshot: Option<Arc<SnapshotSource>>,
}

#[derive(Clone)]
struct ServerState {
    status: Arc<StatusCache>,
    snapshot: Option<Arc<SnapshotSource>>,
    live_jpeg_quality: u8,
}

impl ReadSurface {
    pub fn new(
        config: HttpConfig,
        status: Arc<StatusCache>,
        snapshot: Option<Arc<SnapshotSource>>,
    ) -> Self {
        Self {
            config,
            status,
            snapshot,
        }
    }

    /// Bind and serve until the cancellation token fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        let state = ServerState {
            status: Arc::clone(&self.status),
            snapshot: self.snapshot.clone(),
            live_jpeg_quality: self.config.live_jpeg_quality,
        };

        let app = router(state);
        let addr = format!("{}:{}", self.config.host, self.config.port);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind {
                address: addr.clone(),
                source: e,
            })?;

        info!("Read-side surface listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| ServerError::StartupFailed {
                details: format!("Server error: {}", e),
            })?;

        info!("Read-side surface stopped");
        Ok(())
    }
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/live", get(live_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

fn jpeg_response(bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        bytes,
    )
        .into_response()
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Serve the last cached frame as JPEG.
///
/// Never reads from the camera: if no frame has been cached yet the camera
/// is down or still connecting, and the client gets a 503 immediately.
async fn live_handler(State(state): State<ServerState>) -> Response {
    let frame = match state.status.latest_frame() {
        Some(frame) => frame,
        None => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "No frame available - camera not connected or no frames captured yet",
            )
                .into_response();
        }
    };

    match frame.encode_jpeg(state.live_jpeg_quality) {
        Ok(bytes) => jpeg_response(bytes),
        Err(e) => {
            warn!("Failed to encode live frame: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode frame").into_response()
        }
    }
}

/// On-demand high-quality snapshot, if an external source is configured.
async fn snapshot_handler(State(state): State<ServerState>) -> Response {
    let source = match &state.snapshot {
        Some(source) => source,
        None => {
            return (StatusCode::SERVICE_UNAVAILABLE, "Snapshot unavailable").into_response();
        }
    };

    match source.fetch().await {
        Ok(bytes) => jpeg_response(bytes),
        Err(e) => {
            warn!("Snapshot fetch failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "Snapshot unavailable").into_response()
        }
    }
}

/// Liveness probe: camera connectivity plus the low-light flag.
async fn health_handler(State(state): State<ServerState>) -> Response {
    let diag = state.status.diagnostics();

    if diag.camera_connected {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "camera": "connected",
                "low_light": diag.low_light,
                "brightness": round3(diag.brightness),
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "camera": "disconnected",
            })),
        )
            .into_response()
    }
}

/// Diagnostics probe: frame/corruption counters and current motion state.
async fn status_handler(State(state): State<ServerState>) -> Response {
    let diag = state.status.diagnostics();

    Json(serde_json::json!({
        "camera_connected": diag.camera_connected,
        "low_light": diag.low_light,
        "brightness": round3(diag.brightness),
        "frame_errors": diag.frame_errors,
        "corrupted_frames": diag.corrupted_frames,
        "total_frames": diag.total_frames,
        "motion_area": diag.motion_area,
        "motion_min_area": diag.motion_min_area,
        "motion_detected": diag.motion_detected(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::supervisor::ConnectionHealth;
    use image::{Rgb, RgbImage};
    use std::time::SystemTime;

    fn test_state() -> ServerState {
        ServerState {
            status: Arc::new(StatusCache::new()),
            snapshot: None,
            live_jpeg_quality: 85,
        }
    }

    fn gradient_frame() -> Frame {
        let image = RgbImage::from_fn(64, 48, |x, y| {
            let v = ((x + y) % 256) as u8;
            Rgb([v, v, v])
        });
        Frame::new(0, SystemTime::now(), image)
    }

    #[tokio::test]
    async fn test_live_returns_503_without_frame() {
        let response = live_handler(State(test_state())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_live_serves_cached_jpeg() {
        let state = test_state();
        state.status.store_frame(&gradient_frame());

        let response = live_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_snapshot_503_when_unconfigured() {
        let response = snapshot_handler(State(test_state())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_reflects_camera_connectivity() {
        let state = test_state();

        let response = health_handler(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state
            .status
            .set_connection(true, ConnectionHealth::default());
        let response = health_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reports_diagnostics() {
        let state = test_state();
        state.status.set_motion(4200, 3000);
        state.status.set_brightness(0.12345, true);

        let response = status_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["motion_area"], 4200);
        assert_eq!(json["motion_min_area"], 3000);
        assert_eq!(json["motion_detected"], true);
        assert_eq!(json["low_light"], true);
        assert_eq!(json["brightness"], 0.123);
    }
}
