use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::camera::FrameSource;
use crate::config::PerchcamConfig;
use crate::error::Result;
use crate::pipeline::CapturePipeline;
use crate::queue::RedisEventPublisher;
use crate::server::ReadSurface;
use crate::snapshot::SnapshotSource;
use crate::status::StatusCache;
use crate::storage::{run_retention_sweeper, ImageStore};

/// How long component tasks get to wind down after cancellation
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Wires the capture loop, read-side surface, and retention sweeper together
/// and runs them until a shutdown signal arrives.
pub struct PerchcamApp {
    config: PerchcamConfig,
}

impl PerchcamApp {
    pub fn new(config: PerchcamConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<i32> {
        let config = self.config;
        let cancel = CancellationToken::new();

        let status = Arc::new(StatusCache::new());
        let storage = Arc::new(ImageStore::new(&config.system.images_path));

        let snapshot = config.capture.snapshot_url.as_ref().map(|url| {
            info!("Using on-demand snapshot source: {}", url);
            Arc::new(SnapshotSource::new(
                url,
                Duration::from_secs(config.capture.snapshot_timeout_seconds),
            ))
        });

        let publisher = RedisEventPublisher::new(&config.queue.url, &config.queue.name)?;

        // Read-side surface starts before the camera so cached frames (or
        // 503s) are served even while the camera is still connecting
        let server = ReadSurface::new(
            config.http.clone(),
            Arc::clone(&status),
            snapshot.clone(),
        );
        let server_cancel = cancel.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.start(server_cancel).await {
                error!("Read-side surface failed: {}", e);
            }
        });

        let retention_task = if config.system.retention_enabled {
            Some(tokio::spawn(run_retention_sweeper(
                Arc::clone(&storage),
                config.system.retention_days,
                cancel.clone(),
            )))
        } else {
            None
        };

        let pipeline_task = spawn_pipeline(
            config,
            storage,
            publisher,
            snapshot,
            status,
            cancel.clone(),
        )?;

        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, stopping components");
        cancel.cancel();

        // The pipeline releases the camera handle on its way out
        join_with_timeout("capture pipeline", pipeline_task).await;
        join_with_timeout("read-side surface", server_task).await;
        if let Some(task) = retention_task {
            join_with_timeout("retention sweeper", task).await;
        }

        info!("Shutdown complete");
        Ok(0)
    }
}

#[cfg(all(target_os = "linux", feature = "camera-gstreamer"))]
fn spawn_pipeline(
    config: PerchcamConfig,
    storage: Arc<ImageStore>,
    publisher: RedisEventPublisher,
    snapshot: Option<Arc<SnapshotSource>>,
    status: Arc<StatusCache>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let source = crate::camera::GstCamera::new(config.camera.clone())?;
    Ok(spawn_pipeline_with(
        config, source, storage, publisher, snapshot, status, cancel,
    ))
}

#[cfg(not(all(target_os = "linux", feature = "camera-gstreamer")))]
fn spawn_pipeline(
    config: PerchcamConfig,
    storage: Arc<ImageStore>,
    publisher: RedisEventPublisher,
    snapshot: Option<Arc<SnapshotSource>>,
    status: Arc<StatusCache>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    warn!("GStreamer capture is only available on Linux; using the synthetic camera");
    let source = crate::camera::SyntheticCamera::new(config.camera.clone());
    Ok(spawn_pipeline_with(
        config, source, storage, publisher, snapshot, status, cancel,
    ))
}

fn spawn_pipeline_with<S: FrameSource + 'static>(
    config: PerchcamConfig,
    source: S,
    storage: Arc<ImageStore>,
    publisher: RedisEventPublisher,
    snapshot: Option<Arc<SnapshotSource>>,
    status: Arc<StatusCache>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let pipeline = CapturePipeline::new(
        config,
        source,
        storage,
        Box::new(publisher),
        snapshot,
        status,
    );
    tokio::spawn(pipeline.run(cancel))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt");
    }
}

async fn join_with_timeout(name: &str, task: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
        Ok(Ok(())) => info!("{} stopped cleanly", name),
        Ok(Err(e)) => error!("{} task panicked: {}", name, e),
        Err(_) => warn!("{} did not stop within {:?}", name, SHUTDOWN_TIMEOUT),
    }
}
