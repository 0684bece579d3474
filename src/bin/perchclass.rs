use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use perchcam::error::QueueError;
use perchcam::{CaptureEvent, ConsumerLoop, PerchcamConfig, QueueConsumer};

/// Skeletal queue consumer demonstrating the contract a detection stage
/// implements: blocking-pop the capture queue, resolve images under the
/// shared root, and treat redelivered paths as idempotent no-ops.
#[derive(Parser, Debug)]
#[command(name = "perchclass")]
#[command(about = "Drains the capture queue and logs delivered events")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "perchcam.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

struct LoggingConsumer {
    image_root: PathBuf,
    seen: HashSet<String>,
}

#[async_trait]
impl QueueConsumer for LoggingConsumer {
    async fn handle(&mut self, event: CaptureEvent) -> Result<(), QueueError> {
        // At-least-once delivery: a path we already processed is a duplicate
        // redelivery, not an error
        if !self.seen.insert(event.image_path.clone()) {
            info!("Skipping duplicate delivery: {}", event.image_path);
            return Ok(());
        }

        let resolved = self.image_root.join(&event.image_path);
        if !resolved.exists() {
            warn!("Image not found under root: {}", resolved.display());
            return Ok(());
        }

        info!(
            "Received capture from {} at {}: {}{}",
            event.source,
            event.timestamp,
            event.image_path,
            event
                .video_path
                .as_deref()
                .map(|v| format!(" (clip: {})", v))
                .unwrap_or_default()
        );

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("perchclass={0},perchcam={0}", filter))),
        )
        .init();

    let config = PerchcamConfig::load_from_file(&args.config)?;

    info!(
        "Consuming queue '{}' at {}",
        config.queue.name, config.queue.url
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupt received, stopping consumer");
        signal_cancel.cancel();
    });

    let mut consumer = LoggingConsumer {
        image_root: PathBuf::from(&config.system.images_path),
        seen: HashSet::new(),
    };

    let consumer_loop = ConsumerLoop::new(&config.queue.url, &config.queue.name)?;
    consumer_loop.run(&mut consumer, cancel).await?;

    Ok(())
}
