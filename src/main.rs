use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use perchcam::{PerchcamApp, PerchcamConfig};

#[derive(Parser, Debug)]
#[command(name = "perchcam")]
#[command(about = "Motion-triggered camera capture service feeding a detection work queue")]
#[command(version)]
#[command(long_about = "Watches a camera feed, detects motion against an adaptive background \
model, captures the sharpest frame of each motion episode, and publishes capture events onto a \
durable work queue for a downstream detection stage. Exposes a read-side HTTP surface for live \
view, health, and diagnostics.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "perchcam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the service")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting perchcam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match PerchcamConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    config.validate()?;

    let exit_code = PerchcamApp::new(config).run().await.map_err(|e| {
        error!("Service error: {}", e);
        e
    })?;

    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("perchcam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .boxed(),
        Some("pretty") => fmt::layer()
            .pretty()
            .with_target(true)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
        None => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Perchcam Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    let default_config = r#"[camera]
# Camera source: a device index (e.g. "0" for /dev/video0) or an rtsp:// URL
source = "0"
# Requested resolution (width, height), applied best-effort
resolution = [1920, 1080]
# Target frames per second for the capture loop
fps = 15
# Per-read timeout in milliseconds
read_timeout_ms = 2000

[motion]
# Seconds of warmup before motion is reported
warmup_seconds = 5
# Background model sensitivity (lower = more sensitive)
var_threshold = 35.0
# Binarization threshold on the foreground mask
binary_threshold = 175
# Minimum foreground pixel count to flag motion
min_area = 3000

[capture]
# Seconds motion must persist before a capture triggers
motion_delay_seconds = 1.5
# Minimum spacing between captures, in seconds
cooldown_seconds = 5.0
# Burst sample count and spacing
samples = 5
sample_interval_ms = 100
# Frames discarded before sampling
buffer_flush = 10
# JPEG quality for persisted stills (1-100)
jpeg_quality = 95
# Optional on-demand snapshot endpoint (takes precedence over the burst)
# snapshot_url = "http://127.0.0.1:8081/snapshot"

[clip]
# Export a short video clip alongside each still
enabled = true
duration_seconds = 3.0
fps = 15.0

[queue]
# Broker connection URL and queue names
url = "redis://127.0.0.1:6379"
name = "images"
detections_name = "detections"

[http]
# Read-side surface bind address
host = "0.0.0.0"
port = 8080

[system]
# Root directory for the date-partitioned artifact tree
images_path = "data/images"
# Consecutive failures before the camera is reconnected
max_consecutive_errors = 50
# Fixed delay around reconnect attempts, in seconds
reconnect_delay_seconds = 5.0
# Mean-luminance fraction below which the scene counts as low light
low_light_threshold = 0.2
# Artifact retention sweep
retention_enabled = true
retention_days = 30
"#;

    println!("{}", default_config);
}
