use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::frame::Frame;

/// Interval between retention sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Result of one retention sweep
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupResult {
    pub day_dirs_removed: usize,
    pub month_dirs_removed: usize,
}

/// Date-partitioned artifact store.
///
/// Artifacts live under `<root>/YYYY-MM/DD/<YYYYmmdd_HHMMSS_mmm>.<ext>`.
/// Downstream consumers resolve the relative paths published on the queue
/// against the same root, and the storage/API collaborators traverse this
/// layout directly, so it must not change shape.
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative_path(timestamp: &DateTime<Utc>, extension: &str) -> String {
        format!(
            "{}/{}/{}.{}",
            timestamp.format("%Y-%m"),
            timestamp.format("%d"),
            timestamp.format("%Y%m%d_%H%M%S_%3f"),
            extension
        )
    }

    async fn prepare(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let absolute = self.root.join(relative);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::DirectoryCreation {
                    path: parent.display().to_string(),
                    source: e,
                })?;
        }
        Ok(absolute)
    }

    /// Write pre-encoded JPEG bytes; returns the root-relative path
    pub async fn save_jpeg_bytes(
        &self,
        bytes: &[u8],
        timestamp: &DateTime<Utc>,
    ) -> Result<String, StorageError> {
        let relative = Self::relative_path(timestamp, "jpg");
        let absolute = self.prepare(&relative).await?;

        fs::write(&absolute, bytes)
            .await
            .map_err(|e| StorageError::Write {
                path: absolute.display().to_string(),
                source: e,
            })?;

        debug!("Saved image: {}", relative);
        Ok(relative)
    }

    /// Encode and persist a frame as a high-quality JPEG
    pub async fn save_image(
        &self,
        frame: &Frame,
        timestamp: &DateTime<Utc>,
        quality: u8,
    ) -> Result<String, StorageError> {
        let bytes = frame
            .encode_jpeg(quality)
            .map_err(|e| StorageError::Encode {
                details: e.to_string(),
            })?;
        self.save_jpeg_bytes(&bytes, timestamp).await
    }

    /// Allocate the clip path for this timestamp, creating parent directories.
    ///
    /// Returns (absolute path for the encoder, root-relative path for the
    /// queue message).
    pub async fn clip_destination(
        &self,
        timestamp: &DateTime<Utc>,
    ) -> Result<(PathBuf, String), StorageError> {
        let relative = Self::relative_path(timestamp, "mp4");
        let absolute = self.prepare(&relative).await?;
        Ok((absolute, relative))
    }

    /// Delete day partitions older than the retention window.
    pub async fn sweep_expired(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<CleanupResult, StorageError> {
        let cutoff = (now - ChronoDuration::days(retention_days as i64)).date_naive();
        let mut result = CleanupResult::default();

        let mut months = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            // A missing root just means nothing has been captured yet
            Err(_) => return Ok(result),
        };

        while let Some(month_entry) =
            months
                .next_entry()
                .await
                .map_err(|e| StorageError::Sweep {
                    details: e.to_string(),
                })?
        {
            let month_name = month_entry.file_name().to_string_lossy().to_string();
            if !month_entry.path().is_dir() {
                continue;
            }

            let mut days = match fs::read_dir(month_entry.path()).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Some(day_entry) =
                days.next_entry()
                    .await
                    .map_err(|e| StorageError::Sweep {
                        details: e.to_string(),
                    })?
            {
                let day_name = day_entry.file_name().to_string_lossy().to_string();
                let date = match NaiveDate::parse_from_str(
                    &format!("{}-{}", month_name, day_name),
                    "%Y-%m-%d",
                ) {
                    Ok(date) => date,
                    // Unknown directory shapes are left alone
                    Err(_) => continue,
                };

                if date < cutoff {
                    match fs::remove_dir_all(day_entry.path()).await {
                        Ok(()) => {
                            info!("Removed expired partition {}/{}", month_name, day_name);
                            result.day_dirs_removed += 1;
                        }
                        Err(e) => warn!(
                            "Failed to remove partition {}/{}: {}",
                            month_name, day_name, e
                        ),
                    }
                }
            }

            // Drop month directories that are now empty
            if let Ok(mut remaining) = fs::read_dir(month_entry.path()).await {
                if matches!(remaining.next_entry().await, Ok(None))
                    && fs::remove_dir(month_entry.path()).await.is_ok()
                {
                    result.month_dirs_removed += 1;
                }
            }
        }

        Ok(result)
    }
}

/// Periodic retention sweep; not part of the real-time capture path.
pub async fn run_retention_sweeper(
    store: Arc<ImageStore>,
    retention_days: u32,
    cancel: CancellationToken,
) {
    info!(
        "Retention sweeper started (keeping {} days)",
        retention_days
    );

    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match store.sweep_expired(retention_days, Utc::now()).await {
                    Ok(result) if result.day_dirs_removed > 0 => {
                        info!(
                            "Retention sweep removed {} day partitions",
                            result.day_dirs_removed
                        );
                    }
                    Ok(_) => debug!("Retention sweep found nothing to remove"),
                    Err(e) => warn!("Retention sweep failed: {}", e),
                }
            }
        }
    }

    info!("Retention sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::{Rgb, RgbImage};
    use std::time::SystemTime;

    fn test_frame() -> Frame {
        let image = RgbImage::from_fn(32, 24, |x, y| {
            let v = ((x + y) % 256) as u8;
            Rgb([v, v, v])
        });
        Frame::new(0, SystemTime::now(), image)
    }

    fn test_timestamp() -> DateTime<Utc> {
        Utc.timestamp_opt(1_786_624_496, 789_000_000).unwrap()
    }

    #[test]
    fn test_partitioned_layout() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 6, 12, 34, 56).unwrap()
            + ChronoDuration::milliseconds(789);
        assert_eq!(
            ImageStore::relative_path(&ts, "jpg"),
            "2026-08/06/20260806_123456_789.jpg"
        );
        assert_eq!(
            ImageStore::relative_path(&ts, "mp4"),
            "2026-08/06/20260806_123456_789.mp4"
        );
    }

    #[tokio::test]
    async fn test_save_image_writes_under_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        let ts = test_timestamp();
        let relative = store.save_image(&test_frame(), &ts, 95).await.unwrap();

        let absolute = dir.path().join(&relative);
        assert!(absolute.exists());

        let bytes = std::fs::read(&absolute).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_clip_destination_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        let ts = test_timestamp();
        let (absolute, relative) = store.clip_destination(&ts).await.unwrap();
        assert!(relative.ends_with(".mp4"));
        assert!(absolute.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        for (month, day) in [("2026-06", "01"), ("2026-08", "05")] {
            let partition = dir.path().join(month).join(day);
            std::fs::create_dir_all(&partition).unwrap();
            std::fs::write(partition.join("x.jpg"), b"stale").unwrap();
        }

        let now = Utc.with_ymd_and_hms(2026, 8, 6, 0, 0, 0).unwrap();
        let result = store.sweep_expired(30, now).await.unwrap();

        assert_eq!(result.day_dirs_removed, 1);
        assert_eq!(result.month_dirs_removed, 1);
        assert!(!dir.path().join("2026-06").exists());
        assert!(dir.path().join("2026-08/05/x.jpg").exists());
    }

    #[tokio::test]
    async fn test_sweep_on_missing_root_is_noop() {
        let store = ImageStore::new("/nonexistent/perchcam-test-root");
        let result = store.sweep_expired(7, Utc::now()).await.unwrap();
        assert_eq!(result.day_dirs_removed, 0);
    }
}
