use std::io::Read;
use std::time::Duration;
use tracing::debug;

use crate::error::CaptureError;

/// Upper bound on a fetched snapshot body
const MAX_SNAPSHOT_BYTES: usize = 10 * 1024 * 1024;

/// On-demand high-quality snapshot endpoint.
///
/// When configured, a capture fetches its still from here instead of
/// sampling the live stream: the dedicated endpoint returns a sharper,
/// higher-resolution image than the preview frames.
pub struct SnapshotSource {
    url: String,
    agent: ureq::Agent,
}

impl SnapshotSource {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url: url.to_string(),
            agent,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch one JPEG snapshot.
    ///
    /// The blocking HTTP client runs on the blocking pool so the caller's
    /// task is never wedged on a slow endpoint.
    pub async fn fetch(&self) -> Result<Vec<u8>, CaptureError> {
        let url = self.url.clone();
        let agent = self.agent.clone();

        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, CaptureError> {
            let response = agent.get(&url).call().map_err(|e| {
                CaptureError::SnapshotFetch {
                    details: e.to_string(),
                }
            })?;

            let mut bytes = Vec::new();
            response
                .into_reader()
                .take(MAX_SNAPSHOT_BYTES as u64 + 1)
                .read_to_end(&mut bytes)
                .map_err(|e| CaptureError::SnapshotFetch {
                    details: e.to_string(),
                })?;

            if bytes.len() > MAX_SNAPSHOT_BYTES {
                return Err(CaptureError::SnapshotFetch {
                    details: format!("snapshot exceeds {} bytes", MAX_SNAPSHOT_BYTES),
                });
            }

            Ok(bytes)
        })
        .await
        .map_err(|e| CaptureError::SnapshotFetch {
            details: e.to_string(),
        })??;

        debug!("Fetched snapshot: {} bytes", bytes.len());
        Ok(bytes)
    }
}
