use image::GrayImage;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::camera::FrameSource;
use crate::error::CaptureError;
use crate::frame::{Frame, FrameValidator};

/// Variance of the Laplacian response over the image.
///
/// Sharper images carry more high-frequency edge energy; motion blur
/// suppresses it, so higher is sharper.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut responses = Vec::with_capacity(((width - 2) * (height - 2)) as usize);
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let center = gray.get_pixel(x, y)[0] as f64;
            let response = gray.get_pixel(x, y - 1)[0] as f64
                + gray.get_pixel(x, y + 1)[0] as f64
                + gray.get_pixel(x - 1, y)[0] as f64
                + gray.get_pixel(x + 1, y)[0] as f64
                - 4.0 * center;
            responses.push(response);
        }
    }

    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n
}

/// Picks the least-blurred frame out of a short burst.
pub struct SharpnessRanker {
    /// Number of frames to sample
    pub samples: u32,
    /// Delay between samples so they reflect distinct moments
    pub sample_interval: Duration,
    /// Frames discarded up front to drain decoder-buffered duplicates
    pub buffer_flush: u32,
}

impl SharpnessRanker {
    /// Score a frame's sharpness
    pub fn score(frame: &Frame) -> f64 {
        laplacian_variance(&frame.to_luma())
    }

    /// Return the sharpest frame among the candidates.
    ///
    /// The result is always a member of the input list.
    pub fn rank(frames: Vec<Frame>) -> Option<Frame> {
        frames
            .into_iter()
            .map(|frame| {
                let score = Self::score(&frame);
                (frame, score)
            })
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(frame, score)| {
                debug!("Selected burst frame with sharpness {:.1}", score);
                frame
            })
    }

    /// Sample a burst from the source and return the sharpest valid frame.
    pub async fn sample_burst(
        &self,
        source: &mut dyn FrameSource,
        validator: &FrameValidator,
    ) -> Result<Frame, CaptureError> {
        // Drain already-buffered frames so the samples are fresh
        for _ in 0..self.buffer_flush {
            let _ = source.read().await;
        }

        let mut candidates = Vec::with_capacity(self.samples as usize);
        for i in 0..self.samples {
            match source.read().await {
                Ok(frame) if validator.is_valid(&frame) => candidates.push(frame),
                Ok(frame) => {
                    warn!("Discarding invalid burst sample (frame {})", frame.id);
                }
                Err(e) => {
                    warn!("Burst sample read failed: {}", e);
                }
            }

            if i + 1 < self.samples {
                sleep(self.sample_interval).await;
            }
        }

        Self::rank(candidates).ok_or(CaptureError::BurstFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CameraError;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;
    use std::time::SystemTime;

    fn checkerboard_frame(id: u64) -> Frame {
        let image = RgbImage::from_fn(64, 48, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        Frame::new(id, SystemTime::now(), image)
    }

    fn smooth_frame(id: u64) -> Frame {
        let image = RgbImage::from_fn(64, 48, |x, _| {
            let v = (x * 255 / 64) as u8;
            Rgb([v, v, v])
        });
        Frame::new(id, SystemTime::now(), image)
    }

    #[test]
    fn test_sharp_scores_higher_than_smooth() {
        let sharp = SharpnessRanker::score(&checkerboard_frame(0));
        let smooth = SharpnessRanker::score(&smooth_frame(1));
        assert!(sharp > smooth, "sharp {} vs smooth {}", sharp, smooth);
    }

    #[test]
    fn test_rank_returns_member_with_max_score() {
        let frames = vec![smooth_frame(1), checkerboard_frame(2), smooth_frame(3)];
        let scores: Vec<f64> = frames.iter().map(SharpnessRanker::score).collect();
        let best_score = scores.iter().cloned().fold(f64::MIN, f64::max);

        let winner = SharpnessRanker::rank(frames).unwrap();
        assert_eq!(winner.id, 2);
        assert_eq!(SharpnessRanker::score(&winner), best_score);
    }

    #[test]
    fn test_rank_empty_is_none() {
        assert!(SharpnessRanker::rank(Vec::new()).is_none());
    }

    struct StubSource {
        reads: VecDeque<Result<Frame, CameraError>>,
    }

    #[async_trait]
    impl FrameSource for StubSource {
        async fn open(&mut self) -> Result<(), CameraError> {
            Ok(())
        }

        async fn read(&mut self) -> Result<Frame, CameraError> {
            self.reads.pop_front().unwrap_or(Err(CameraError::Read {
                details: "exhausted".to_string(),
            }))
        }

        async fn close(&mut self) {}

        fn is_open(&self) -> bool {
            true
        }

        fn source_id(&self) -> String {
            "stub".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_skips_flushed_frames_and_picks_sharpest() {
        // Two buffered (stale) sharp frames that must be flushed, then a
        // smooth frame and a sharp one among the samples.
        let reads = VecDeque::from(vec![
            Ok(checkerboard_frame(0)),
            Ok(checkerboard_frame(1)),
            Ok(smooth_frame(2)),
            Ok(checkerboard_frame(3)),
        ]);

        let ranker = SharpnessRanker {
            samples: 2,
            sample_interval: Duration::from_millis(10),
            buffer_flush: 2,
        };

        let mut source = StubSource { reads };
        let best = ranker
            .sample_burst(&mut source, &FrameValidator::default())
            .await
            .unwrap();
        assert_eq!(best.id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_with_no_valid_samples_fails() {
        let ranker = SharpnessRanker {
            samples: 3,
            sample_interval: Duration::from_millis(10),
            buffer_flush: 0,
        };

        let mut source = StubSource {
            reads: VecDeque::new(),
        };
        let result = ranker
            .sample_burst(&mut source, &FrameValidator::default())
            .await;
        assert!(matches!(result, Err(CaptureError::BurstFailed)));
    }
}
