use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{close, open};
use tracing::{debug, info};

use crate::config::MotionConfig;
use crate::frame::Frame;

/// Mask value for confident foreground pixels
const FOREGROUND: u8 = 255;
/// Mask value for marginal pixels (shadow band); discarded at binarization
const SHADOW: u8 = 127;
/// Variance assigned to freshly initialized model pixels
const INITIAL_VARIANCE: f32 = 64.0;
/// Variance floor preventing a settled model from flagging sensor noise
const MIN_VARIANCE: f32 = 4.0;
/// Variance ceiling so sustained churn cannot inflate a pixel's variance
/// until real foreground stops clearing the threshold
const MAX_VARIANCE: f32 = 64.0;
/// Structuring element radius for the morphological cleanup passes (5x5)
const MORPH_RADIUS: u8 = 2;

/// Per-frame motion measurement, recomputed from scratch every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionReading {
    /// Nonzero pixels in the cleaned foreground mask
    pub foreground_pixels: u32,
    /// Configured area threshold the count is compared against
    pub min_area: u32,
    /// `foreground_pixels > min_area`, forced false during warmup
    pub detected: bool,
}

impl MotionReading {
    fn quiet(min_area: u32) -> Self {
        Self {
            foreground_pixels: 0,
            min_area,
            detected: false,
        }
    }
}

/// Per-pixel running Gaussian background model.
///
/// Every processed frame is assimilated, whether or not motion was flagged,
/// so exposure and white-balance drift is absorbed instead of triggering.
struct BackgroundModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
}

impl BackgroundModel {
    fn from_frame(blurred: &GrayImage) -> Self {
        let (width, height) = blurred.dimensions();
        let mean: Vec<f32> = blurred.as_raw().iter().map(|&v| v as f32).collect();
        let variance = vec![INITIAL_VARIANCE; mean.len()];

        Self {
            width,
            height,
            mean,
            variance,
        }
    }

    fn matches(&self, blurred: &GrayImage) -> bool {
        blurred.dimensions() == (self.width, self.height)
    }

    /// Classify each pixel against the model: foreground, shadow band, or
    /// background, by squared distance relative to the pixel's variance.
    fn foreground_mask(&self, blurred: &GrayImage, var_threshold: f64) -> GrayImage {
        let threshold = var_threshold as f32;
        let mut mask = vec![0u8; self.mean.len()];

        for (i, &value) in blurred.as_raw().iter().enumerate() {
            let d = value as f32 - self.mean[i];
            let d2 = d * d;
            let sigma2 = self.variance[i].max(MIN_VARIANCE);

            if d2 > threshold * sigma2 {
                mask[i] = FOREGROUND;
            } else if d2 > 0.5 * threshold * sigma2 {
                mask[i] = SHADOW;
            }
        }

        GrayImage::from_raw(self.width, self.height, mask)
            .expect("mask buffer matches model dimensions")
    }

    /// Fold the frame into the running mean and variance.
    fn assimilate(&mut self, blurred: &GrayImage, learning_rate: f32) {
        for (i, &value) in blurred.as_raw().iter().enumerate() {
            let d = value as f32 - self.mean[i];
            self.mean[i] += learning_rate * d;
            self.variance[i] = (self.variance[i] + learning_rate * (d * d - self.variance[i]))
                .clamp(MIN_VARIANCE, MAX_VARIANCE);
        }
    }
}

/// Adaptive motion detector.
///
/// Per frame: blur to suppress sensor noise, classify against the background
/// model, binarize (discarding the shadow band), clean up with a
/// close-then-open pass, and count the surviving foreground pixels.
pub struct MotionDetector {
    config: MotionConfig,
    warmup_frames: u32,
    frames_seen: u64,
    model: Option<BackgroundModel>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig, warmup_frames: u32) -> Self {
        info!(
            "Initializing motion detector (warmup: {} frames, min_area: {})",
            warmup_frames, config.min_area
        );

        Self {
            config,
            warmup_frames,
            frames_seen: 0,
            model: None,
        }
    }

    /// Whether the model is still training and detection is suppressed
    pub fn is_warming_up(&self) -> bool {
        self.frames_seen < self.warmup_frames as u64
    }

    /// Discard the model so it retrains from the next frame.
    ///
    /// Called when the camera is recreated on reconnect; never called for
    /// individual capture events.
    pub fn reset(&mut self) {
        debug!("Resetting background model");
        self.model = None;
        self.frames_seen = 0;
    }

    /// Process one frame: assimilate it into the model and report motion.
    pub fn process(&mut self, frame: &Frame) -> MotionReading {
        let gray = frame.to_luma();
        let blurred = gaussian_blur_f32(&gray, self.config.blur_sigma);

        let model = match &mut self.model {
            Some(model) if model.matches(&blurred) => model,
            _ => {
                debug!(
                    "Initializing background model from frame {} ({}x{})",
                    frame.id,
                    blurred.width(),
                    blurred.height()
                );
                self.model = Some(BackgroundModel::from_frame(&blurred));
                self.frames_seen = 1;
                return MotionReading::quiet(self.config.min_area);
            }
        };

        let warming_up = self.frames_seen < self.warmup_frames as u64;
        self.frames_seen += 1;

        if warming_up {
            model.assimilate(&blurred, self.config.learning_rate);
            if self.frames_seen == self.warmup_frames as u64 {
                info!(
                    "Background model warmed up after {} frames",
                    self.warmup_frames
                );
            }
            return MotionReading::quiet(self.config.min_area);
        }

        let mask = model.foreground_mask(&blurred, self.config.var_threshold);
        model.assimilate(&blurred, self.config.learning_rate);

        let binary = imageproc::contrast::threshold(&mask, self.config.binary_threshold);
        let cleaned = open(
            &close(&binary, Norm::LInf, MORPH_RADIUS),
            Norm::LInf,
            MORPH_RADIUS,
        );

        let foreground_pixels = cleaned.as_raw().iter().filter(|&&v| v > 0).count() as u32;
        let detected = foreground_pixels > self.config.min_area;

        if detected {
            debug!(
                "Motion: {} foreground pixels (threshold {})",
                foreground_pixels, self.config.min_area
            );
        }

        MotionReading {
            foreground_pixels,
            min_area: self.config.min_area,
            detected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::time::SystemTime;

    fn test_config() -> MotionConfig {
        MotionConfig {
            warmup_seconds: 1,
            var_threshold: 35.0,
            binary_threshold: 175,
            min_area: 100,
            blur_sigma: 1.5,
            learning_rate: 0.05,
        }
    }

    fn static_frame(id: u64) -> Frame {
        let image = RgbImage::from_fn(64, 48, |x, y| {
            let v = ((x * 2 + y) % 200) as u8;
            Rgb([v, v, v])
        });
        Frame::new(id, SystemTime::now(), image)
    }

    fn blob_frame(id: u64, x0: u32) -> Frame {
        let image = RgbImage::from_fn(64, 48, |x, y| {
            if x >= x0 && x < x0 + 24 && y >= 10 && y < 34 {
                Rgb([255, 255, 255])
            } else {
                let v = ((x * 2 + y) % 200) as u8;
                Rgb([v, v, v])
            }
        });
        Frame::new(id, SystemTime::now(), image)
    }

    fn warmed_detector() -> MotionDetector {
        let mut detector = MotionDetector::new(test_config(), 10);
        for i in 0..10 {
            detector.process(&static_frame(i));
        }
        assert!(!detector.is_warming_up());
        detector
    }

    #[test]
    fn test_static_scene_produces_no_motion() {
        let mut detector = warmed_detector();
        for i in 10..30 {
            let reading = detector.process(&static_frame(i));
            assert!(!reading.detected, "frame {} flagged motion", i);
        }
    }

    #[test]
    fn test_blob_triggers_detection() {
        let mut detector = warmed_detector();
        let reading = detector.process(&blob_frame(10, 20));
        assert!(reading.detected);
        assert!(reading.foreground_pixels > reading.min_area);
    }

    #[test]
    fn test_reading_invariant() {
        let mut detector = warmed_detector();
        for i in 0..5 {
            let reading = detector.process(&blob_frame(10 + i, 10 + i as u32));
            assert_eq!(
                reading.detected,
                reading.foreground_pixels > reading.min_area
            );
        }
    }

    #[test]
    fn test_warmup_suppresses_detection() {
        let mut detector = MotionDetector::new(test_config(), 20);
        // Even a large blob must not be reported during warmup
        for i in 0..20 {
            let reading = detector.process(&blob_frame(i, (i % 30) as u32));
            assert!(!reading.detected, "warmup frame {} flagged motion", i);
        }
    }

    #[test]
    fn test_gradual_brightness_drift_absorbed() {
        let mut detector = warmed_detector();

        // Simulate slow exposure drift: +1 brightness step per frame
        for step in 0..40u32 {
            let image = RgbImage::from_fn(64, 48, |x, y| {
                let v = (((x * 2 + y) % 200) as u32 + step).min(255) as u8;
                Rgb([v, v, v])
            });
            let frame = Frame::new(100 + step as u64, SystemTime::now(), image);
            let reading = detector.process(&frame);
            assert!(!reading.detected, "drift step {} flagged motion", step);
        }
    }

    #[test]
    fn test_reset_retrains_model() {
        let mut detector = warmed_detector();
        detector.reset();
        assert!(detector.is_warming_up());

        let reading = detector.process(&blob_frame(0, 20));
        assert!(!reading.detected);
    }
}
