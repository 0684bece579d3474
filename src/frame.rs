use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, Luma, RgbImage};
use std::time::SystemTime;

use crate::error::CaptureError;

/// A single captured frame: a timestamped RGB pixel grid.
///
/// Frames are deep-copied (via `Clone`) whenever they cross a stage or thread
/// boundary; no stage ever holds a mutable alias into another stage's frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing frame identifier
    pub id: u64,
    /// Wall-clock time the frame was captured
    pub timestamp: SystemTime,
    /// Pixel data, RGB 8-bit per channel
    pub image: RgbImage,
}

impl Frame {
    pub fn new(id: u64, timestamp: SystemTime, image: RgbImage) -> Self {
        Self {
            id,
            timestamp,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Convert to 8-bit luminance using the Rec. 601 weights
    pub fn to_luma(&self) -> GrayImage {
        let mut gray = GrayImage::new(self.width(), self.height());
        for (x, y, rgb) in self.image.enumerate_pixels() {
            let value =
                (0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32) as u8;
            gray.put_pixel(x, y, Luma([value]));
        }
        gray
    }

    /// Mean luminance normalized to 0.0-1.0
    pub fn mean_brightness(&self) -> f64 {
        let pixels = self.image.pixels().len();
        if pixels == 0 {
            return 0.0;
        }

        let sum: f64 = self
            .image
            .pixels()
            .map(|rgb| {
                0.299 * rgb[0] as f64 + 0.587 * rgb[1] as f64 + 0.114 * rgb[2] as f64
            })
            .sum();

        sum / pixels as f64 / 255.0
    }

    /// Standard deviation across all channel samples
    pub fn pixel_std_dev(&self) -> f64 {
        let samples = self.image.as_raw();
        if samples.is_empty() {
            return 0.0;
        }

        let n = samples.len() as f64;
        let mean = samples.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = samples
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;

        variance.sqrt()
    }

    /// Encode the frame as JPEG at the given quality
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, CaptureError> {
        let mut buf = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        encoder
            .encode_image(&self.image)
            .map_err(|e| CaptureError::JpegEncoding {
                details: e.to_string(),
            })?;
        Ok(buf)
    }
}

/// Rejects frames that are unusable for analysis or capture.
///
/// The uniformity epsilon is intentionally tiny: it catches solid-color
/// buffers from a glitching decoder, not legitimately low-contrast scenes.
#[derive(Debug, Clone)]
pub struct FrameValidator {
    /// Minimum width and height in pixels
    pub min_dimension: u32,
    /// Standard-deviation floor below which a frame counts as uniform
    pub uniform_epsilon: f64,
}

impl Default for FrameValidator {
    fn default() -> Self {
        Self {
            min_dimension: 10,
            uniform_epsilon: 0.001,
        }
    }
}

impl FrameValidator {
    pub fn is_valid(&self, frame: &Frame) -> bool {
        if frame.width() < self.min_dimension || frame.height() < self.min_dimension {
            return false;
        }

        if frame.pixel_std_dev() < self.uniform_epsilon {
            return false;
        }

        true
    }
}
