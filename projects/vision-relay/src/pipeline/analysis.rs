// Per-frame analysis: mean color, JPEG payload, frame rate and detections

use crate::error::FrameError;
use crate::pipeline::detection::DetectionAdapter;
use crate::pipeline::types::{DetectionResult, EncodedImage, Frame, MeanColor};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// Frames smaller than this in either dimension never reach the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinFrameSize {
    pub width: u32,
    pub height: u32,
}

impl Default for MinFrameSize {
    fn default() -> Self {
        Self {
            width: 480,
            height: 270,
        }
    }
}

impl MinFrameSize {
    pub fn admits(&self, width: u32, height: u32) -> bool {
        width >= self.width && height >= self.height
    }
}

/// Computes `1000 / (ts - previous_ts)` against the last committed timestamp.
#[derive(Debug, Default)]
pub struct FpsTracker {
    last_timestamp_ms: Option<f64>,
}

impl FpsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame rate for a frame stamped `timestamp_ms`, without recording it
    pub fn rate_at(&self, timestamp_ms: f64) -> f64 {
        match self.last_timestamp_ms {
            Some(previous) if timestamp_ms > previous => 1000.0 / (timestamp_ms - previous),
            _ => 0.0,
        }
    }

    /// Record a successfully processed frame.
    pub fn commit(&mut self, timestamp_ms: f64) {
        self.last_timestamp_ms = Some(timestamp_ms);
    }
}

/// Integer mean of each channel (truncated)
pub fn mean_color(image: &RgbImage) -> MeanColor {
    let pixels = image.width() as u64 * image.height() as u64;
    if pixels == 0 {
        return MeanColor { r: 0, g: 0, b: 0 };
    }

    let mut sums = [0u64; 3];
    for pixel in image.pixels() {
        sums[0] += pixel[0] as u64;
        sums[1] += pixel[1] as u64;
        sums[2] += pixel[2] as u64;
    }

    MeanColor {
        r: (sums[0] / pixels) as u8,
        g: (sums[1] / pixels) as u8,
        b: (sums[2] / pixels) as u8,
    }
}

pub fn encode_jpeg_base64(image: &RgbImage, quality: u8) -> Result<EncodedImage, FrameError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(image)?;

    Ok(EncodedImage {
        width: image.width(),
        height: image.height(),
        jpeg_base64: base64::engine::general_purpose::STANDARD.encode(&jpeg),
    })
}

/// Everything computed from a frame except its timing
pub struct FrameAnalysis {
    pub mean_color: MeanColor,
    pub image: EncodedImage,
    pub detections: Vec<DetectionResult>,
    pub detect_ms: f64,
}

/// CPU-bound part of frame processing. Runs on the blocking pool.
pub fn analyze_frame(
    adapter: &DetectionAdapter,
    frame: &Frame,
    jpeg_quality: u8,
) -> Result<FrameAnalysis, FrameError> {
    let mean_color = mean_color(&frame.image);
    let image = encode_jpeg_base64(&frame.image, jpeg_quality)?;

    let start_inst = std::time::Instant::now();
    let detections = adapter.detect(&frame.image)?;
    let detect_ms = start_inst.elapsed().as_secs_f64() * 1000.0;

    Ok(FrameAnalysis {
        mean_color,
        image,
        detections,
        detect_ms,
    })
}
