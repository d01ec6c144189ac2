// Shared doubles for pipeline and orchestrator tests

use crate::error::DetectionError;
use crate::pipeline::detection::{DetectionAdapter, DetectionConfig, DetectionEngine, RawDetection};
use crate::pipeline::types::Frame;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
    Frame::new(RgbImage::from_pixel(width, height, Rgb(rgb)))
}

/// Engine that counts calls, can stall, and can fail its first calls.
#[derive(Clone, Default)]
pub struct CountingEngine {
    pub calls: Arc<AtomicUsize>,
    pub stall: Duration,
    pub fail_first: usize,
    pub detections: Vec<RawDetection>,
}

impl DetectionEngine for CountingEngine {
    fn infer(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>, DetectionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.stall.is_zero() {
            std::thread::sleep(self.stall);
        }
        if call < self.fail_first {
            return Err(DetectionError::Inference("scripted failure".to_string()));
        }
        Ok(self.detections.clone())
    }
}

pub fn adapter(engine: CountingEngine) -> Arc<DetectionAdapter> {
    Arc::new(DetectionAdapter::new(
        Box::new(engine),
        DetectionConfig::default(),
    ))
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
