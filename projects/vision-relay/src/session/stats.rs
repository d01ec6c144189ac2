use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Counters shared between a session's workers and the introspection API
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_received: AtomicUsize,
    pub frames_processed: AtomicUsize,
    pub frames_skipped_small: AtomicUsize,
    pub frames_failed: AtomicUsize,
    /// Frame rate reported in the latest output message
    pub fps: RwLock<f64>,
    /// Smoothed analysis duration per frame
    pub detect_ms: RwLock<f64>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub frames_received: usize,
    pub frames_dropped: usize,
    pub frames_processed: usize,
    pub frames_skipped_small: usize,
    pub frames_failed: usize,
    pub fps: f64,
    pub detect_ms: f64,
}

impl SessionStats {
    pub fn record_processed(&self, fps: f64, detect_ms: f64) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut current) = self.fps.write() {
            *current = fps;
        }
        // Simple exponential moving average for smoothing durations
        if let Ok(mut current) = self.detect_ms.write() {
            if *current == 0.0 {
                *current = detect_ms;
            } else {
                *current = *current * 0.9 + detect_ms * 0.1;
            }
        }
    }

    /// `frames_dropped` is owned by the session's frame buffer
    pub fn snapshot(&self, frames_dropped: usize) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped,
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_skipped_small: self.frames_skipped_small.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            fps: self.fps.read().map(|v| *v).unwrap_or(0.0),
            detect_ms: self.detect_ms.read().map(|v| *v).unwrap_or(0.0),
        }
    }
}
