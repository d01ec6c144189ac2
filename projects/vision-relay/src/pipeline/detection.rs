use crate::error::DetectionError;
use crate::pipeline::types::DetectionResult;
use image::{DynamicImage, RgbImage};
use std::sync::Mutex;
use usls::models::RTDETR;
use usls::{Config, Image};

/// A region reported by a detection engine, in absolute pixel coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub class_id: Option<usize>,
    pub confidence: f32,
    /// [x1, y1, x2, y2] in pixels
    pub bbox_px: [f32; 4],
}

/// Boundary to the external model. Called one inference at a time.
pub trait DetectionEngine: Send {
    fn infer(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectionError>;
}

/// Thresholds applied to engine output before results leave the adapter
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Optional class-id → label table for custom-trained models
    pub class_names: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            class_names: Vec::new(),
        }
    }
}

/// Process-wide wrapper around a detection engine that filters, deduplicates
/// and normalizes its output.
pub struct DetectionAdapter {
    engine: Mutex<Box<dyn DetectionEngine>>,
    config: DetectionConfig,
}

impl DetectionAdapter {
    pub fn new(engine: Box<dyn DetectionEngine>, config: DetectionConfig) -> Self {
        Self {
            engine: Mutex::new(engine),
            config,
        }
    }

    /// Run detection and return boxes normalized to the image size.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<DetectionResult>, DetectionError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectionError::InvalidImage { width, height });
        }

        let raw = {
            let mut engine = self.engine.lock().map_err(|_| DetectionError::Poisoned)?;
            engine.infer(image)?
        };

        let confident: Vec<RawDetection> = raw
            .into_iter()
            .filter(|d| d.confidence >= self.config.confidence_threshold)
            .collect();

        let results = nms(confident, self.config.iou_threshold)
            .into_iter()
            .map(|d| DetectionResult {
                label: self.label_for(&d),
                confidence: d.confidence.clamp(0.0, 1.0),
                bbox: normalize_bbox(d.bbox_px, width as f32, height as f32),
            })
            .collect();

        Ok(results)
    }

    fn label_for(&self, detection: &RawDetection) -> String {
        detection
            .class_id
            .and_then(|id| self.config.class_names.get(id))
            .cloned()
            .unwrap_or_else(|| detection.label.clone())
    }
}

/// Divide a pixel-space box by the image size, clamping to [0, 1].
pub fn normalize_bbox(bbox: [f32; 4], width: f32, height: f32) -> [f32; 4] {
    let [x1, y1, x2, y2] = bbox;
    [
        (x1 / width).clamp(0.0, 1.0),
        (y1 / height).clamp(0.0, 1.0),
        (x2 / width).clamp(0.0, 1.0),
        (y2 / height).clamp(0.0, 1.0),
    ]
}

/// Non-maximum suppression: keep the most confident box of every overlapping group
pub fn nms(detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    if detections.is_empty() {
        return detections;
    }

    // Sort by confidence (highest first)
    let mut sorted = detections;
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }

        for j in (i + 1)..sorted.len() {
            if suppressed[j] {
                continue;
            }

            if compute_iou(&sorted[i].bbox_px, &sorted[j].bbox_px) > iou_threshold {
                suppressed[j] = true;
            }
        }

        keep.push(sorted[i].clone());
    }

    keep
}

/// Compute Intersection over Union between two [x1, y1, x2, y2] boxes
fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// A wrapper around the USLS RT-DETR model. Corrects for the aspect-ratio
/// padding bug in the underlying model library.
pub struct RtDetrEngine {
    model: RTDETR,
}

impl RtDetrEngine {
    pub fn new(model_path: &str) -> Result<Self, DetectionError> {
        let config = Config::default()
            .with_model_file(model_path)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config
            .commit()
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?;
        let model = RTDETR::new(config).map_err(|e| DetectionError::ModelLoad(e.to_string()))?;
        Ok(Self { model })
    }
}

impl DetectionEngine for RtDetrEngine {
    fn infer(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectionError> {
        let (img_w, img_h) = (image.width() as f32, image.height() as f32);
        let (x_corr, y_corr) = if img_w > img_h {
            (img_w / img_h, 1.0)
        } else if img_h > img_w {
            (1.0, img_h / img_w)
        } else {
            (1.0, 1.0)
        };

        let input = Image::from(DynamicImage::ImageRgb8(image.clone()));
        let results = self
            .model
            .forward(&[input])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        let detections = results
            .into_iter()
            .next()
            .map(|y| y.hbbs)
            .unwrap_or_default()
            .into_iter()
            .map(|hbb| {
                let x1 = hbb.xmin() * x_corr;
                let y1 = hbb.ymin() * y_corr;
                RawDetection {
                    label: hbb.name().unwrap_or("unknown").to_string(),
                    class_id: hbb.id(),
                    confidence: hbb.confidence().unwrap_or(0.0),
                    bbox_px: [
                        x1,
                        y1,
                        x1 + hbb.width() * x_corr,
                        y1 + hbb.height() * y_corr,
                    ],
                }
            })
            .collect();

        Ok(detections)
    }
}

/// Engine used when no model is configured; reports no regions.
pub struct NoopEngine;

impl DetectionEngine for NoopEngine {
    fn infer(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>, DetectionError> {
        Ok(Vec::new())
    }
}
