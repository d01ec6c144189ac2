use crate::pipeline::analysis::MinFrameSize;
use crate::pipeline::detection::DetectionConfig;
use crate::pipeline::orchestrator::PipelineConfig;
use clap::{Parser, ValueEnum};
use std::net::IpAddr;
use std::time::Duration;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorBackend {
    /// RT-DETR model loaded through usls
    Rtdetr,
    /// No model; every frame reports zero detections
    None,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Detection engine
    #[arg(
        long,
        value_enum,
        default_value_t = DetectorBackend::Rtdetr,
        env = "VISION_RELAY_DETECTOR"
    )]
    pub detector: DetectorBackend,

    /// Path to the detection model file
    #[arg(long, env = "VISION_RELAY_MODEL_PATH")]
    pub model_path: Option<String>,

    /// Comma-separated class names for custom-trained models, indexed by class id
    #[arg(long, env = "VISION_RELAY_CLASS_NAMES", value_delimiter = ',')]
    pub class_names: Vec<String>,

    /// Minimum detection confidence
    #[arg(long, default_value_t = 0.5)]
    pub confidence: f32,

    /// IoU threshold for overlap suppression
    #[arg(long, default_value_t = 0.45)]
    pub iou: f32,

    /// Frames narrower than this skip analysis
    #[arg(long, default_value_t = 480)]
    pub min_width: u32,

    /// Frames shorter than this skip analysis
    #[arg(long, default_value_t = 270)]
    pub min_height: u32,

    /// JPEG quality of the echoed frame (1-100)
    #[arg(long, default_value_t = 80, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,

    /// Messages buffered per output channel before new ones are dropped
    #[arg(long, default_value_t = 8)]
    pub output_capacity: usize,

    /// Grace period for closing sessions on shutdown, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub shutdown_grace_ms: u64,

    /// Width of the synthetic test track
    #[arg(long, default_value_t = 1280)]
    pub synthetic_width: u32,

    /// Height of the synthetic test track
    #[arg(long, default_value_t = 720)]
    pub synthetic_height: u32,

    /// Frame rate of the synthetic test track
    #[arg(long, default_value_t = 10.0, value_parser = parse_frame_rate)]
    pub synthetic_fps: f64,
}

fn parse_frame_rate(value: &str) -> Result<f64, String> {
    let fps: f64 = value.parse().map_err(|e| format!("{}", e))?;
    if fps.is_finite() && fps > 0.0 {
        Ok(fps)
    } else {
        Err(format!("expected a positive frame rate, got {}", value))
    }
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn detection_config(&self) -> DetectionConfig {
        DetectionConfig {
            confidence_threshold: self.confidence,
            iou_threshold: self.iou,
            class_names: self.class_names.clone(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            min_frame_size: MinFrameSize {
                width: self.min_width,
                height: self.min_height,
            },
            jpeg_quality: self.jpeg_quality,
            output_capacity: self.output_capacity.max(1),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            ..PipelineConfig::default()
        }
    }
}
