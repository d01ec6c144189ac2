mod cli;
mod error;
mod media;
mod pipeline;
mod session;
mod web;

use anyhow::{Context, Result};
use cli::{Args, DetectorBackend};
use media::synthetic::SyntheticNegotiator;
use pipeline::detection::{DetectionAdapter, DetectionEngine, NoopEngine, RtDetrEngine};
use pipeline::orchestrator::SessionManager;
use std::sync::Arc;
use web::server::run_server;

fn build_engine(args: &Args) -> Result<Box<dyn DetectionEngine>> {
    match args.detector {
        DetectorBackend::Rtdetr => {
            let model_path = args
                .model_path
                .as_deref()
                .context("--model-path is required for the rtdetr detector")?;
            tracing::info!("Loading RT-DETR model from {}", model_path);
            let engine = RtDetrEngine::new(model_path)
                .with_context(|| format!("Failed to load detection model {}", model_path))?;
            Ok(Box::new(engine))
        }
        DetectorBackend::None => {
            tracing::warn!("Running without a detection model; detections will be empty");
            Ok(Box::new(NoopEngine))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    let adapter = Arc::new(DetectionAdapter::new(
        build_engine(&args)?,
        args.detection_config(),
    ));

    tracing::warn!(
        "Media negotiation is synthetic: sessions receive a {}x{} test pattern at {} fps",
        args.synthetic_width,
        args.synthetic_height,
        args.synthetic_fps
    );
    let negotiator = Arc::new(SyntheticNegotiator {
        width: args.synthetic_width,
        height: args.synthetic_height,
        fps: args.synthetic_fps,
    });

    let manager = Arc::new(SessionManager::new(
        adapter,
        negotiator,
        args.pipeline_config(),
    ));

    run_server(args.host, args.port, manager).await?;

    Ok(())
}
