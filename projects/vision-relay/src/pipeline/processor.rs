use crate::pipeline::analysis::{analyze_frame, FpsTracker, MinFrameSize};
use crate::pipeline::detection::DetectionAdapter;
use crate::pipeline::types::OutputMessage;
use crate::session::router::OutputRouter;
use crate::session::{CloseReason, Session};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Shared resources and limits for processing workers
#[derive(Clone)]
pub struct ProcessorContext {
    pub adapter: Arc<DetectionAdapter>,
    pub router: Arc<OutputRouter>,
    pub min_frame_size: MinFrameSize,
    pub jpeg_quality: u8,
    /// Log the detections of every n-th processed frame (0 disables)
    pub log_every: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorExit {
    BufferClosed,
    AnalysisCancelled,
}

fn now_ms() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1000.0
}

/// Worker that takes frames from the session buffer, analyses them and
/// routes the result to the session's output channel.
///
/// Frame-level failures (encoding, detection) skip the frame; only a closed
/// buffer ends the loop.
pub async fn process_worker(session: Arc<Session>, ctx: ProcessorContext) -> ProcessorExit {
    let mut fps_tracker = FpsTracker::new();

    loop {
        let frame = match session.buffer().take().await {
            Ok(frame) => frame,
            Err(_) => return ProcessorExit::BufferClosed,
        };

        let (width, height) = (frame.width(), frame.height());
        if !ctx.min_frame_size.admits(width, height) {
            session
                .stats()
                .frames_skipped_small
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Session {}: frame too small, skipping analysis, size: {}x{}",
                session.id(),
                width,
                height
            );
            continue;
        }

        let timestamp_ms = now_ms();
        let fps = fps_tracker.rate_at(timestamp_ms);

        let adapter = ctx.adapter.clone();
        let jpeg_quality = ctx.jpeg_quality;
        let analysis =
            tokio::task::spawn_blocking(move || analyze_frame(&adapter, &frame, jpeg_quality))
                .await;

        let analysis = match analysis {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(e)) => {
                session.stats().frames_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Session {}: skipping frame: {}", session.id(), e);
                continue;
            }
            Err(e) if e.is_panic() => {
                session.stats().frames_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Session {}: frame analysis panicked: {}", session.id(), e);
                continue;
            }
            Err(_) => {
                session.request_close(CloseReason::ProcessingFailed);
                return ProcessorExit::AnalysisCancelled;
            }
        };

        if session.state().is_terminating() {
            return ProcessorExit::BufferClosed;
        }

        let message = OutputMessage {
            mean_color: analysis.mean_color,
            timestamp_ms,
            fps,
            image: analysis.image,
            detections: analysis.detections,
        };

        let processed = session
            .stats()
            .frames_processed
            .load(Ordering::Relaxed);
        if ctx.log_every > 0 && processed % ctx.log_every == 0 {
            tracing::debug!(
                "Session {}: frame {} detections: {:?}",
                session.id(),
                processed,
                message.detections
            );
        }

        ctx.router.deliver(session.id(), &message);
        fps_tracker.commit(timestamp_ms);
        session.stats().record_processed(fps, analysis.detect_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{adapter, solid_frame, wait_until, CountingEngine};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn context(engine: CountingEngine, router: Arc<OutputRouter>) -> ProcessorContext {
        ProcessorContext {
            adapter: adapter(engine),
            router,
            min_frame_size: MinFrameSize::default(),
            jpeg_quality: 70,
            log_every: 50,
        }
    }

    async fn recv_message(rx: &mut mpsc::Receiver<String>) -> OutputMessage {
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message expected")
            .expect("channel open");
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_small_frames_never_reach_detector() {
        let engine = CountingEngine::default();
        let calls = engine.calls.clone();
        let router = Arc::new(OutputRouter::new());
        let (tx, mut rx) = mpsc::channel(4);
        router.register_channel("c1", tx);

        let session = Arc::new(Session::new("c1"));
        session.activate();
        let worker = tokio::spawn(process_worker(session.clone(), context(engine, router)));

        session.buffer().put(solid_frame(479, 720, [0, 0, 0])).unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || {
                session.stats().frames_skipped_small.load(Ordering::Relaxed) == 1
            })
            .await
        );
        session.buffer().put(solid_frame(640, 269, [0, 0, 0])).unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || {
                session.stats().frames_skipped_small.load(Ordering::Relaxed) == 2
            })
            .await
        );

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());

        session.request_close(CloseReason::Requested);
        let exit = worker.await.unwrap();
        assert_eq!(exit, ProcessorExit::BufferClosed);
    }

    #[tokio::test]
    async fn test_detection_failure_skips_frame_and_keeps_fps_reference() {
        let engine = CountingEngine {
            fail_first: 1,
            ..CountingEngine::default()
        };
        let router = Arc::new(OutputRouter::new());
        let (tx, mut rx) = mpsc::channel(4);
        router.register_channel("c1", tx);

        let session = Arc::new(Session::new("c1"));
        session.activate();
        let worker = tokio::spawn(process_worker(session.clone(), context(engine, router)));

        session.buffer().put(solid_frame(640, 480, [10, 20, 30])).unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || {
                session.stats().frames_failed.load(Ordering::Relaxed) == 1
            })
            .await
        );

        session.buffer().put(solid_frame(640, 480, [10, 20, 30])).unwrap();
        let first = recv_message(&mut rx).await;
        // The failed frame did not count as processed
        assert_eq!(first.fps, 0.0);
        assert_eq!(first.mean_color.b, 30);

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.buffer().put(solid_frame(640, 480, [10, 20, 30])).unwrap();
        let second = recv_message(&mut rx).await;
        assert!(second.fps > 0.0);
        assert!(second.timestamp_ms > first.timestamp_ms);
        let expected = 1000.0 / (second.timestamp_ms - first.timestamp_ms);
        assert!((second.fps - expected).abs() < 1e-6);

        assert_eq!(session.state(), crate::session::SessionState::Active);
        session.request_close(CloseReason::Requested);
        worker.await.unwrap();
    }
}
