// Pipeline orchestrator: manages the lifecycle of live analysis sessions
//
// Each session gets a supervisor task that awaits its negotiation and media
// track, starts the reader and processing workers, joins them, and finally
// deregisters the session and marks it Closed.

use crate::error::SessionError;
use crate::media::{FrameStream, MediaNegotiator, Negotiated, SessionDescription};
use crate::pipeline::analysis::MinFrameSize;
use crate::pipeline::detection::DetectionAdapter;
use crate::pipeline::processor::{process_worker, ProcessorContext, ProcessorExit};
use crate::pipeline::reader::{read_worker, ReaderExit};
use crate::session::registry::SessionRegistry;
use crate::session::router::OutputRouter;
use crate::session::{CloseReason, Session, SessionInfo};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Carries the negotiation outcome from a supervisor back to `open_session`.
/// Dropped without a value when the session closes before negotiation ends.
pub type AnswerSender = oneshot::Sender<anyhow::Result<SessionDescription>>;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub min_frame_size: MinFrameSize,
    pub jpeg_quality: u8,
    /// Capacity of each client's output channel
    pub output_capacity: usize,
    /// How long a closing session may take before its workers are aborted
    pub shutdown_grace: Duration,
    pub log_every: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_frame_size: MinFrameSize::default(),
            jpeg_quality: 80,
            output_capacity: 8,
            shutdown_grace: Duration::from_secs(5),
            log_every: 50,
        }
    }
}

/// Join handles of a session's two workers
pub struct SessionWorkers {
    pub reader: JoinHandle<ReaderExit>,
    pub processor: JoinHandle<ProcessorExit>,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    router: Arc<OutputRouter>,
    adapter: Arc<DetectionAdapter>,
    negotiator: Arc<dyn MediaNegotiator>,
    config: PipelineConfig,
}

impl SessionManager {
    pub fn new(
        adapter: Arc<DetectionAdapter>,
        negotiator: Arc<dyn MediaNegotiator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            router: Arc::new(OutputRouter::new()),
            adapter,
            negotiator,
            config,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<OutputRouter> {
        &self.router
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn processor_context(&self) -> ProcessorContext {
        ProcessorContext {
            adapter: self.adapter.clone(),
            router: self.router.clone(),
            min_frame_size: self.config.min_frame_size,
            jpeg_quality: self.config.jpeg_quality,
            log_every: self.config.log_every,
        }
    }

    /// Register a session for `client_id` and hand its negotiation to a
    /// supervisor. Returns the answer for the client.
    pub async fn open_session(
        &self,
        client_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        let session = Arc::new(Session::new(client_id));
        self.registry.register(session.clone())?;

        let negotiation = self.negotiator.negotiate(client_id, offer);
        let (answer_tx, answer_rx) = oneshot::channel();
        self.start_supervisor(session, negotiation, answer_tx);

        match answer_rx.await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => Err(SessionError::Negotiation(e)),
            Err(_) if self.registry.is_closed() => Err(SessionError::ShuttingDown),
            Err(_) => Err(SessionError::Closed(client_id.to_string())),
        }
    }

    /// Spawn the task that drives a registered `session` from Created to
    /// Closed: it awaits the negotiation, reports the answer, waits for the
    /// track and runs the workers. Closing the session at any point ends it.
    pub fn start_supervisor(
        &self,
        session: Arc<Session>,
        negotiation: BoxFuture<'static, anyhow::Result<Negotiated>>,
        answer_tx: AnswerSender,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let ctx = self.processor_context();

        tokio::spawn(async move {
            let negotiated = tokio::select! {
                biased;
                _ = session.closing() => None,
                result = negotiation => Some(result),
            };

            match negotiated {
                Some(Ok(negotiated)) => {
                    let _ = answer_tx.send(Ok(negotiated.answer));
                    drive_track(&session, negotiated.track, ctx).await;
                }
                Some(Err(e)) => {
                    tracing::warn!("Negotiation failed for client {}: {:#}", session.id(), e);
                    session.request_close(CloseReason::TrackUnavailable);
                    registry.remove_session(&session);
                    session.mark_closed();
                    let _ = answer_tx.send(Err(e));
                    return;
                }
                None => {
                    tracing::info!("Session {}: closed during negotiation", session.id());
                }
            }

            registry.remove_session(&session);
            session.mark_closed();
        })
    }

    /// Explicitly close one session and wait until it is Closed. Every
    /// registered session has a supervisor, so this returns as soon as the
    /// workers stop; only stuck workers make it wait for the grace period.
    pub async fn close_session(&self, client_id: &str) -> Result<(), SessionError> {
        let session = self
            .registry
            .lookup(client_id)
            .ok_or_else(|| SessionError::NotFound(client_id.to_string()))?;
        session
            .close(CloseReason::Requested, self.config.shutdown_grace)
            .await;
        self.registry.remove_session(&session);
        Ok(())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .registry
            .snapshot()
            .iter()
            .map(|session| session.info())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Close every session and wait for all workers to finish. New sessions
    /// are rejected from this point on.
    pub async fn shutdown_all(&self) {
        if !self.registry.is_empty() {
            tracing::info!("Shutting down {} sessions", self.registry.len());
        }
        self.registry.close_all(self.config.shutdown_grace).await;
        self.router.clear();
        tracing::info!("All sessions closed");
    }
}

/// Wait for the track, then run the session's workers until both finish.
async fn drive_track(
    session: &Arc<Session>,
    pending_track: oneshot::Receiver<FrameStream>,
    ctx: ProcessorContext,
) {
    let track = tokio::select! {
        biased;
        _ = session.closing() => None,
        track = pending_track => track.ok(),
    };

    match track {
        Some(track) => match attach_track(session, track, ctx) {
            Some(workers) => join_workers(session, workers).await,
            None => {
                session.request_close(CloseReason::TrackUnavailable);
            }
        },
        None => {
            if session.request_close(CloseReason::TrackUnavailable) {
                tracing::warn!("Session {}: no media track delivered", session.id());
            }
        }
    }
}

/// Created -> Active: start the reader and processing workers for `track`.
/// Returns `None` if the session is no longer in Created.
pub fn attach_track(
    session: &Arc<Session>,
    track: FrameStream,
    ctx: ProcessorContext,
) -> Option<SessionWorkers> {
    if !session.activate() {
        return None;
    }

    let reader = tokio::spawn(read_worker(session.clone(), track));
    let processor = tokio::spawn(process_worker(session.clone(), ctx));
    session.attach_workers(vec![reader.abort_handle(), processor.abort_handle()]);

    Some(SessionWorkers { reader, processor })
}

/// Wait for both workers. Whichever finishes first moves the session to
/// Closing so the other one stops too (a no-op when the worker already did).
async fn join_workers(session: &Arc<Session>, workers: SessionWorkers) {
    let SessionWorkers {
        mut reader,
        mut processor,
    } = workers;

    let (reader_result, processor_result) = tokio::select! {
        result = &mut reader => {
            session.request_close(CloseReason::SourceFailed);
            (result, processor.await)
        }
        result = &mut processor => {
            session.request_close(CloseReason::ProcessingFailed);
            (reader.await, result)
        }
    };

    match reader_result {
        Ok(exit) => tracing::info!("Session {}: reader finished ({:?})", session.id(), exit),
        Err(e) => tracing::warn!("Session {}: reader aborted: {}", session.id(), e),
    }
    match processor_result {
        Ok(exit) => tracing::info!("Session {}: processor finished ({:?})", session.id(), exit),
        Err(e) => tracing::warn!("Session {}: processor aborted: {}", session.id(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackError;
    use crate::pipeline::test_support::{adapter, solid_frame, wait_until, CountingEngine};
    use crate::pipeline::types::{Frame, OutputMessage};
    use crate::session::SessionState;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    type FrameSender = mpsc::Sender<Result<Frame, TrackError>>;

    /// Hands out channel-fed tracks prepared by the test
    #[derive(Default)]
    struct ChannelNegotiator {
        tracks: Mutex<HashMap<String, FrameStream>>,
    }

    impl ChannelNegotiator {
        fn prepare(&self, client_id: &str) -> FrameSender {
            let (tx, rx) = mpsc::channel(1);
            self.tracks
                .lock()
                .unwrap()
                .insert(client_id.to_string(), Box::pin(ReceiverStream::new(rx)));
            tx
        }
    }

    impl MediaNegotiator for ChannelNegotiator {
        fn negotiate(
            &self,
            client_id: &str,
            offer: SessionDescription,
        ) -> BoxFuture<'static, anyhow::Result<Negotiated>> {
            let track = self.tracks.lock().unwrap().remove(client_id);
            let client_id = client_id.to_string();
            Box::pin(async move {
                let track = track.ok_or_else(|| anyhow!("no media for {}", client_id))?;
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(track);
                Ok(Negotiated {
                    answer: SessionDescription {
                        sdp: offer.sdp,
                        kind: "answer".to_string(),
                    },
                    track: rx,
                })
            })
        }
    }

    fn offer() -> SessionDescription {
        SessionDescription {
            sdp: "v=0".to_string(),
            kind: "offer".to_string(),
        }
    }

    fn manager(engine: CountingEngine) -> (SessionManager, Arc<ChannelNegotiator>) {
        let negotiator = Arc::new(ChannelNegotiator::default());
        let config = PipelineConfig {
            shutdown_grace: Duration::from_secs(1),
            ..PipelineConfig::default()
        };
        let manager = SessionManager::new(adapter(engine), negotiator.clone(), config);
        (manager, negotiator)
    }

    fn output_channel(manager: &SessionManager, client_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        manager.router().register_channel(client_id, tx);
        rx
    }

    async fn recv_message(rx: &mut mpsc::Receiver<String>) -> OutputMessage {
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message expected")
            .expect("channel open");
        serde_json::from_str(&text).unwrap()
    }

    async fn wait_active(session: &Arc<Session>) {
        assert!(
            wait_until(Duration::from_secs(2), || session.state() == SessionState::Active).await
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_client_rejected_and_first_unaffected() {
        let (manager, negotiator) = manager(CountingEngine::default());
        let frames = negotiator.prepare("c1");
        let mut rx = output_channel(&manager, "c1");

        let answer = manager.open_session("c1", offer()).await.unwrap();
        assert_eq!(answer.kind, "answer");
        let first = manager.registry().lookup("c1").unwrap();
        wait_active(&first).await;

        let err = manager.open_session("c1", offer()).await.unwrap_err();
        assert!(matches!(err, SessionError::Duplicate(_)));

        let current = manager.registry().lookup("c1").unwrap();
        assert!(Arc::ptr_eq(&current, &first));
        assert_eq!(first.state(), SessionState::Active);

        frames.send(Ok(solid_frame(640, 480, [1, 2, 3]))).await.unwrap();
        let message = recv_message(&mut rx).await;
        assert_eq!(message.fps, 0.0);

        manager.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sessions_are_isolated() {
        let (manager, negotiator) = manager(CountingEngine::default());
        let frames_1 = negotiator.prepare("c1");
        let frames_2 = negotiator.prepare("c2");
        let mut rx_1 = output_channel(&manager, "c1");
        let mut rx_2 = output_channel(&manager, "c2");

        manager.open_session("c1", offer()).await.unwrap();
        manager.open_session("c2", offer()).await.unwrap();
        wait_active(&manager.registry().lookup("c1").unwrap()).await;
        wait_active(&manager.registry().lookup("c2").unwrap()).await;

        let (sent_1, sent_2) = tokio::join!(
            frames_1.send(Ok(solid_frame(640, 480, [90, 90, 90]))),
            frames_2.send(Ok(solid_frame(800, 600, [90, 90, 90]))),
        );
        sent_1.unwrap();
        sent_2.unwrap();

        let message_1 = recv_message(&mut rx_1).await;
        let message_2 = recv_message(&mut rx_2).await;
        assert_eq!(message_1.mean_color, message_2.mean_color);
        assert_eq!(message_1.image.width, 640);
        assert_eq!(message_2.image.width, 800);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx_1.try_recv().is_err());
        assert!(rx_2.try_recv().is_err());

        manager.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_processor_drops_frames_without_queueing() {
        let engine = CountingEngine {
            stall: Duration::from_millis(200),
            ..CountingEngine::default()
        };
        let (manager, negotiator) = manager(engine);
        let frames = negotiator.prepare("c1");
        let mut rx = output_channel(&manager, "c1");

        manager.open_session("c1", offer()).await.unwrap();
        let session = manager.registry().lookup("c1").unwrap();
        wait_active(&session).await;

        // 30 frames per second for half a second
        let mut ticker = tokio::time::interval(Duration::from_millis(33));
        for _ in 0..15 {
            ticker.tick().await;
            frames.send(Ok(solid_frame(640, 480, [5, 5, 5]))).await.unwrap();
        }

        let first = recv_message(&mut rx).await;
        assert_eq!(first.image.height, 480);

        assert!(
            wait_until(Duration::from_secs(2), || {
                session.stats_snapshot().frames_received == 15
            })
            .await
        );
        let stats = session.stats_snapshot();
        assert_eq!(stats.frames_received, 15);
        assert!(stats.frames_dropped > 0, "stalled consumer must drop frames");
        assert!(stats.frames_processed + stats.frames_dropped <= 15);
        assert_eq!(session.state(), SessionState::Active);

        manager.shutdown_all().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_end_deregisters_session() {
        let (manager, negotiator) = manager(CountingEngine::default());
        let frames = negotiator.prepare("c1");

        manager.open_session("c1", offer()).await.unwrap();
        let session = manager.registry().lookup("c1").unwrap();
        wait_active(&session).await;

        drop(frames);
        tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
            .await
            .expect("session should close after end of stream");

        assert_eq!(session.close_reason(), Some(CloseReason::StreamEnded));
        assert!(manager.registry().is_empty());

        // The client id can be reused once the old session is gone
        let _frames = negotiator.prepare("c1");
        manager.open_session("c1", offer()).await.unwrap();
        manager.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_all_stops_every_worker() {
        let (manager, negotiator) = manager(CountingEngine::default());
        let mut senders = Vec::new();
        let mut sessions = Vec::new();
        for id in ["a", "b", "c"] {
            senders.push(negotiator.prepare(id));
            manager.open_session(id, offer()).await.unwrap();
            let session = manager.registry().lookup(id).unwrap();
            wait_active(&session).await;
            sessions.push(session);
        }

        manager.shutdown_all().await;

        assert!(manager.registry().is_empty());
        for session in &sessions {
            assert_eq!(session.state(), SessionState::Closed);
            assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
        }
        // Every reader has dropped its track
        for sender in &senders {
            assert!(sender.is_closed());
        }

        let _frames = negotiator.prepare("d");
        let err = manager.open_session("d", offer()).await.unwrap_err();
        assert!(matches!(err, SessionError::ShuttingDown));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_single_session() {
        let (manager, negotiator) = manager(CountingEngine::default());
        let _frames_1 = negotiator.prepare("c1");
        let frames_2 = negotiator.prepare("c2");
        let mut rx_2 = output_channel(&manager, "c2");
        manager.open_session("c1", offer()).await.unwrap();
        manager.open_session("c2", offer()).await.unwrap();
        let first = manager.registry().lookup("c1").unwrap();
        wait_active(&first).await;
        wait_active(&manager.registry().lookup("c2").unwrap()).await;

        manager.close_session("c1").await.unwrap();
        assert_eq!(first.state(), SessionState::Closed);
        assert_eq!(first.close_reason(), Some(CloseReason::Requested));
        assert!(manager.registry().lookup("c1").is_none());

        // The other session keeps running
        frames_2.send(Ok(solid_frame(640, 480, [0, 0, 0]))).await.unwrap();
        recv_message(&mut rx_2).await;

        let err = manager.close_session("c1").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_negotiation_failure_releases_client_id() {
        let (manager, negotiator) = manager(CountingEngine::default());

        let err = manager.open_session("c9", offer()).await.unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        assert!(manager.registry().lookup("c9").is_none());

        let _frames = negotiator.prepare("c9");
        manager.open_session("c9", offer()).await.unwrap();
        manager.shutdown_all().await;
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_session_without_track_closes() {
        let (manager, _negotiator) = manager(CountingEngine::default());
        let session = Arc::new(Session::new("c1"));
        manager.registry().register(session.clone()).unwrap();

        let negotiation: BoxFuture<'static, anyhow::Result<Negotiated>> = Box::pin(async {
            // The transport never delivers a track
            let (_tx, rx) = oneshot::channel::<FrameStream>();
            Ok(Negotiated {
                answer: SessionDescription {
                    sdp: "v=0".to_string(),
                    kind: "answer".to_string(),
                },
                track: rx,
            })
        });
        let (answer_tx, answer_rx) = oneshot::channel();
        let supervisor = manager.start_supervisor(session.clone(), negotiation, answer_tx);

        supervisor.await.unwrap();
        assert_eq!(answer_rx.await.unwrap().unwrap().kind, "answer");
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::TrackUnavailable));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_close_during_negotiation_returns_promptly() {
        let (manager, _negotiator) = manager(CountingEngine::default());
        let session = Arc::new(Session::new("c1"));
        manager.registry().register(session.clone()).unwrap();

        let negotiation = Box::pin(futures::future::pending::<anyhow::Result<Negotiated>>());
        let (answer_tx, answer_rx) = oneshot::channel();
        let supervisor = manager.start_supervisor(session.clone(), negotiation, answer_tx);

        // Well below the one second grace period
        tokio::time::timeout(Duration::from_millis(500), manager.close_session("c1"))
            .await
            .expect("close should not wait for the grace period")
            .unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Requested));
        assert!(answer_rx.await.is_err());
        supervisor.await.unwrap();
        assert!(manager.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_racing_new_sessions_leaves_nothing_running() {
        for round in 0..20 {
            let (manager, negotiator) = manager(CountingEngine::default());
            let manager = Arc::new(manager);
            let ids: Vec<String> = (0..8).map(|i| format!("c{}", i)).collect();
            let senders: HashMap<String, FrameSender> = ids
                .iter()
                .map(|id| (id.clone(), negotiator.prepare(id)))
                .collect();

            let opens: Vec<_> = ids
                .iter()
                .cloned()
                .map(|id| {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        let result = manager.open_session(&id, offer()).await;
                        (id, result)
                    })
                })
                .collect();

            manager.shutdown_all().await;
            assert!(manager.registry().is_empty(), "round {}", round);

            for open in opens {
                let (id, result) = open.await.unwrap();
                match result {
                    // Opened before shutdown: its reader has released the track
                    Ok(_) => assert!(senders[&id].is_closed(), "round {} id {}", round, id),
                    Err(e) => assert!(matches!(e, SessionError::ShuttingDown), "{}", e),
                }
            }
            assert!(manager.registry().is_empty(), "round {}", round);
        }
    }
}
