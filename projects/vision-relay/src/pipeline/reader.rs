// Reader worker: pulls decoded frames from a session's track into its frame buffer

use crate::error::TrackError;
use crate::media::FrameStream;
use crate::pipeline::frame_buffer::PutOutcome;
use crate::session::{CloseReason, Session};
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    StreamEnded,
    SourceFailed,
    /// The session started closing while the reader was waiting for a frame.
    Cancelled,
}

/// Reads frames until the track ends, fails, or the session starts closing.
/// A track that ends or fails moves the session to Closing.
pub async fn read_worker(session: Arc<Session>, mut track: FrameStream) -> ReaderExit {
    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = session.closing() => break ReaderExit::Cancelled,
            next = track.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                session.stats().frames_received.fetch_add(1, Ordering::Relaxed);
                match session.buffer().put(frame) {
                    Ok(PutOutcome::Stored) => {}
                    Ok(PutOutcome::Replaced) => {
                        tracing::debug!("Session {}: dropped unread frame", session.id());
                    }
                    Err(_) => break ReaderExit::Cancelled,
                }
            }
            Some(Err(TrackError::StreamEnded)) | None => {
                tracing::info!("Session {}: stream ended normally", session.id());
                break ReaderExit::StreamEnded;
            }
            Some(Err(e)) => {
                tracing::warn!("Session {}: frame reader stopped: {}", session.id(), e);
                break ReaderExit::SourceFailed;
            }
        }
    };

    match exit {
        ReaderExit::StreamEnded => {
            session.request_close(CloseReason::StreamEnded);
        }
        ReaderExit::SourceFailed => {
            session.request_close(CloseReason::SourceFailed);
        }
        ReaderExit::Cancelled => {}
    }

    exit
}
