// Error taxonomy for the live analysis pipeline
//
// Frame-level errors are absorbed by the processing task and never end a
// session. Session-level errors end exactly one session.

use thiserror::Error;

/// A second registration for a client id that already has a live session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("session already registered for client {client_id}")]
pub struct DuplicateSessionError {
    pub client_id: String,
}

/// Operation attempted on a frame buffer after it was closed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("frame buffer is closed")]
pub struct ClosedBufferError;

/// Failure reported by the detection engine or adapter.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("model loading failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("invalid input image: {width}x{height}")]
    InvalidImage { width: u32, height: u32 },

    #[error("detection engine lock poisoned")]
    Poisoned,
}

/// Failure while analysing a single frame. The frame is skipped and the
/// session keeps running.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Detection(#[from] DetectionError),
}

/// Terminal conditions reported by a media track.
#[derive(Error, Debug)]
pub enum TrackError {
    /// Normal end of the media stream.
    #[error("stream ended")]
    StreamEnded,

    #[error("media source failed: {0}")]
    Source(String),
}

/// Errors returned to callers that open or close sessions.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Duplicate(#[from] DuplicateSessionError),

    #[error("session {0} not found")]
    NotFound(String),

    /// The session was closed before its negotiation finished.
    #[error("session {0} closed during negotiation")]
    Closed(String),

    #[error("negotiation failed: {0}")]
    Negotiation(#[source] anyhow::Error),

    #[error("server is shutting down")]
    ShuttingDown,
}
