// Boundary to the media transport / negotiation layer.
//
// Negotiation answers an offer right away; the decoded video track arrives
// later through the returned one-shot channel.

pub mod synthetic;

use crate::error::TrackError;
use crate::pipeline::types::Frame;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::sync::oneshot;

/// Decoded frames of one video track. `None` or `Err(TrackError::StreamEnded)`
/// mark the normal end of the stream.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TrackError>> + Send>>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Session establishment request as posted by the client
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    pub client_id: String,
    #[serde(flatten)]
    pub offer: SessionDescription,
}

pub struct Negotiated {
    pub answer: SessionDescription,
    /// Resolves with the track once media starts flowing. Dropped without a
    /// value if the transport never delivers one.
    pub track: oneshot::Receiver<FrameStream>,
}

pub trait MediaNegotiator: Send + Sync {
    fn negotiate(
        &self,
        client_id: &str,
        offer: SessionDescription,
    ) -> BoxFuture<'static, Result<Negotiated>>;
}
