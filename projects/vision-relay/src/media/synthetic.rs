use super::{FrameStream, MediaNegotiator, Negotiated, SessionDescription};
use crate::error::TrackError;
use crate::pipeline::types::Frame;
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use image::{Rgb, RgbImage};
use std::time::Duration;
use tokio::sync::oneshot;

/// Negotiator that answers every offer and feeds the session a generated
/// test pattern instead of decoded network video.
#[derive(Debug, Clone)]
pub struct SyntheticNegotiator {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl MediaNegotiator for SyntheticNegotiator {
    fn negotiate(
        &self,
        client_id: &str,
        offer: SessionDescription,
    ) -> BoxFuture<'static, Result<Negotiated>> {
        let config = self.clone();
        let client_id = client_id.to_string();
        Box::pin(async move {
            if offer.kind != "offer" {
                bail!("Expected an offer, got '{}'", offer.kind);
            }
            if offer.sdp.trim().is_empty() {
                bail!("Empty session description from client {}", client_id);
            }

            let (tx, rx) = oneshot::channel();
            // The receiver is still held by us, so this cannot fail.
            let _ = tx.send(test_pattern(config.width, config.height, config.fps));

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

/// Shortest frame period; `tokio::time::interval` panics on zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Endless stream of gradient frames whose hue drifts over time. A zero-sized
/// pattern ends the stream with a source error.
pub fn test_pattern(width: u32, height: u32, fps: f64) -> FrameStream {
    let period = Duration::from_secs_f64(1.0 / fps.max(1.0)).max(MIN_PERIOD);
    Box::pin(async_stream::stream! {
        if width == 0 || height == 0 {
            let reason = format!("invalid test pattern size {}x{}", width, height);
            yield Err::<Frame, TrackError>(TrackError::Source(reason));
            return;
        }
        let mut ticker = tokio::time::interval(period);
        let mut tick: u32 = 0;
        loop {
            ticker.tick().await;
            let image = RgbImage::from_fn(width, height, |x, y| {
                Rgb([
                    (x.wrapping_add(tick) % 256) as u8,
                    (y.wrapping_add(tick / 2) % 256) as u8,
                    (tick % 256) as u8,
                ])
            });
            yield Ok::<Frame, TrackError>(Frame::new(image));
            tick = tick.wrapping_add(1);
        }
    })
}
