// Output router: client id -> live output channel
//
// Channels come and go independently of sessions (a client may reconnect its
// output socket without restarting its media session). Delivery is
// best-effort and never blocks the processing task.

use crate::pipeline::types::OutputMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Serialized JSON messages for one client connection
pub type OutputSender = mpsc::Sender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    NoChannel,
    ChannelClosed,
    ChannelFull,
    SerializeFailed,
}

struct ChannelEntry {
    generation: u64,
    sender: OutputSender,
}

#[derive(Default)]
pub struct OutputRouter {
    channels: Mutex<HashMap<String, ChannelEntry>>,
    next_generation: AtomicU64,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChannelEntry>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a channel for `client_id`, replacing any previous one.
    /// Returns the generation token identifying this channel.
    pub fn register_channel(&self, client_id: &str, sender: OutputSender) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .lock()
            .insert(client_id.to_string(), ChannelEntry { generation, sender });
        if previous.is_some() {
            info!("Output channel for client {} replaced", client_id);
        }
        generation
    }

    /// Unconditional removal. Socket handlers use `release_channel` so a
    /// reconnect is never torn down by the old connection.
    #[allow(dead_code)]
    pub fn unregister_channel(&self, client_id: &str) -> bool {
        self.lock().remove(client_id).is_some()
    }

    /// Remove the channel only if it is still the one identified by `generation`.
    pub fn release_channel(&self, client_id: &str, generation: u64) -> bool {
        let mut channels = self.lock();
        match channels.get(client_id) {
            Some(entry) if entry.generation == generation => {
                channels.remove(client_id);
                true
            }
            _ => false,
        }
    }

    /// Drop every channel; connected clients see their stream end.
    pub fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    pub fn has_channel(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Send `message` to the client's channel. Missing, closed or saturated
    /// channels drop the message.
    pub fn deliver(&self, client_id: &str, message: &OutputMessage) -> Delivery {
        let (generation, sender) = match self.lock().get(client_id) {
            Some(entry) => (entry.generation, entry.sender.clone()),
            None => return Delivery::NoChannel,
        };

        if sender.is_closed() {
            self.release_channel(client_id, generation);
            return Delivery::ChannelClosed;
        }

        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize output for client {}: {}", client_id, e);
                return Delivery::SerializeFailed;
            }
        };

        match sender.try_send(text) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                debug!("Output channel for client {} is full, dropping message", client_id);
                Delivery::ChannelFull
            }
            Err(TrySendError::Closed(_)) => {
                self.release_channel(client_id, generation);
                Delivery::ChannelClosed
            }
        }
    }
}
