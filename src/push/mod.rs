//! Live push fan-out contract.
//!
//! The delivery core hands every stored message to a [`PushBroadcaster`];
//! the actual socket transport (framing, subscriptions, connection
//! lifecycle) lives outside this crate. Publishing is best-effort and may
//! drop when a user has no live subscribers.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::models::Message;

/// Capacity of each per-user live channel.
const SUBSCRIBER_BUFFER: usize = 64;

/// Contract between the delivery core and the live push transport.
///
/// `publish` must not block on slow subscribers; the core calls it once per
/// successfully stored recipient. Subscription management belongs to the
/// external transport, never to the core.
#[async_trait]
pub trait PushBroadcaster: Send + Sync {
    /// Deliver `message` to the live subscribers of `user_id`, if any.
    async fn publish(&self, user_id: &str, message: &Message);
}

/// Broadcaster that drops everything; useful when no transport is wired.
pub struct NoopBroadcaster;

#[async_trait]
impl PushBroadcaster for NoopBroadcaster {
    async fn publish(&self, user_id: &str, message: &Message) {
        tracing::trace!(
            user_id = %user_id,
            message_id = %message.id,
            "No push transport configured, dropping live publish"
        );
    }
}

/// In-process broadcaster backed by per-user `tokio::broadcast` channels.
///
/// The external transport subscribes with [`LocalBroadcaster::subscribe`]
/// and forwards received messages onto its own sockets. Lagging
/// subscribers lose messages rather than blocking the pipeline.
pub struct LocalBroadcaster {
    channels: DashMap<String, broadcast::Sender<Message>>,
}

impl LocalBroadcaster {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Open a live subscription for a user. Called by the transport layer.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<Message> {
        self.channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .subscribe()
    }

    /// Drop the channel for a user once its last subscriber disconnects.
    pub fn unsubscribe_all(&self, user_id: &str) {
        self.channels.remove(user_id);
    }

    /// Number of live subscribers for a user.
    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.channels
            .get(user_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for LocalBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushBroadcaster for LocalBroadcaster {
    async fn publish(&self, user_id: &str, message: &Message) {
        let Some(tx) = self.channels.get(user_id) else {
            tracing::debug!(user_id = %user_id, "No live subscribers, dropping publish");
            return;
        };

        match tx.send(message.clone()) {
            Ok(receivers) => {
                tracing::debug!(
                    user_id = %user_id,
                    message_id = %message.id,
                    receivers = receivers,
                    "Published message to live subscribers"
                );
            }
            Err(_) => {
                tracing::debug!(
                    user_id = %user_id,
                    message_id = %message.id,
                    "All subscribers gone, dropping publish"
                );
            }
        }
    }
}
