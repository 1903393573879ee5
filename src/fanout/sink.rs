use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::PublishError;
use crate::fanout::FeedEvent;

/// Where published events go. The subscriber registry behind it owns its own
/// concurrency and delivery.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Hand one event over. Returns how many subscribers it reached.
    async fn publish(&self, event: FeedEvent) -> Result<usize, PublishError>;
}

/// In-process subscriber registry backed by a `tokio::sync::broadcast`
/// channel. Every WebSocket session holds one receiver.
///
/// Publishing with nobody listening is not an error; it reaches zero
/// subscribers.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<FeedEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: FeedEvent) -> Result<usize, PublishError> {
        Ok(self.tx.send(event).unwrap_or(0))
    }
}
