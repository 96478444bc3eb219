//! Outbound notifications: confirmed headers and relevant transactions.
use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Pub/sub topic a payload is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// One JSON header per processed block.
    Block,
    /// One JSON transaction per broadcast-set member.
    Transaction,
}

impl Topic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Block => "block",
            Topic::Transaction => "transaction",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Downstream transport for notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Publish a JSON `payload` on `topic`.
    async fn publish(&self, topic: Topic, payload: String) -> anyhow::Result<()>;
}

/// In-process sink backed by a tokio broadcast channel.
///
/// Publishing with no live subscribers is not an error; the message is dropped.
pub struct ChannelSink {
    sender: broadcast::Sender<(Topic, String)>,
}

impl ChannelSink {
    /// Sink whose subscribers may lag by up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New subscriber receiving every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<(Topic, String)> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn publish(&self, topic: Topic, payload: String) -> anyhow::Result<()> {
        let receivers = self.sender.send((topic, payload)).unwrap_or(0);
        tracing::trace!(%topic, receivers, "published");
        Ok(())
    }
}
