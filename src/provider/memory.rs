//! In-memory pub/sub provider
//!
//! Backed by a tokio broadcast channel. Every clone of a `MemoryProvider`
//! shares the same bus, so several connection brokers built from clones
//! behave like separate processes attached to one shared broker.

use super::{channel_matches, BrokerMessage, PubSubProvider, Subscription};
use crate::error::{StreamError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Configuration for the in-memory provider
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Messages buffered per subscriber before slow subscribers lag
    pub capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// In-memory provider for tests and single-process deployments
#[derive(Clone)]
pub struct MemoryProvider {
    sender: broadcast::Sender<BrokerMessage>,
    published: Arc<AtomicU64>,
    online: Arc<AtomicBool>,
}

impl MemoryProvider {
    /// Create a provider with its own bus
    pub fn new(config: MemoryConfig) -> Self {
        let (sender, _) = broadcast::channel(config.capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Number of messages published through this bus
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Simulate an outage: publishes fail until `set_online(true)`
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl PubSubProvider for MemoryProvider {
    async fn publish(&self, message: &BrokerMessage) -> Result<()> {
        if !self.online.load(Ordering::Relaxed) {
            return Err(StreamError::Publish {
                channel: message.channel.clone(),
                reason: "memory broker offline".to_string(),
            });
        }

        // No receivers is not an error: nobody is listening yet
        let receivers = self.sender.send(message.clone()).unwrap_or(0);
        self.published.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            channel = %message.channel,
            origin = %message.origin,
            receivers,
            "Message published to memory broker"
        );
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(MemorySubscription {
            stream: BroadcastStream::new(self.sender.subscribe()),
            pattern: pattern.to_string(),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.online.load(Ordering::Relaxed))
    }
}

/// Subscription on the in-memory bus, filtered by pattern
pub struct MemorySubscription {
    stream: BroadcastStream<BrokerMessage>,
    pattern: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<BrokerMessage>> {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(message) if channel_matches(&self.pattern, &message.channel) => {
                    return Ok(Some(message));
                }
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        skipped,
                        "Memory subscription lagged, messages dropped"
                    );
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_and_receive_matching() {
        let provider = MemoryProvider::default();
        let mut sub = provider.subscribe("session.>").await.unwrap();

        provider
            .publish(&BrokerMessage::new("user.u1", "n1", Bytes::from_static(b"skip")))
            .await
            .unwrap();
        provider
            .publish(&BrokerMessage::new("session.s1", "n1", Bytes::from_static(b"hit")))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel, "session.s1");
        assert_eq!(msg.origin, "n1");
        assert_eq!(&msg.payload[..], b"hit");
        assert_eq!(provider.published_count(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_bus() {
        let a = MemoryProvider::default();
        let b = a.clone();
        let mut sub = b.subscribe("session.*").await.unwrap();

        a.publish(&BrokerMessage::new("session.x", "a", Bytes::from_static(b"1")))
            .await
            .unwrap();

        let msg = sub.next().await.unwrap().unwrap();
        assert_eq!(msg.origin, "a");
    }

    #[tokio::test]
    async fn test_offline_publish_fails() {
        let provider = MemoryProvider::default();
        provider.set_online(false);

        let result = provider
            .publish(&BrokerMessage::new("session.x", "a", Bytes::new()))
            .await;
        assert!(matches!(result, Err(StreamError::Publish { .. })));
        assert!(!provider.health().await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let provider = MemoryProvider::default();
        provider
            .publish(&BrokerMessage::new("session.x", "a", Bytes::new()))
            .await
            .unwrap();
        assert_eq!(provider.published_count(), 1);
    }
}
