//! Pub/sub provider trait: the cross-process fan-out abstraction
//!
//! The connection broker publishes every session event to a per-session
//! channel and subscribes once to a wildcard pattern covering all of them.
//! Backends (NATS, in-memory, Redis, etc.) implement `PubSubProvider` so
//! the broker can be swapped, or left out entirely for local-only delivery.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub mod memory;
pub mod nats;

/// A message carried over the shared broker
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Channel the message was published to (e.g. `session.abc`)
    pub channel: String,

    /// Node id of the publishing process
    pub origin: String,

    /// Serialized payload (a `StreamEvent` for session channels)
    pub payload: Bytes,
}

impl BrokerMessage {
    /// Create a new broker message
    pub fn new(channel: impl Into<String>, origin: impl Into<String>, payload: Bytes) -> Self {
        Self {
            channel: channel.into(),
            origin: origin.into(),
            payload,
        }
    }
}

/// Core trait for pub/sub backends
///
/// Delivery is at-most-once: a message published while a subscriber is
/// disconnected is not replayed.
#[async_trait]
pub trait PubSubProvider: Send + Sync {
    /// Publish a message to its channel
    async fn publish(&self, message: &BrokerMessage) -> Result<()>;

    /// Subscribe to every channel matching `pattern`
    ///
    /// Patterns use dot-separated tokens: `*` matches exactly one token,
    /// a trailing `>` matches one or more.
    async fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check: returns true if the provider is connected and operational
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Async subscription handle for receiving broker messages
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next message, or `None` once the subscription has ended
    async fn next(&mut self) -> Result<Option<BrokerMessage>>;
}

/// Match a dot-separated channel name against a subscription pattern
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut channel_tokens = channel.split('.');

    loop {
        match (pattern_tokens.next(), channel_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(c)) if p == c => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
