//! NATS event provider
//!
//! Implements `PubSubProvider` on core NATS subjects. Session fan-out is
//! fire-and-forget, so plain pub/sub is used rather than JetStream
//! persistence.

mod client;
mod config;
mod subscriber;

pub use client::NatsClient;
pub use config::NatsConfig;
pub use subscriber::NatsSubscription;

use crate::error::Result;
use crate::provider::{BrokerMessage, PubSubProvider, Subscription};
use async_trait::async_trait;

/// Header carrying the publishing node id
pub const ORIGIN_HEADER: &str = "A3S-Origin";

/// NATS pub/sub provider
///
/// Wraps `NatsClient` and implements the `PubSubProvider` trait.
pub struct NatsProvider {
    client: NatsClient,
}

impl NatsProvider {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl PubSubProvider for NatsProvider {
    async fn publish(&self, message: &BrokerMessage) -> Result<()> {
        self.client.publish(message).await
    }

    async fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>> {
        let sub = self.client.subscribe(pattern).await?;
        Ok(Box::new(sub))
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.client.is_connected())
    }
}
