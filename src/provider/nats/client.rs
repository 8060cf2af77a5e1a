//! NATS client: connect, publish, subscribe

use super::config::NatsConfig;
use super::subscriber::NatsSubscription;
use super::ORIGIN_HEADER;
use crate::error::{StreamError, Result};
use crate::provider::BrokerMessage;
use std::sync::Arc;
use std::time::Duration;

/// NATS client
///
/// Low-level client for publishing and subscribing to session channels.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// Configuration
    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| StreamError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Publish a message with its origin in a header
    pub async fn publish(&self, message: &BrokerMessage) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(ORIGIN_HEADER, message.origin.as_str());

        self.client
            .publish_with_headers(
                message.channel.clone(),
                headers,
                message.payload.clone(),
            )
            .await
            .map_err(|e| StreamError::Publish {
                channel: message.channel.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(
            channel = %message.channel,
            bytes = message.payload.len(),
            "Message published to NATS"
        );

        Ok(())
    }

    /// Subscribe to a subject pattern
    pub async fn subscribe(&self, pattern: &str) -> Result<NatsSubscription> {
        let subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| StreamError::Subscribe {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(pattern, "NATS subscription created");

        Ok(NatsSubscription::new(subscriber))
    }

    /// Flush pending publishes to the server
    pub async fn flush(&self) -> Result<()> {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        tokio::time::timeout(timeout, self.client.flush())
            .await
            .map_err(|_| {
                StreamError::Timeout(format!(
                    "NATS flush timed out after {}s",
                    self.config.request_timeout_secs
                ))
            })?
            .map_err(|e| StreamError::Connection(format!("flush failed: {}", e)))
    }

    /// Whether the connection is currently established
    pub fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}
