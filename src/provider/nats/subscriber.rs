//! NATS subscription adapter

use super::ORIGIN_HEADER;
use crate::error::Result;
use crate::provider::{BrokerMessage, Subscription};
use async_trait::async_trait;
use futures::StreamExt;

/// Wildcard subscription on core NATS subjects
pub struct NatsSubscription {
    subscriber: async_nats::Subscriber,
}

impl NatsSubscription {
    pub(crate) fn new(subscriber: async_nats::Subscriber) -> Self {
        Self { subscriber }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<BrokerMessage>> {
        let Some(msg) = self.subscriber.next().await else {
            return Ok(None);
        };

        let origin = msg
            .headers
            .as_ref()
            .and_then(|h| h.get(ORIGIN_HEADER))
            .map(|v| v.as_str().to_string())
            .unwrap_or_default();

        Ok(Some(BrokerMessage {
            channel: msg.subject.to_string(),
            origin,
            payload: msg.payload,
        }))
    }
}
