//! NATS-based implementation of the EventBus trait

use crate::{BusError, BusMessage, BusResult, EventBus};
use async_nats::connection::State;
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;

/// EventBus implementation using NATS
///
/// Wraps an `async_nats::Client`. Consumer groups map onto NATS queue groups,
/// so members of one group share the subject's messages.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = NatsBus::connect("nats://localhost:4222").await?;
/// bus.publish("streaming.metrics", b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect to a NATS server
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::ConnectionError(format!("{}: {}", url, e)))?;
        Ok(Self::new(client))
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn convert(nats_msg: async_nats::Message) -> BusMessage {
        let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

        if let Some(reply) = nats_msg.reply {
            msg = msg.with_reply_to(reply.to_string());
        }

        if let Some(nats_headers) = nats_msg.headers {
            let mut headers = HashMap::new();
            for (key, values) in nats_headers.iter() {
                // First value wins
                if let Some(value) = values.first() {
                    headers.insert(key.to_string(), value.to_string());
                }
            }
            if !headers.is_empty() {
                msg = msg.with_headers(headers);
            }
        }

        msg
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        let mut nats_headers = HeaderMap::new();
        for (key, value) in &headers {
            nats_headers.insert(key.as_str(), value.as_str());
        }

        self.client
            .publish_with_headers(subject.to_string(), nats_headers, payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        Ok(subscriber.map(Self::convert).boxed())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        Ok(subscriber.map(Self::convert).boxed())
    }

    async fn health_check(&self) -> BusResult<()> {
        match self.client.connection_state() {
            State::Connected => Ok(()),
            other => Err(BusError::ConnectionError(format!(
                "NATS connection is {:?}",
                other
            ))),
        }
    }

    async fn flush(&self) -> BusResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))
    }
}
