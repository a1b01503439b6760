//! Publishing activity events to Kafka.
//!
//! Events are JSON encoded, keyed by user so that one user's events stay on
//! one partition, and tagged with `message-type` and `event-id` headers.
//! `publish` resolves only once the broker has confirmed delivery.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use chrono::Utc;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use vault_activity::{ActivityEvent, ValidationError};

pub const MESSAGE_TYPE_HEADER: &str = "message-type";
pub const EVENT_ID_HEADER: &str = "event-id";
pub const ACTIVITY_MESSAGE_TYPE: &str = "activity_event";

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Rejected activity event: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Where the broker stored a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub event_id: String,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    /// Activity event keyed by its user
    pub fn activity(topic: impl Into<String>, event: &ActivityEvent) -> Result<Self, ProducerError> {
        Ok(Self::new_json(topic, event)?
            .with_key(event.user_id.to_string())
            .with_header(MESSAGE_TYPE_HEADER, ACTIVITY_MESSAGE_TYPE)
            .with_header(EVENT_ID_HEADER, &event.event_id))
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Seam between event producers and the broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Validate, fill missing ids and timestamps, and publish with confirmation
    async fn publish(&self, event: ActivityEvent) -> Result<DeliveryResult, ProducerError>;
}

/// Kafka producer for the activity topic
pub struct ActivityProducer {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl ActivityProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, ProducerError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.topics.activity.clone(),
            timeout: config.request_timeout(),
        })
    }

    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    async fn send(&self, message: &OutgoingMessage) -> Result<(i32, i64), ProducerError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(headers);
        if let Some(ref key) = message.key {
            record = record.key(key);
        }

        debug!(
            "Sending message to topic {} (size: {} bytes)",
            message.topic,
            message.payload.len()
        );

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

#[async_trait]
impl EventPublisher for ActivityProducer {
    #[instrument(skip(self, event), fields(user_id = event.user_id, action = %event.action))]
    async fn publish(&self, mut event: ActivityEvent) -> Result<DeliveryResult, ProducerError> {
        event.prepare(Utc::now())?;
        let message = OutgoingMessage::activity(&self.topic, &event)?;

        let (partition, offset) = self.send(&message).await?;
        debug!(
            event_id = %event.event_id,
            "Message delivered to partition {} at offset {}",
            partition, offset
        );

        Ok(DeliveryResult {
            topic: message.topic,
            partition,
            offset,
            event_id: event.event_id,
        })
    }
}

impl Drop for ActivityProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}
