//! Turning delivered messages into acknowledgement decisions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use vault_activity::{ActivityEvent, Aggregator, ApplyOutcome};

#[derive(Error, Debug)]
#[error("failed to decode message payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Metadata about a received message
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }
}

/// What the consumer loop does with a message after handling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Commit the offset; the message is done
    Ack,
    /// Leave the offset uncommitted and deliver the message again
    Requeue,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> Disposition;
}

/// Applies activity events from the topic to the daily counters
pub struct ActivityHandler {
    aggregator: Arc<Aggregator>,
}

impl ActivityHandler {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl MessageHandler for ActivityHandler {
    async fn handle(&self, message: &IncomingMessage) -> Disposition {
        let event: ActivityEvent = match message.decode_json() {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    topic = %message.metadata.topic,
                    partition = message.metadata.partition,
                    offset = message.metadata.offset,
                    error = %e,
                    "Dropping undecodable activity message"
                );
                metrics::counter!("activity.messages.poison").increment(1);
                return Disposition::Ack;
            }
        };

        match self.aggregator.apply(&event).await {
            Ok(report) => {
                if matches!(report.outcome, ApplyOutcome::Duplicate) {
                    debug!(event_id = %event.event_id, "Skipping already applied event");
                }
                Disposition::Ack
            }
            Err(e) => {
                warn!(
                    event_id = %event.event_id,
                    partition = message.metadata.partition,
                    offset = message.metadata.offset,
                    error = %e,
                    "Apply failed, requeueing activity message"
                );
                Disposition::Requeue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_activity::dedup::DEFAULT_DEDUP_TTL;
    use vault_activity::memory::{MemoryDailyStore, MemoryDedupStore};
    use vault_activity::{Action, DayBucket, DualStore, IdempotencyGuard};

    fn setup() -> (ActivityHandler, Arc<MemoryDailyStore>) {
        let durable = Arc::new(MemoryDailyStore::new());
        let aggregator = Aggregator::new(
            IdempotencyGuard::new(Arc::new(MemoryDedupStore::new()), DEFAULT_DEDUP_TTL),
            DualStore::new(durable.clone(), None),
            DayBucket::Utc,
        );
        (ActivityHandler::new(Arc::new(aggregator)), durable)
    }

    fn message(payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            payload: payload.to_vec(),
            metadata: MessageMetadata {
                topic: "vault.activity".to_string(),
                offset: 41,
                ..Default::default()
            },
        }
    }

    fn encoded(event: &ActivityEvent) -> IncomingMessage {
        message(&serde_json::to_vec(event).unwrap())
    }

    #[tokio::test]
    async fn test_applied_and_duplicate_are_acked() {
        let (handler, durable) = setup();
        let msg = encoded(&ActivityEvent::new(11, Action::Upload, 1, 10));

        assert_eq!(handler.handle(&msg).await, Disposition::Ack);
        assert_eq!(handler.handle(&msg).await, Disposition::Ack);

        let today = DayBucket::Utc.today();
        assert_eq!(durable.row(11, today).unwrap().counters.upload_count, 1);
    }

    #[tokio::test]
    async fn test_poison_message_is_acked_and_dropped() {
        let (handler, durable) = setup();

        assert_eq!(handler.handle(&message(b"{not json")).await, Disposition::Ack);
        assert_eq!(handler.handle(&message(b"\"just text\"")).await, Disposition::Ack);
        assert!(durable.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_event_is_acked() {
        let (handler, durable) = setup();
        let msg = message(br#"{"event_id":"x","user_id":0,"action":"upload"}"#);

        assert_eq!(handler.handle(&msg).await, Disposition::Ack);
        assert!(durable.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_requeues_then_applies_once() {
        let (handler, durable) = setup();
        let msg = encoded(&ActivityEvent::new(12, Action::Delete, 1, 4));

        durable.set_unavailable(true);
        assert_eq!(handler.handle(&msg).await, Disposition::Requeue);

        durable.set_unavailable(false);
        assert_eq!(handler.handle(&msg).await, Disposition::Ack);
        assert_eq!(handler.handle(&msg).await, Disposition::Ack);

        let today = DayBucket::Utc.today();
        let row = durable.row(12, today).unwrap();
        assert_eq!(row.counters.delete_count, 1);
        assert_eq!(row.counters.delete_bytes, 4);
    }
}
