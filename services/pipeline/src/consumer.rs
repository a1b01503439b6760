//! Kafka consumer loop for the activity topic.
//!
//! Each loop handles one message at a time. An acknowledged message has its
//! offset committed; a requeued message is re-read by seeking its partition
//! back to the message's offset after a short backoff. Offsets are never
//! stored automatically, so a message is only ever skipped by an explicit
//! acknowledgement.

use crate::config::KafkaConfig;
use crate::handler::{Disposition, IncomingMessage, MessageHandler, MessageMetadata};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to declare topic {topic}: {message}")]
    TopologyError { topic: String, message: String },

    #[error("Message stream ended")]
    StreamEnded,
}

/// Create the activity topic if it does not exist yet
#[instrument(skip(config), fields(topic = %config.topics.activity))]
pub async fn ensure_topology(config: &KafkaConfig) -> Result<(), ConsumerError> {
    let topic_name = config.topics.activity.as_str();
    let topology_error = |message: String| ConsumerError::TopologyError {
        topic: topic_name.to_string(),
        message,
    };

    let admin: AdminClient<DefaultClientContext> = config
        .build_admin_config()
        .create()
        .map_err(|e| topology_error(e.to_string()))?;

    let topic = NewTopic::new(
        topic_name,
        config.topics.partitions,
        TopicReplication::Fixed(config.topics.replication_factor),
    );
    let options = AdminOptions::new().operation_timeout(Some(config.request_timeout()));

    let results = admin
        .create_topics([&topic], &options)
        .await
        .map_err(|e| topology_error(e.to_string()))?;

    for result in results {
        match result {
            Ok(name) => info!(topic = %name, "Created activity topic"),
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic = %name, "Activity topic already exists")
            }
            Err((_, code)) => return Err(topology_error(code.to_string())),
        }
    }

    Ok(())
}

/// Offset control the consumer loop needs from the Kafka client
#[cfg_attr(test, mockall::automock)]
trait PartitionCursor: Send + Sync {
    /// Mark `meta` as done so the group resumes after it
    fn commit(&self, meta: &MessageMetadata) -> KafkaResult<()>;

    /// Deliver `meta` again on the next read of its partition
    fn seek_back(&self, meta: &MessageMetadata) -> KafkaResult<()>;

    /// Synchronously commit the positions acknowledged by this loop
    fn commit_final(&self, positions: &HashMap<(String, i32), Offset>) -> KafkaResult<()>;
}

struct KafkaCursor<'a> {
    consumer: &'a StreamConsumer,
    seek_timeout: Duration,
}

impl PartitionCursor for KafkaCursor<'_> {
    fn commit(&self, meta: &MessageMetadata) -> KafkaResult<()> {
        self.consumer
            .commit(&commit_position(meta)?, CommitMode::Async)
    }

    fn seek_back(&self, meta: &MessageMetadata) -> KafkaResult<()> {
        self.consumer.seek(
            &meta.topic,
            meta.partition,
            Offset::Offset(meta.offset),
            self.seek_timeout,
        )
    }

    fn commit_final(&self, positions: &HashMap<(String, i32), Offset>) -> KafkaResult<()> {
        let positions = TopicPartitionList::from_topic_map(positions)?;
        self.consumer.commit(&positions, CommitMode::Sync)
    }
}

/// One consumer loop in the shared consumer group
pub struct ActivityConsumer {
    consumer: StreamConsumer,
    worker_id: usize,
    requeue_backoff: Duration,
    seek_timeout: Duration,
}

impl ActivityConsumer {
    /// Create a consumer and subscribe it to the activity topic
    pub fn new(config: &KafkaConfig, worker_id: usize) -> Result<Self, ConsumerError> {
        info!(
            worker_id,
            "Creating Kafka consumer for {} with group {}",
            config.bootstrap_servers, config.consumer.group_id
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.topics.activity.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        info!(
            worker_id,
            topic = %config.topics.activity,
            prefetch = config.prefetch(),
            "Subscribed to activity topic"
        );

        Ok(Self {
            consumer,
            worker_id,
            requeue_backoff: config.requeue_backoff(),
            seek_timeout: config.request_timeout(),
        })
    }

    /// Consume until `shutdown` is cancelled.
    ///
    /// A message already being handled is finished before returning. The end
    /// of the message stream is reported as an error.
    #[instrument(skip(self, handler, shutdown), fields(worker_id = self.worker_id))]
    pub async fn run<H>(&self, handler: Arc<H>, shutdown: CancellationToken) -> Result<(), ConsumerError>
    where
        H: MessageHandler + ?Sized,
    {
        let messages = self
            .consumer
            .stream()
            .map(|next| next.map(|message| convert_message(&message)));
        let cursor = KafkaCursor {
            consumer: &self.consumer,
            seek_timeout: self.seek_timeout,
        };

        info!("Starting message consumption loop");
        consume(messages, &cursor, handler.as_ref(), &shutdown, self.requeue_backoff).await
    }
}

async fn consume<S, C, H>(
    messages: S,
    cursor: &C,
    handler: &H,
    shutdown: &CancellationToken,
    requeue_backoff: Duration,
) -> Result<(), ConsumerError>
where
    S: Stream<Item = KafkaResult<IncomingMessage>>,
    C: PartitionCursor + ?Sized,
    H: MessageHandler + ?Sized,
{
    tokio::pin!(messages);

    let mut acked: HashMap<(String, i32), Offset> = HashMap::new();

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Received shutdown signal");
                break Ok(());
            }
            next = messages.next() => next,
        };

        let incoming = match next {
            Some(Ok(incoming)) => incoming,
            Some(Err(e)) => {
                error!(error = %e, "Kafka consumer error");
                continue;
            }
            None => break Err(ConsumerError::StreamEnded),
        };

        let meta = &incoming.metadata;
        debug!(
            partition = meta.partition,
            offset = meta.offset,
            "Received activity message"
        );

        match handler.handle(&incoming).await {
            Disposition::Ack => {
                if let Err(e) = cursor.commit(meta) {
                    warn!(error = %e, "Failed to commit offset");
                }
                acked.insert(
                    (meta.topic.clone(), meta.partition),
                    Offset::Offset(meta.offset + 1),
                );
                metrics::counter!("activity.messages.acked").increment(1);
            }
            Disposition::Requeue => {
                match cursor.seek_back(meta) {
                    Ok(()) => metrics::counter!("activity.messages.requeued").increment(1),
                    // Usually a revoked partition; its next owner reads from the last commit
                    Err(e) => warn!(
                        partition = meta.partition,
                        offset = meta.offset,
                        error = %e,
                        "Failed to seek back, leaving offset uncommitted"
                    ),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(requeue_backoff) => {}
                }
            }
        }
    };

    // Async commits may still be in flight when the loop stops
    if !acked.is_empty() {
        if let Err(e) = cursor.commit_final(&acked) {
            warn!(error = %e, "Failed to commit on shutdown");
        }
    }
    result
}

/// The committed position after `meta` is the next offset to read
fn commit_position(meta: &MessageMetadata) -> KafkaResult<TopicPartitionList> {
    let mut positions = TopicPartitionList::with_capacity(1);
    positions.add_partition_offset(
        &meta.topic,
        meta.partition,
        Offset::Offset(meta.offset + 1),
    )?;
    Ok(positions)
}

/// Copy a Kafka message into an owned `IncomingMessage`
fn convert_message<M: Message>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}
