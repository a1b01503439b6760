//! Vault Activity Pipeline - Kafka delivery for activity aggregation
//!
//! Moves activity events from the services that observe user actions to the
//! aggregator:
//!
//! - `ActivityEmitter` publishes an event and, when Kafka is unavailable,
//!   applies it in-process instead
//! - `ActivityConsumer` loops read the activity topic in one consumer group,
//!   committing handled messages and seeking back to retry failed ones
//! - `Supervisor` runs the loops and stops the process when one of them dies
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vault_activity::{Action, ActivityBackends};
//! use vault_pipeline::{ActivityEmitter, ActivityProducer, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig::load()?;
//!     let backends =
//!         ActivityBackends::connect(&config.database, &config.redis, &config.aggregation).await?;
//!     let producer = Arc::new(ActivityProducer::new(&config.kafka)?);
//!
//!     let emitter = ActivityEmitter::new(producer, backends.aggregator.clone());
//!     emitter.emit(42, Action::Upload, 7, 1024).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod emitter;
pub mod handler;
pub mod producer;
pub mod supervisor;

pub use crate::config::{
    ConsumerConfig, KafkaConfig, SaslConfig, SaslMechanism, SecurityProtocol, ServiceConfig,
    SslConfig, TopicConfig, WorkerConfig,
};
pub use consumer::{ensure_topology, ActivityConsumer, ConsumerError};
pub use emitter::{ActivityEmitter, EmitError, EmitOutcome};
pub use handler::{ActivityHandler, Disposition, IncomingMessage, MessageHandler, MessageMetadata};
pub use producer::{ActivityProducer, DeliveryResult, EventPublisher, OutgoingMessage, ProducerError};
pub use supervisor::{Supervisor, SupervisorError};
