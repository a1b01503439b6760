//! Recording user activity from request handlers.
//!
//! `emit` publishes to the broker and, when the broker cannot take the
//! event, applies it in-process so the activity is still counted.

use crate::producer::{DeliveryResult, EventPublisher, ProducerError};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use vault_activity::{Action, ActivityEvent, Aggregator, ApplyError, ApplyReport, ValidationError};

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("invalid activity event: {0}")]
    Invalid(#[from] ValidationError),

    /// Publishing failed and so did the direct apply
    #[error("failed to record activity: publish failed ({publish}), direct apply failed: {apply}")]
    Unrecorded {
        publish: ProducerError,
        #[source]
        apply: ApplyError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    Published(DeliveryResult),
    /// The broker was unavailable and the event was applied synchronously
    AppliedDirectly(ApplyReport),
}

#[derive(Clone)]
pub struct ActivityEmitter {
    publisher: Arc<dyn EventPublisher>,
    aggregator: Arc<Aggregator>,
}

impl ActivityEmitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, aggregator: Arc<Aggregator>) -> Self {
        Self {
            publisher,
            aggregator,
        }
    }

    /// Record one user action, stamped now with a fresh event ID
    #[instrument(skip(self))]
    pub async fn emit(
        &self,
        user_id: i64,
        action: Action,
        file_id: u64,
        file_bytes: i64,
    ) -> Result<EmitOutcome, EmitError> {
        self.emit_event(ActivityEvent::new(user_id, action, file_id, file_bytes))
            .await
    }

    /// Record a caller-built event. Missing IDs and timestamps are filled in.
    pub async fn emit_event(&self, mut event: ActivityEvent) -> Result<EmitOutcome, EmitError> {
        event.prepare(Utc::now())?;

        let publish = match self.publisher.publish(event.clone()).await {
            Ok(delivery) => {
                debug!(event_id = %delivery.event_id, "Activity event published");
                return Ok(EmitOutcome::Published(delivery));
            }
            Err(ProducerError::Invalid(reason)) => return Err(EmitError::Invalid(reason)),
            Err(e) => e,
        };

        warn!(
            event_id = %event.event_id,
            error = %publish,
            "Publish failed, applying activity event directly"
        );
        metrics::counter!("activity.emit.fallback").increment(1);

        match self.aggregator.apply(&event).await {
            Ok(report) => Ok(EmitOutcome::AppliedDirectly(report)),
            Err(apply) => Err(EmitError::Unrecorded { publish, apply }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::MockEventPublisher;
    use vault_activity::dedup::DEFAULT_DEDUP_TTL;
    use vault_activity::memory::{MemoryDailyCache, MemoryDailyStore, MemoryDedupStore};
    use vault_activity::{ApplyOutcome, DayBucket, DualStore, IdempotencyGuard};

    struct Harness {
        aggregator: Arc<Aggregator>,
        durable: Arc<MemoryDailyStore>,
    }

    fn harness() -> Harness {
        let durable = Arc::new(MemoryDailyStore::new());
        let aggregator = Arc::new(Aggregator::new(
            IdempotencyGuard::new(Arc::new(MemoryDedupStore::new()), DEFAULT_DEDUP_TTL),
            DualStore::new(durable.clone(), Some(Arc::new(MemoryDailyCache::new()))),
            DayBucket::Utc,
        ));
        Harness {
            aggregator,
            durable,
        }
    }

    fn broker_down() -> MockEventPublisher {
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().returning(|_| {
            Err(ProducerError::SendError {
                topic: "vault.activity".to_string(),
                message: "Local: All broker connections are down".to_string(),
            })
        });
        publisher
    }

    #[tokio::test]
    async fn test_published_event_is_not_applied_locally() {
        let h = harness();
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|event| {
                event.user_id == 5 && event.action == "upload" && !event.event_id.is_empty()
            })
            .times(1)
            .returning(|event| {
                Ok(DeliveryResult {
                    topic: "vault.activity".to_string(),
                    partition: 0,
                    offset: 12,
                    event_id: event.event_id,
                })
            });

        let emitter = ActivityEmitter::new(Arc::new(publisher), h.aggregator.clone());
        let outcome = emitter.emit(5, Action::Upload, 1, 10).await.unwrap();

        assert!(matches!(outcome, EmitOutcome::Published(ref d) if d.offset == 12));
        assert!(h.durable.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_broker_failure_falls_back_to_direct_apply() {
        let h = harness();
        let emitter = ActivityEmitter::new(Arc::new(broker_down()), h.aggregator.clone());

        let outcome = emitter.emit(5, Action::Download, 1, 6).await.unwrap();
        let report = match outcome {
            EmitOutcome::AppliedDirectly(report) => report,
            other => panic!("expected direct apply, got {:?}", other),
        };
        assert!(report.is_applied());

        let today = DayBucket::Utc.today();
        let row = h.durable.row(5, today).unwrap();
        assert_eq!(row.counters.download_count, 1);
        assert_eq!(row.counters.download_bytes, 6);
    }

    #[tokio::test]
    async fn test_fallback_matches_consumer_path() {
        let actions = [
            (Action::Upload, 10),
            (Action::Share, 0),
            (Action::Download, 6),
            (Action::Delete, 4),
        ];
        let events: Vec<_> = actions
            .iter()
            .map(|(action, bytes)| ActivityEvent::new(9, *action, 1, *bytes))
            .collect();

        // Events that travel through the broker and are applied by a consumer
        let consumed = harness();
        for e in &events {
            consumed.aggregator.apply(e).await.unwrap();
        }

        // The same events emitted while the broker is down
        let direct = harness();
        let emitter = ActivityEmitter::new(Arc::new(broker_down()), direct.aggregator.clone());
        for e in &events {
            emitter.emit_event(e.clone()).await.unwrap();
        }

        assert_eq!(consumed.durable.snapshot(), direct.durable.snapshot());
    }

    #[tokio::test]
    async fn test_fallback_then_redelivery_counts_once() {
        let h = harness();
        let emitter = ActivityEmitter::new(Arc::new(broker_down()), h.aggregator.clone());
        let event = ActivityEvent::new(3, Action::Upload, 1, 10);

        emitter.emit_event(event.clone()).await.unwrap();
        let report = h.aggregator.apply(&event).await.unwrap();

        assert_eq!(report.outcome, ApplyOutcome::Duplicate);
        let today = DayBucket::Utc.today();
        assert_eq!(h.durable.row(3, today).unwrap().counters.upload_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_input_fails_fast() {
        let h = harness();
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().never();
        let emitter = ActivityEmitter::new(Arc::new(publisher), h.aggregator.clone());

        let err = emitter.emit(0, Action::Share, 0, 0).await.unwrap_err();
        assert!(matches!(err, EmitError::Invalid(ValidationError::InvalidUserId(0))));

        let mut event = ActivityEvent::new(1, Action::Share, 0, 0);
        event.action = "rename".to_string();
        assert!(matches!(
            emitter.emit_event(event).await,
            Err(EmitError::Invalid(ValidationError::InvalidAction(_)))
        ));
        assert!(h.durable.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_fails_when_publish_and_apply_both_fail() {
        let h = harness();
        h.durable.set_unavailable(true);
        let emitter = ActivityEmitter::new(Arc::new(broker_down()), h.aggregator.clone());

        let err = emitter.emit(5, Action::Upload, 1, 10).await.unwrap_err();
        assert!(matches!(err, EmitError::Unrecorded { .. }));
    }

    #[tokio::test]
    async fn test_missing_id_and_timestamp_are_filled() {
        let h = harness();
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|event| !event.event_id.is_empty() && event.occurred_at.is_some())
            .times(1)
            .returning(|event| {
                Ok(DeliveryResult {
                    topic: "vault.activity".to_string(),
                    partition: 1,
                    offset: 0,
                    event_id: event.event_id,
                })
            });
        let emitter = ActivityEmitter::new(Arc::new(publisher), h.aggregator.clone());

        let event = ActivityEvent {
            event_id: String::new(),
            user_id: 8,
            action: "share".to_string(),
            file_id: 0,
            file_bytes: 0,
            occurred_at: None,
        };
        assert!(matches!(
            emitter.emit_event(event).await.unwrap(),
            EmitOutcome::Published(_)
        ));
    }
}
