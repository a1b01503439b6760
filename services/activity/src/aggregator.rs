//! Applies activity events to the daily counters.
//!
//! `apply` validates the event, reserves its ID, upserts the durable row and
//! then mirrors the increment into the cache. Only the durable write decides
//! success; the outcome and any best-effort failures are reported separately
//! in `ApplyReport`.

use crate::counters::Counters;
use crate::dedup::{IdempotencyGuard, Reservation};
use crate::dual_store::DualStore;
use crate::error::StoreError;
use crate::event::{ActivityEvent, DayBucket, ValidationError};
use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

#[derive(Error, Debug)]
pub enum ApplyError {
    /// The authoritative write failed. Safe to retry.
    #[error("failed to record daily counters: {source}")]
    Durable {
        #[source]
        source: StoreError,
        /// Whether the dedup reservation was dropped after the failure
        reservation_released: bool,
    },
}

impl ApplyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApplyError::Durable { .. })
    }
}

/// What `apply` did with the event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        user_id: i64,
        stat_date: NaiveDate,
        increment: Counters,
    },
    /// The event ID was already applied inside the dedup window
    Duplicate,
    /// The event failed validation and was dropped
    Discarded(ValidationError),
}

/// Auxiliary failures that did not change the outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyWarning {
    /// Applied without a dedup reservation
    DedupUnavailable,
    /// The cache mirror was not updated
    CacheWriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub outcome: ApplyOutcome,
    pub warnings: Vec<ApplyWarning>,
}

impl ApplyReport {
    fn new(outcome: ApplyOutcome) -> Self {
        Self {
            outcome,
            warnings: Vec::new(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self.outcome, ApplyOutcome::Applied { .. })
    }
}

pub struct Aggregator {
    guard: IdempotencyGuard,
    store: DualStore,
    bucket: DayBucket,
}

impl Aggregator {
    pub fn new(guard: IdempotencyGuard, store: DualStore, bucket: DayBucket) -> Self {
        Self {
            guard,
            store,
            bucket,
        }
    }

    /// Apply one event at most once per dedup window
    #[instrument(skip(self, event), fields(event_id = %event.event_id, user_id = event.user_id, action = %event.action))]
    pub async fn apply(&self, event: &ActivityEvent) -> Result<ApplyReport, ApplyError> {
        let validated = match event.validate(Utc::now()) {
            Ok(validated) => validated,
            Err(reason) => {
                debug!(reason = %reason, "Discarding invalid activity event");
                metrics::counter!("activity.events.discarded").increment(1);
                return Ok(ApplyReport::new(ApplyOutcome::Discarded(reason)));
            }
        };

        let mut warnings = Vec::new();
        let reservation = self.guard.reserve(&validated.event_id).await;
        match reservation {
            Reservation::AlreadyProcessed => {
                metrics::counter!("activity.events.duplicate").increment(1);
                return Ok(ApplyReport::new(ApplyOutcome::Duplicate));
            }
            Reservation::Unavailable => warnings.push(ApplyWarning::DedupUnavailable),
            Reservation::Granted | Reservation::Bypassed => {}
        }

        let stat_date = self.bucket.stat_date(validated.occurred_at);
        let increment = Counters::increment_for(validated.action, validated.file_bytes);

        if let Err(source) = self
            .store
            .upsert_durable(validated.user_id, stat_date, &increment)
            .await
        {
            error!(error = %source, stat_date = %stat_date, "Durable upsert failed");
            metrics::counter!("activity.events.failed").increment(1);

            let reservation_released = if reservation == Reservation::Granted {
                match self.guard.release(&validated.event_id).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "Failed to release dedup reservation");
                        false
                    }
                }
            } else {
                false
            };

            return Err(ApplyError::Durable {
                source,
                reservation_released,
            });
        }

        if let Err(e) = self
            .store
            .mirror(validated.user_id, stat_date, &increment)
            .await
        {
            warn!(error = %e, stat_date = %stat_date, "Cache mirror update failed");
            metrics::counter!("activity.cache.write_failed").increment(1);
            warnings.push(ApplyWarning::CacheWriteFailed(e.to_string()));
        }

        metrics::counter!("activity.events.applied").increment(1);
        debug!(stat_date = %stat_date, "Activity event applied");

        Ok(ApplyReport {
            outcome: ApplyOutcome::Applied {
                user_id: validated.user_id,
                stat_date,
                increment,
            },
            warnings,
        })
    }
}
