//! Read path: recent daily counters for one user, with totals.

use crate::counters::Counters;
use crate::dual_store::{DailySummary, DualStore};
use crate::error::StoreResult;
use crate::event::DayBucket;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub const DEFAULT_WINDOW_DAYS: i64 = 7;
pub const MAX_WINDOW_DAYS: i64 = 90;

/// Non-positive windows use the default; larger ones are capped.
pub fn clamp_days(days: i64) -> i64 {
    if days <= 0 {
        DEFAULT_WINDOW_DAYS
    } else {
        days.min(MAX_WINDOW_DAYS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub days: i64,
    /// Oldest day first, ending today
    pub items: Vec<DailySummary>,
    pub totals: Counters,
}

#[derive(Clone)]
pub struct SummaryReader {
    store: DualStore,
    bucket: DayBucket,
}

impl SummaryReader {
    pub fn new(store: DualStore, bucket: DayBucket) -> Self {
        Self { store, bucket }
    }

    /// Counters for the last `days` calendar days, ending today
    pub async fn summary(&self, user_id: i64, days: i64) -> StoreResult<ActivitySummary> {
        self.summary_at(user_id, days, self.bucket.today()).await
    }

    #[instrument(skip(self))]
    pub async fn summary_at(
        &self,
        user_id: i64,
        days: i64,
        today: NaiveDate,
    ) -> StoreResult<ActivitySummary> {
        let days = clamp_days(days);
        let start = today - ChronoDuration::days(days - 1);

        let items = self.store.load_window(user_id, start, today).await?;
        let totals = items.iter().map(|item| item.counters).sum();

        Ok(ActivitySummary {
            days,
            items,
            totals,
        })
    }
}
