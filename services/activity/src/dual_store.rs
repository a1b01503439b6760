//! Durable table plus optional cache, treated as one counter store.
//!
//! Writes go to the durable tier first; the cache mirror is a separate,
//! best-effort step the caller can ignore failures of. Reads use the durable
//! rows as a baseline and let a warm cache entry override them per day.

use crate::counters::Counters;
use crate::daily_cache::{overlay, DailyCache, DEFAULT_CACHE_TTL};
use crate::daily_store::DailyStore;
use crate::error::StoreResult;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Counters for one calendar day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub counters: Counters,
}

#[derive(Clone)]
pub struct DualStore {
    durable: Arc<dyn DailyStore>,
    cache: Option<Arc<dyn DailyCache>>,
    cache_ttl: Duration,
}

impl DualStore {
    pub fn new(durable: Arc<dyn DailyStore>, cache: Option<Arc<dyn DailyCache>>) -> Self {
        Self {
            durable,
            cache,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Apply an increment to the authoritative table
    pub async fn upsert_durable(
        &self,
        user_id: i64,
        stat_date: NaiveDate,
        increment: &Counters,
    ) -> StoreResult<()> {
        self.durable.upsert(user_id, stat_date, increment).await
    }

    /// Mirror an increment into the cache. A no-op without a cache tier.
    pub async fn mirror(
        &self,
        user_id: i64,
        stat_date: NaiveDate,
        increment: &Counters,
    ) -> StoreResult<()> {
        match &self.cache {
            Some(cache) => {
                cache
                    .increment(user_id, stat_date, increment, self.cache_ttl)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Per-day counters for `from..=to`, oldest first, one entry per day.
    ///
    /// Fails only when the durable query fails; cache errors fall back to the
    /// durable baseline for the affected day.
    pub async fn load_window(
        &self,
        user_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DailySummary>> {
        let rows = self.durable.range(user_id, from, to).await?;
        let by_date: HashMap<NaiveDate, Counters> = rows
            .into_iter()
            .map(|row| (row.stat_date, row.counters))
            .collect();

        let mut items = Vec::new();
        let mut date = from;
        while date <= to {
            let baseline = by_date.get(&date).copied().unwrap_or_default();
            let counters = self.overlay_cached(user_id, date, baseline).await;
            items.push(DailySummary { date, counters });
            date += ChronoDuration::days(1);
        }

        Ok(items)
    }

    async fn overlay_cached(&self, user_id: i64, date: NaiveDate, baseline: Counters) -> Counters {
        let Some(cache) = &self.cache else {
            return baseline;
        };
        match cache.fetch(user_id, date).await {
            Ok(hash) if !hash.is_empty() => overlay(baseline, &hash),
            Ok(_) => {
                debug!(user_id, date = %date, "Cache cold, using durable row");
                baseline
            }
            Err(e) => {
                warn!(user_id, date = %date, error = %e, "Cache read failed, using durable row");
                baseline
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;
    use crate::memory::{MemoryDailyCache, MemoryDailyStore};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn stores() -> (DualStore, Arc<MemoryDailyStore>, Arc<MemoryDailyCache>) {
        let durable = Arc::new(MemoryDailyStore::new());
        let cache = Arc::new(MemoryDailyCache::new());
        (
            DualStore::new(durable.clone(), Some(cache.clone())),
            durable,
            cache,
        )
    }

    #[tokio::test]
    async fn test_window_fills_missing_days_with_zeros() {
        let (store, _, _) = stores();
        let inc = Counters::increment_for(Action::Upload, 8);
        store.upsert_durable(1, date(2), &inc).await.unwrap();

        let items = store.load_window(1, date(1), date(3)).await.unwrap();
        let dates: Vec<_> = items.iter().map(|i| i.date).collect();
        assert_eq!(dates, vec![date(1), date(2), date(3)]);
        assert!(items[0].counters.is_zero());
        assert_eq!(items[1].counters, inc);
        assert!(items[2].counters.is_zero());
    }

    #[tokio::test]
    async fn test_warm_cache_overrides_durable_row() {
        let (store, _, cache) = stores();
        let inc = Counters::increment_for(Action::Download, 6);
        store.upsert_durable(1, date(2), &inc).await.unwrap();
        // A newer cached value, as if another write landed in between
        cache
            .increment(1, date(2), &Counters::increment_for(Action::Download, 6), DEFAULT_CACHE_TTL)
            .await
            .unwrap();
        cache
            .increment(1, date(2), &Counters::increment_for(Action::Download, 1), DEFAULT_CACHE_TTL)
            .await
            .unwrap();

        let items = store.load_window(1, date(2), date(2)).await.unwrap();
        assert_eq!(items[0].counters.download_count, 2);
        assert_eq!(items[0].counters.download_bytes, 7);
    }

    #[tokio::test]
    async fn test_cache_outage_falls_back_to_durable() {
        let (store, _, cache) = stores();
        let inc = Counters::increment_for(Action::Share, 0);
        store.upsert_durable(1, date(2), &inc).await.unwrap();
        cache.set_unavailable(true);

        assert!(store.mirror(1, date(2), &inc).await.is_err());
        let items = store.load_window(1, date(2), date(2)).await.unwrap();
        assert_eq!(items[0].counters, inc);
    }

    #[tokio::test]
    async fn test_durable_failure_fails_read() {
        let (store, durable, _) = stores();
        durable.set_unavailable(true);
        assert!(store.load_window(1, date(1), date(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_without_cache_tier() {
        let durable = Arc::new(MemoryDailyStore::new());
        let store = DualStore::new(durable, None);
        let inc = Counters::increment_for(Action::Upload, 3);

        store.upsert_durable(9, date(4), &inc).await.unwrap();
        store.mirror(9, date(4), &inc).await.unwrap();
        assert!(!store.has_cache());

        let items = store.load_window(9, date(4), date(4)).await.unwrap();
        assert_eq!(items[0].counters, inc);
    }
}
