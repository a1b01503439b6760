//! In-process implementations of the storage seams.
//!
//! They honor the same contracts as the Redis and PostgreSQL backends
//! (atomic set-if-absent with expiry, additive upsert, expiring hashes) and
//! can be switched into a failing state to exercise outage handling.

use crate::counters::{Counters, COUNTER_FIELDS};
use crate::daily_cache::DailyCache;
use crate::daily_store::{DailyCounterRow, DailyStore};
use crate::dedup::DedupStore;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn check(unavailable: &AtomicBool, what: &str) -> StoreResult<()> {
    if unavailable.load(Ordering::SeqCst) {
        Err(StoreError::Unavailable(format!("{} is switched off", what)))
    } else {
        Ok(())
    }
}

/// Dedup markers with wall-clock expiry
#[derive(Default)]
pub struct MemoryDedupStore {
    markers: Mutex<HashMap<String, Instant>>,
    unavailable: AtomicBool,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.markers
            .lock()
            .get(key)
            .is_some_and(|expires| *expires > Instant::now())
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        check(&self.unavailable, "dedup store")?;
        let now = Instant::now();
        let mut markers = self.markers.lock();
        match markers.get(key) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                markers.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        check(&self.unavailable, "dedup store")?;
        self.markers.lock().remove(key);
        Ok(())
    }
}

/// Daily counter table kept in a map
#[derive(Default)]
pub struct MemoryDailyStore {
    rows: Mutex<HashMap<(i64, NaiveDate), DailyCounterRow>>,
    unavailable: AtomicBool,
}

impl MemoryDailyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn row(&self, user_id: i64, stat_date: NaiveDate) -> Option<DailyCounterRow> {
        self.rows.lock().get(&(user_id, stat_date)).cloned()
    }

    /// Counters of every stored row, keyed by `(user_id, stat_date)`
    pub fn snapshot(&self) -> HashMap<(i64, NaiveDate), Counters> {
        self.rows
            .lock()
            .iter()
            .map(|(key, row)| (*key, row.counters))
            .collect()
    }
}

#[async_trait]
impl DailyStore for MemoryDailyStore {
    async fn upsert(
        &self,
        user_id: i64,
        stat_date: NaiveDate,
        increment: &Counters,
    ) -> StoreResult<()> {
        check(&self.unavailable, "daily store")?;
        let now = Utc::now();
        let mut rows = self.rows.lock();
        rows.entry((user_id, stat_date))
            .and_modify(|row| {
                row.counters += *increment;
                row.updated_at = now;
            })
            .or_insert_with(|| DailyCounterRow {
                user_id,
                stat_date,
                counters: *increment,
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn range(
        &self,
        user_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DailyCounterRow>> {
        check(&self.unavailable, "daily store")?;
        let mut rows: Vec<DailyCounterRow> = self
            .rows
            .lock()
            .values()
            .filter(|row| row.user_id == user_id && row.stat_date >= from && row.stat_date <= to)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.stat_date);
        Ok(rows)
    }
}

struct CachedHash {
    fields: HashMap<String, String>,
    expires: Instant,
}

/// Expiring counter hashes
#[derive(Default)]
pub struct MemoryDailyCache {
    entries: Mutex<HashMap<(i64, NaiveDate), CachedHash>>,
    unavailable: AtomicBool,
}

impl MemoryDailyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop the entry for a day, as if it had expired
    pub fn evict(&self, user_id: i64, stat_date: NaiveDate) {
        self.entries.lock().remove(&(user_id, stat_date));
    }

    /// Store a raw field value, bypassing increment semantics
    pub fn put_raw(&self, user_id: i64, stat_date: NaiveDate, field: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock();
        let entry = entries.entry((user_id, stat_date)).or_insert_with(|| CachedHash {
            fields: HashMap::new(),
            expires: Instant::now() + ttl,
        });
        entry.fields.insert(field.to_string(), value.to_string());
    }
}

#[async_trait]
impl DailyCache for MemoryDailyCache {
    async fn increment(
        &self,
        user_id: i64,
        stat_date: NaiveDate,
        increment: &Counters,
        ttl: Duration,
    ) -> StoreResult<()> {
        check(&self.unavailable, "daily cache")?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry((user_id, stat_date)).or_insert_with(|| CachedHash {
            fields: HashMap::new(),
            expires: now + ttl,
        });
        if entry.expires <= now {
            entry.fields.clear();
        }
        for (field, delta) in increment.fields() {
            let current = entry
                .fields
                .get(field)
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0);
            entry.fields.insert(field.to_string(), (current + delta).to_string());
        }
        entry.expires = now + ttl;
        Ok(())
    }

    async fn fetch(&self, user_id: i64, stat_date: NaiveDate) -> StoreResult<HashMap<String, String>> {
        check(&self.unavailable, "daily cache")?;
        let entries = self.entries.lock();
        Ok(entries
            .get(&(user_id, stat_date))
            .filter(|entry| entry.expires > Instant::now())
            .map(|entry| entry.fields.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;

    #[tokio::test(start_paused = true)]
    async fn test_cache_entry_expires() {
        let cache = MemoryDailyCache::new();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let ttl = Duration::from_secs(60);

        cache
            .increment(1, date, &Counters::increment_for(Action::Upload, 5), ttl)
            .await
            .unwrap();
        assert_eq!(cache.fetch(1, date).await.unwrap().len(), COUNTER_FIELDS.len());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.fetch(1, date).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_accumulates() {
        let store = MemoryDailyStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        store
            .upsert(1, date, &Counters::increment_for(Action::Upload, 5))
            .await
            .unwrap();
        store
            .upsert(1, date, &Counters::increment_for(Action::Upload, 7))
            .await
            .unwrap();

        let row = store.row(1, date).unwrap();
        assert_eq!(row.counters.upload_count, 2);
        assert_eq!(row.counters.upload_bytes, 12);
        assert!(row.updated_at >= row.created_at);
    }
}
