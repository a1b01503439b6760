//! Expiring Redis mirror of the daily counters.
//!
//! Each `(user_id, stat_date)` maps to a hash `activity:daily:{user}:{date}`
//! whose fields are the counter names. Writes are per-field `HINCRBY` plus an
//! `EXPIRE` refresh in one MULTI/EXEC pipeline.

use crate::counters::Counters;
use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::NaiveDate;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

pub const DAILY_KEY_PREFIX: &str = "activity:daily";

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);

pub fn daily_key(user_id: i64, stat_date: NaiveDate) -> String {
    format!("{}:{}:{}", DAILY_KEY_PREFIX, user_id, stat_date.format("%Y-%m-%d"))
}

/// Fast, expiring copy of recent daily counters
#[async_trait]
pub trait DailyCache: Send + Sync {
    /// Add `increment` to the cached counters and refresh the expiry to `ttl`
    async fn increment(
        &self,
        user_id: i64,
        stat_date: NaiveDate,
        increment: &Counters,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Raw hash fields for the day; empty when the entry is cold
    async fn fetch(&self, user_id: i64, stat_date: NaiveDate) -> StoreResult<HashMap<String, String>>;
}

#[derive(Clone)]
pub struct RedisDailyCache {
    conn: ConnectionManager,
}

impl RedisDailyCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DailyCache for RedisDailyCache {
    async fn increment(
        &self,
        user_id: i64,
        stat_date: NaiveDate,
        increment: &Counters,
        ttl: Duration,
    ) -> StoreResult<()> {
        let key = daily_key(user_id, stat_date);
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, delta) in increment.fields() {
            pipe.hincr(&key, field, delta).ignore();
        }
        pipe.expire(&key, expire_seconds(ttl)).ignore();

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn fetch(&self, user_id: i64, stat_date: NaiveDate) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = conn.hgetall(daily_key(user_id, stat_date)).await?;
        Ok(hash)
    }
}

// EXPIRE with a negative value deletes the key
fn expire_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

/// Lay cached fields over a baseline.
///
/// Fields that are missing or do not parse as integers keep the baseline value.
pub fn overlay(baseline: Counters, cached: &HashMap<String, String>) -> Counters {
    let mut merged = baseline;
    for (field, raw) in cached {
        if let Ok(value) = raw.trim().parse::<i64>() {
            merged.set_field(field, value);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_key_format() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(daily_key(42, date), "activity:daily:42:2024-01-05");
    }

    #[test]
    fn test_overlay_prefers_cached_fields() {
        let baseline = Counters {
            upload_count: 1,
            upload_bytes: 10,
            share_count: 2,
            ..Default::default()
        };
        let cached: HashMap<String, String> = [
            ("upload_count", "3"),
            ("upload_bytes", "not-a-number"),
            ("download_count", "4"),
            ("unknown_field", "99"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let merged = overlay(baseline, &cached);
        assert_eq!(merged.upload_count, 3);
        assert_eq!(merged.upload_bytes, 10);
        assert_eq!(merged.share_count, 2);
        assert_eq!(merged.download_count, 4);
    }

    #[test]
    fn test_overlay_empty_hash_is_identity() {
        let baseline = Counters::increment_for(crate::event::Action::Delete, 4);
        assert_eq!(overlay(baseline, &HashMap::new()), baseline);
    }

    #[test]
    fn test_expire_seconds_saturates() {
        assert_eq!(expire_seconds(Duration::from_secs(14 * 24 * 3600)), 1_209_600);
        assert_eq!(expire_seconds(Duration::from_secs(u64::MAX)), i64::MAX);
    }
}
