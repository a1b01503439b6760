//! Durable per-user daily counters in PostgreSQL.
//!
//! `user_activity_daily` holds one row per `(user_id, stat_date)`. Rows are
//! created by the first event of the day and afterwards only incremented,
//! with a single `INSERT ... ON CONFLICT DO UPDATE` so concurrent writers to
//! the same key need no application-level locking.

use crate::config::DatabaseConfig;
use crate::counters::Counters;
use crate::error::StoreResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Stored daily counters for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DailyCounterRow {
    pub user_id: i64,
    pub stat_date: NaiveDate,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub counters: Counters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Source of truth for daily counters
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DailyStore: Send + Sync {
    /// Add `increment` to the row for `(user_id, stat_date)`, creating it if needed
    async fn upsert(&self, user_id: i64, stat_date: NaiveDate, increment: &Counters)
        -> StoreResult<()>;

    /// Rows for `user_id` with `from <= stat_date <= to`, oldest first
    async fn range(
        &self,
        user_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DailyCounterRow>>;
}

/// PostgreSQL-backed daily counter table
#[derive(Clone)]
pub struct PgDailyStore {
    pool: PgPool,
}

impl PgDailyStore {
    /// Connect a pool using the database settings
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or update the daily counter table
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl DailyStore for PgDailyStore {
    #[instrument(skip(self, increment))]
    async fn upsert(
        &self,
        user_id: i64,
        stat_date: NaiveDate,
        increment: &Counters,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_activity_daily (
                user_id, stat_date,
                upload_count, upload_bytes, delete_count, delete_bytes,
                share_count, download_count, download_bytes,
                created_at, updated_at
            ) VALUES (
                $1, $2,
                $3, $4, $5, $6,
                $7, $8, $9,
                NOW(), NOW()
            )
            ON CONFLICT (user_id, stat_date) DO UPDATE SET
                upload_count   = user_activity_daily.upload_count   + EXCLUDED.upload_count,
                upload_bytes   = user_activity_daily.upload_bytes   + EXCLUDED.upload_bytes,
                delete_count   = user_activity_daily.delete_count   + EXCLUDED.delete_count,
                delete_bytes   = user_activity_daily.delete_bytes   + EXCLUDED.delete_bytes,
                share_count    = user_activity_daily.share_count    + EXCLUDED.share_count,
                download_count = user_activity_daily.download_count + EXCLUDED.download_count,
                download_bytes = user_activity_daily.download_bytes + EXCLUDED.download_bytes,
                updated_at     = NOW()
            "#,
        )
        .bind(user_id)
        .bind(stat_date)
        .bind(increment.upload_count)
        .bind(increment.upload_bytes)
        .bind(increment.delete_count)
        .bind(increment.delete_bytes)
        .bind(increment.share_count)
        .bind(increment.download_count)
        .bind(increment.download_bytes)
        .execute(&self.pool)
        .await?;

        debug!(user_id, stat_date = %stat_date, "Daily counters upserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn range(
        &self,
        user_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DailyCounterRow>> {
        let rows = sqlx::query_as::<_, DailyCounterRow>(
            r#"
            SELECT user_id, stat_date,
                   upload_count, upload_bytes, delete_count, delete_bytes,
                   share_count, download_count, download_bytes,
                   created_at, updated_at
            FROM user_activity_daily
            WHERE user_id = $1 AND stat_date >= $2 AND stat_date <= $3
            ORDER BY stat_date ASC
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
