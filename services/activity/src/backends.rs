//! Wiring of the production backends from configuration.

use crate::aggregator::Aggregator;
use crate::config::{AggregationConfig, DatabaseConfig, RedisConfig};
use crate::daily_cache::{DailyCache, RedisDailyCache};
use crate::daily_store::PgDailyStore;
use crate::dedup::{IdempotencyGuard, RedisDedupStore};
use crate::dual_store::DualStore;
use crate::summary::SummaryReader;
use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{info, warn};

/// Open a reconnecting Redis connection
pub async fn connect_redis(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).context("failed to parse Redis connection string")?;
    let manager = ConnectionManager::new(client)
        .await
        .context("failed to initialize Redis connection manager")?;
    info!("Connected to Redis");
    Ok(manager)
}

/// Aggregation write path and read path sharing one pair of stores
pub struct ActivityBackends {
    pub aggregator: Arc<Aggregator>,
    pub reader: SummaryReader,
}

impl ActivityBackends {
    pub async fn connect(
        database: &DatabaseConfig,
        redis: &RedisConfig,
        aggregation: &AggregationConfig,
    ) -> Result<Self> {
        let daily_store = PgDailyStore::connect(database)
            .await
            .context("Failed to initialize daily store")?;

        if database.run_migrations {
            daily_store
                .run_migrations()
                .await
                .context("Failed to run database migrations")?;
        }

        let (guard, cache) = if redis.enabled {
            let conn = connect_redis(&redis.url).await?;
            let guard = IdempotencyGuard::new(
                Arc::new(RedisDedupStore::new(conn.clone())),
                aggregation.dedup_ttl(),
            );
            let cache: Arc<dyn DailyCache> = Arc::new(RedisDailyCache::new(conn));
            (guard, Some(cache))
        } else {
            warn!("Redis disabled: events are applied without dedup and reads use Postgres only");
            (IdempotencyGuard::disabled(), None)
        };

        let store = DualStore::new(Arc::new(daily_store), cache)
            .with_cache_ttl(aggregation.cache_ttl());

        Ok(Self {
            aggregator: Arc::new(Aggregator::new(
                guard,
                store.clone(),
                aggregation.day_bucket,
            )),
            reader: SummaryReader::new(store, aggregation.day_bucket),
        })
    }
}
