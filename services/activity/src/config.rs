//! Configuration sections for the aggregation stores.
//!
//! Each section deserializes with defaults and is checked by `validate`
//! before any backend is opened.

use crate::daily_cache::DEFAULT_CACHE_TTL;
use crate::dedup::DEFAULT_DEDUP_TTL;
use crate::event::DayBucket;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Redis holds both the dedup markers and the counter mirror
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Without Redis, events are applied without dedup and reads hit Postgres only
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Lifetime of a dedup marker
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Sliding expiry of cached daily counters
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// `utc`, `local`, or a fixed offset such as `+08:00`
    #[serde(default)]
    pub day_bucket: DayBucket,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_dedup_ttl_secs() -> u64 {
    DEFAULT_DEDUP_TTL.as_secs()
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue {
                key: "database.min_connections".to_string(),
                message: "must not exceed max_connections".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            enabled: true,
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.url.is_empty() {
            return Err(ConfigError::MissingRequired("redis.url".to_string()));
        }
        Ok(())
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_secs: default_dedup_ttl_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            day_bucket: DayBucket::default(),
        }
    }
}

impl AggregationConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "aggregation.dedup_ttl_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "aggregation.cache_ttl_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let agg = AggregationConfig::default();
        assert_eq!(agg.dedup_ttl(), Duration::from_secs(86_400));
        assert_eq!(agg.cache_ttl(), Duration::from_secs(14 * 86_400));
        assert_eq!(agg.day_bucket, DayBucket::Utc);
        assert!(agg.validate().is_ok());
        assert!(RedisConfig::default().enabled);
    }

    #[test]
    fn test_deserialize_day_bucket_from_string() {
        let agg: AggregationConfig =
            serde_json::from_str(r#"{"day_bucket": "+08:00", "dedup_ttl_secs": 60}"#).unwrap();
        assert!(matches!(agg.day_bucket, DayBucket::Fixed(_)));
        assert_eq!(agg.dedup_ttl_secs, 60);
        assert_eq!(agg.cache_ttl_secs, default_cache_ttl_secs());

        assert!(serde_json::from_str::<AggregationConfig>(r#"{"day_bucket": "mars"}"#).is_err());
    }

    #[test]
    fn test_validation() {
        let db: DatabaseConfig = serde_json::from_str(r#"{"url": ""}"#).unwrap();
        assert_eq!(
            db.validate(),
            Err(ConfigError::MissingRequired("database.url".to_string()))
        );

        let agg = AggregationConfig {
            cache_ttl_secs: 0,
            ..Default::default()
        };
        assert!(agg.validate().is_err());

        let redis = RedisConfig {
            url: String::new(),
            enabled: false,
        };
        assert!(redis.validate().is_ok());
    }
}
