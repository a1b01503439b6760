//! Vault Activity Aggregation
//!
//! Daily per-user activity counters (uploads, deletes, shares, downloads)
//! built from events delivered at least once. Each event changes the
//! counters at most once inside the dedup window.
//!
//! ## Features
//!
//! - **Validation**: unknown actions and missing users are rejected before
//!   any side effect
//! - **Idempotency**: first-writer-wins event ID reservation in Redis with a
//!   24 hour TTL, failing open when Redis is down
//! - **Durable counters**: one PostgreSQL row per user and day, updated by an
//!   atomic add-on-conflict upsert
//! - **Cache mirror**: Redis hashes with a 14 day sliding expiry, overriding
//!   the durable row on reads when warm
//!
//! ## Architecture
//!
//! ```text
//! ActivityEvent
//!      │
//!      ▼
//! ┌──────────────┐   SET NX EX   ┌──────────────┐
//! │ Aggregator   │──────────────▶│ Redis dedup  │
//! └──────────────┘               └──────────────┘
//!      │ increment
//!      ▼
//! ┌──────────────┐  upsert       ┌──────────────┐
//! │ DualStore    │──────────────▶│ PostgreSQL   │
//! │              │  HINCRBY      ├──────────────┤
//! │              │──────────────▶│ Redis hashes │
//! └──────────────┘               └──────────────┘
//!      ▲
//!      │ load_window
//! ┌──────────────┐
//! │ SummaryReader│
//! └──────────────┘
//! ```

pub mod aggregator;
pub mod backends;
pub mod config;
pub mod counters;
pub mod daily_cache;
pub mod daily_store;
pub mod dedup;
pub mod dual_store;
pub mod error;
pub mod event;
pub mod memory;
pub mod summary;

pub use aggregator::{Aggregator, ApplyError, ApplyOutcome, ApplyReport, ApplyWarning};
pub use backends::ActivityBackends;
pub use config::{AggregationConfig, DatabaseConfig, RedisConfig};
pub use counters::Counters;
pub use daily_cache::{DailyCache, RedisDailyCache};
pub use daily_store::{DailyCounterRow, DailyStore, PgDailyStore};
pub use dedup::{DedupStore, IdempotencyGuard, RedisDedupStore, Reservation};
pub use dual_store::{DailySummary, DualStore};
pub use error::StoreError;
pub use event::{Action, ActivityEvent, DayBucket, ValidatedEvent, ValidationError};
pub use summary::{clamp_days, ActivitySummary, SummaryReader};
