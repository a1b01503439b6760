//! Idempotency guard for activity events.
//!
//! Each event ID is reserved with an atomic set-if-absent carrying a TTL
//! (24 hours by default). The first reservation wins; later ones for the same
//! ID report `AlreadyProcessed` until the marker expires. A redelivery that
//! arrives after expiry is applied again.
//!
//! The guard fails open: if the dedup store cannot be reached the caller is
//! told `Unavailable` and aggregation proceeds without a reservation.

use crate::error::StoreResult;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEDUP_KEY_PREFIX: &str = "activity:event:dedup";

pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn dedup_key(event_id: &str) -> String {
    format!("{}:{}", DEDUP_KEY_PREFIX, event_id)
}

/// Backend holding dedup markers
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Set `key` with expiry `ttl` only if it does not exist.
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn remove(&self, key: &str) -> StoreResult<()>;
}

/// Dedup markers stored as Redis strings via `SET key 1 NX EX ttl`
#[derive(Clone)]
pub struct RedisDedupStore {
    conn: ConnectionManager,
}

impl RedisDedupStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let seconds = usize::try_from(ttl.as_secs()).unwrap_or(usize::MAX);

        // Nil reply when the key already exists
        let reply: Option<String> = conn
            .set_options(
                key,
                "1",
                SetOptions::default()
                    .conditional_set(ExistenceCheck::NX)
                    .with_expiration(SetExpiry::EX(seconds)),
            )
            .await?;

        Ok(reply.is_some())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// Result of trying to reserve an event ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// First sighting; the caller owns the reservation
    Granted,
    /// Another delivery already reserved this ID
    AlreadyProcessed,
    /// The dedup store failed; proceed without a reservation
    Unavailable,
    /// No event ID, or dedup is disabled; proceed without a reservation
    Bypassed,
}

/// First-writer-wins reservation of event IDs
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Option<Arc<dyn DedupStore>>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn DedupStore>, ttl: Duration) -> Self {
        Self {
            store: Some(store),
            ttl,
        }
    }

    /// A guard that never deduplicates
    pub fn disabled() -> Self {
        Self {
            store: None,
            ttl: DEFAULT_DEDUP_TTL,
        }
    }

    pub async fn reserve(&self, event_id: &str) -> Reservation {
        let Some(store) = &self.store else {
            return Reservation::Bypassed;
        };
        if event_id.is_empty() {
            return Reservation::Bypassed;
        }

        match store.set_if_absent(&dedup_key(event_id), self.ttl).await {
            Ok(true) => Reservation::Granted,
            Ok(false) => {
                debug!(event_id = %event_id, "Event already processed");
                Reservation::AlreadyProcessed
            }
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    error = %e,
                    "Dedup store unavailable, applying without reservation"
                );
                Reservation::Unavailable
            }
        }
    }

    /// Drop a reservation so a retry of the same event is not rejected
    pub async fn release(&self, event_id: &str) -> StoreResult<()> {
        match &self.store {
            Some(store) if !event_id.is_empty() => store.remove(&dedup_key(event_id)).await,
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("enabled", &self.store.is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}
