mod config;
mod factory;
mod postgres;
mod sqlite;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::create_store;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Read-modify-write callback for [`CacheStore::update`]. Receives the live
/// value (if any) and returns the value to write back.
pub type UpdateFn = Box<dyn FnOnce(Option<Vec<u8>>) -> crate::Result<Vec<u8>> + Send>;

/// Durable key/value store backing the resource cache.
///
/// Storage-layer failures are always returned to the caller. Expired entries
/// behave exactly like missing ones.
#[async_trait]
pub trait CacheStore: Send + Sync {
    // Initialize database schema
    async fn init(&self) -> crate::Result<()>;

    async fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> crate::Result<()>;

    /// Atomically reads `key`, applies `apply` and writes the result back
    /// without expiry. Concurrent updates of the same key are serialized.
    async fn update(&self, key: &str, apply: UpdateFn) -> crate::Result<()>;

    async fn delete(&self, key: &str) -> crate::Result<()>;

    /// Physically removes expired rows, returning how many were dropped.
    async fn purge_expired(&self) -> crate::Result<u64>;
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn expiry_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_millis() + ttl.as_millis() as i64)
}
