use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnection, PgPoolOptions},
    Pool, Postgres,
};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::{
    store::{expiry_millis, now_millis, CacheStore, UpdateFn},
    Error, Result,
};

const SELECT_LIVE: &str =
    "SELECT value FROM cache_entries WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2)";

const UPSERT: &str = r#"
    INSERT INTO cache_entries (key, value, expires_at) VALUES ($1, $2, $3)
    ON CONFLICT (key) DO UPDATE SET
        value = EXCLUDED.value,
        expires_at = EXCLUDED.expires_at
"#;

pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                Error::Sqlx(e)
            })?;

        Ok(Self { pool })
    }

    async fn read_modify_write(conn: &mut PgConnection, key: &str, apply: UpdateFn) -> Result<()> {
        // Row locks cannot cover a key that does not exist yet, so serialize
        // on a transaction-scoped advisory lock derived from the key instead.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *conn)
            .await?;

        let current: Option<(Vec<u8>,)> = sqlx::query_as(SELECT_LIVE)
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&mut *conn)
            .await?;

        let next = apply(current.map(|(value,)| value))?;

        sqlx::query(UPSERT)
            .bind(key)
            .bind(next)
            .bind(None::<i64>)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl CacheStore for PostgresStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(SELECT_LIVE)
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        debug!(key, ?ttl, "Storing cache entry");

        sqlx::query(UPSERT)
            .bind(key)
            .bind(value)
            .bind(expiry_millis(ttl))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update(&self, key: &str, apply: UpdateFn) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        // Dropping `tx` on error rolls the transaction back.
        Self::read_modify_write(&mut tx, key, apply).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
