use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::{path::Path, str::FromStr, time::Duration};
use tracing::{debug, error, info};

use crate::{
    store::{expiry_millis, now_millis, CacheStore, UpdateFn},
    Error, Result,
};

const SELECT_LIVE: &str =
    "SELECT value FROM cache_entries WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)";

const UPSERT: &str = r#"
    INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
    ON CONFLICT(key) DO UPDATE SET
        value = excluded.value,
        expires_at = excluded.expires_at
"#;

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to SQLite database: {}", database_url);

        let in_memory = matches!(database_url, ":memory:" | "sqlite::memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| {
                error!("Invalid SQLite path {}: {}", database_url, e);
                Error::Sqlx(e)
            })?
            .create_if_missing(true);

        // In-memory databases live and die with their single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            if let Some(parent) = Path::new(database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(max_connections)
        };

        let pool = pool_options.connect_with(options).await.map_err(|e| {
            error!("Failed to connect to SQLite: {}", e);
            Error::Sqlx(e)
        })?;

        Ok(Self { pool })
    }

    async fn read_modify_write(conn: &mut SqliteConnection, key: &str, apply: UpdateFn) -> Result<()> {
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
impl CacheStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations/sqlite")
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
        let mut conn = self.pool.acquire().await?;

        // IMMEDIATE takes the write lock up front so the read below cannot
        // be invalidated by another writer before we write back.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::read_modify_write(&mut conn, key, apply).await {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    error!("Failed to roll back update of {}: {}", key, rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
