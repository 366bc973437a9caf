//! PostgreSQL-backed key/value store

use super::KeyValueStore;
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Key/value state persisted in a single `relayer_kv` table
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(RelayerError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relayer_kv (
                key VARCHAR(128) PRIMARY KEY,
                value BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for PostgresStore {
    async fn get_by_key(&self, key: &str) -> RelayerResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM relayer_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn set_by_key(&self, key: &str, value: &[u8]) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO relayer_kv (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key)
            DO UPDATE SET value = $2, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        debug!("Stored {} ({} bytes)", key, value.len());
        Ok(())
    }
}
