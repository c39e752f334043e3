//! SQLite-backed private-state store.
//!
//! Secret material is generated once per local user and persisted under a
//! fixed identifier; it never leaves this machine. Values are hex-encoded
//! so the table stays inspectable with ordinary sqlite tooling.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::contract::PrivateStateStore;
use crate::errors::{AdapterError, Result};

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if missing) the database and ensure the schema.
    pub async fn open(database_url: &str) -> Result<Self> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite:{database_url}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(AdapterError::Database)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS private_state (
                key        TEXT PRIMARY KEY,
                value_hex  TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Private state store ready");
        Ok(SqliteStateStore { pool })
    }
}

#[async_trait]
impl PrivateStateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value_hex FROM private_state WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Ok(None),
            Some((value_hex,)) => hex::decode(&value_hex)
                .map(Some)
                .map_err(|e| AdapterError::PrivateState(format!("corrupt value under {key}: {e}"))),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO private_state (key, value_hex, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value_hex = excluded.value_hex,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(hex::encode(value))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
