//! Relational store connection pool.
//!
//! Thin wrapper around an `sqlx` pool with startup migrations, mirroring the
//! connection-pool/health-check shape the rest of this codebase uses for
//! every other subsystem (breaker stats, rate-limit counters, lineage).

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `sqlite://path/to/file.db` or `sqlite::memory:`.
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://cachegate.db".to_string(),
            min_connections: 1,
            max_connections: 20,
            connect_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection pool error: {0}")]
    Pool(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = Result<T, DbError>;

/// A pooled connection to the relational store, with migrations applied.
#[derive(Clone)]
pub struct ConnectionPool {
    pub pool: SqlitePool,
}

impl ConnectionPool {
    pub async fn connect(config: &DatabaseConfig) -> DbResult<Self> {
        let options = if config.url == "sqlite::memory:" {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(config.url.trim_start_matches("sqlite://"))
                .create_if_missing(true)
        }
        .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .min_connections(if config.url == "sqlite::memory:" {
                1
            } else {
                config.min_connections
            })
            .max_connections(if config.url == "sqlite::memory:" {
                1
            } else {
                config.max_connections
            })
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn sqlite(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_and_migrates_in_memory() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        };
        let pool = ConnectionPool::connect(&config).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM apps")
            .fetch_one(pool.sqlite())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
