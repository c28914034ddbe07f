//! Storage pools (spec.md §3 "Storage Pool").
//!
//! A pool is just a named grouping row a shared-storage source points at; the
//! cache-isolation semantics live in [`crate::cache`] and [`crate::source`],
//! not here. Grounded on the same pooled-`SqlitePool` access pattern as
//! [`crate::source::SourceRegistry`].

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoragePool {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("pool not found")]
    NotFound,
}

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Clone)]
pub struct PoolRegistry {
    pool: SqlitePool,
}

impl PoolRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, tenant_id: &str, name: &str) -> PoolResult<StoragePool> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO storage_pools (id, tenant_id, name) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(tenant_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.get(tenant_id, &id).await
    }

    pub async fn get(&self, tenant_id: &str, id: &str) -> PoolResult<StoragePool> {
        sqlx::query_as("SELECT id, tenant_id, name FROM storage_pools WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PoolError::NotFound)
    }

    pub async fn list(&self, tenant_id: &str) -> PoolResult<Vec<StoragePool>> {
        Ok(
            sqlx::query_as("SELECT id, tenant_id, name FROM storage_pools WHERE tenant_id = ? ORDER BY name")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Find-or-create by name, used when a source create request names a pool
    /// that doesn't exist yet.
    pub async fn get_or_create(&self, tenant_id: &str, name: &str) -> PoolResult<StoragePool> {
        let existing: Option<StoragePool> =
            sqlx::query_as("SELECT id, tenant_id, name FROM storage_pools WHERE tenant_id = ? AND name = ?")
                .bind(tenant_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        match existing {
            Some(pool) => Ok(pool),
            None => self.create(tenant_id, name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, DatabaseConfig};

    async fn registry() -> PoolRegistry {
        let pool = ConnectionPool::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .pool;
        sqlx::query("INSERT INTO apps (id, name, api_key_hash) VALUES ('t1','t1','h')")
            .execute(&pool)
            .await
            .unwrap();
        PoolRegistry::new(pool)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = registry().await;
        let a = registry.get_or_create("t1", "weather-pool").await.unwrap();
        let b = registry.get_or_create("t1", "weather-pool").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn list_orders_by_name() {
        let registry = registry().await;
        registry.create("t1", "b-pool").await.unwrap();
        registry.create("t1", "a-pool").await.unwrap();
        let pools = registry.list("t1").await.unwrap();
        assert_eq!(pools[0].name, "a-pool");
    }
}
