//! Stale-while-revalidate background sweep (spec.md §4.8).
//!
//! A lone periodic task, grounded on the teacher's `scheduling` module shape
//! (tokio interval loop + `tracing` span per tick) but narrowed to the single
//! job this system needs: find cache entries whose `revalidate_at` is due,
//! re-run the dispatch for each as a forced refresh, and leave entries whose
//! refresh attempt fails exactly as they were (spec.md §4.8 "a failed
//! revalidation attempt only updates `revalidate_at`, not `expires_at` or the
//! stored body").

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::time;

use crate::dispatcher::{DispatchError, DispatchRequest, Dispatcher, Target};

/// Minimum time between revalidation attempts on the same entry, regardless
/// of how often the sweep runs (spec.md §4.8: "an entry already attempted
/// within the last hour is skipped").
const REVALIDATION_COOLDOWN_SECONDS: i64 = 3600;

#[derive(Debug, Error)]
pub enum RevalidatorError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type RevalidatorResult<T> = Result<T, RevalidatorError>;

#[derive(Debug, sqlx::FromRow)]
struct DueEntry {
    id: String,
    tenant_id: String,
    source_id: String,
    request_method: String,
    request_url: String,
}

pub struct Revalidator {
    pool: SqlitePool,
    dispatcher: Dispatcher,
}

impl Revalidator {
    pub fn new(pool: SqlitePool, dispatcher: Dispatcher) -> Self {
        Self { pool, dispatcher }
    }

    /// Entries that are expired (stale) and either never attempted or not
    /// attempted within the cooldown window. Revalidation is GET-only: the
    /// stored request is reconstructed from `(method, url)` alone, so a
    /// stored POST/PUT entry is left to expire and be purged instead
    /// (spec.md §4.8 design note — request bodies are never replayed).
    async fn due_entries(&self) -> RevalidatorResult<Vec<DueEntry>> {
        let now = Utc::now();
        let cutoff = (now - chrono::Duration::seconds(REVALIDATION_COOLDOWN_SECONDS)).to_rfc3339();
        let rows: Vec<DueEntry> = sqlx::query_as(
            "SELECT id, tenant_id, source_id, request_method, request_url
             FROM cache_entries
             WHERE expires_at IS NOT NULL AND expires_at <= ?
               AND request_method = 'GET'
               AND (revalidate_at IS NULL OR revalidate_at <= ?)",
        )
        .bind(now.to_rfc3339())
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_attempted(&self, id: &str) -> RevalidatorResult<()> {
        sqlx::query("UPDATE cache_entries SET revalidate_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// One sweep: refresh every due entry, independently of the others'
    /// outcome. Returns the count successfully refreshed.
    pub async fn run_once(&self) -> RevalidatorResult<usize> {
        let due = self.due_entries().await?;
        let mut refreshed = 0;
        for entry in due {
            self.mark_attempted(&entry.id).await?;

            let result = self
                .dispatcher
                .dispatch(DispatchRequest {
                    tenant_id: entry.tenant_id.clone(),
                    target: Target::ByUrl { url: entry.request_url.clone() },
                    method: entry.request_method.clone(),
                    body: None,
                    headers: Vec::new(),
                    force_refresh: true,
                    ttl_override: None,
                    request_region: None,
                    pii_detected: false,
                    tenant_kill_switch: false,
                })
                .await;

            match result {
                Ok(_) => {
                    refreshed += 1;
                    tracing::debug!(entry_id = %entry.id, "revalidated stale cache entry");
                }
                Err(DispatchError::BadGateway(reason)) => {
                    tracing::warn!(entry_id = %entry.id, reason, "revalidation attempt failed, entry left stale");
                }
                Err(err) => {
                    tracing::warn!(entry_id = %entry.id, %err, "revalidation attempt errored, entry left stale");
                }
            }
        }
        Ok(refreshed)
    }

    /// Run [`Self::run_once`] on a fixed interval until the process exits.
    pub async fn run_forever(self, interval: Duration) {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(count) if count > 0 => tracing::info!(count, "revalidation sweep complete"),
                Ok(_) => {}
                Err(err) => tracing::error!(%err, "revalidation sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerRegistry;
    use crate::cache::CacheStore;
    use crate::compliance::ComplianceGate;
    use crate::db::{ConnectionPool, DatabaseConfig};
    use crate::lineage::LineageRecorder;
    use crate::mock::MockCatalog;
    use crate::policy::PolicyEngine;
    use crate::source::SourceRegistry;

    async fn test_pool() -> SqlitePool {
        ConnectionPool::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .pool
    }

    async fn revalidator(pool: SqlitePool) -> Revalidator {
        let lineage = LineageRecorder::new(pool.clone());
        let dispatcher = Dispatcher::new(
            SourceRegistry::new(pool.clone(), [1u8; 32]),
            CacheStore::new(pool.clone(), lineage.clone()),
            BreakerRegistry::new(),
            PolicyEngine::new(pool.clone(), ComplianceGate::new(pool.clone())),
            MockCatalog::new(pool.clone()),
            lineage,
        );
        Revalidator::new(pool, dispatcher)
    }

    #[tokio::test]
    async fn non_get_entries_are_never_selected() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO apps (id, name, api_key_hash) VALUES ('t1','t1','h')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url) VALUES ('s1','t1','a','a','https://x')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO cache_entries (id, tenant_id, source_id, cache_key, request_method, request_url, response_status, response_body, expires_at)
             VALUES ('e1','t1','s1','k1','POST','https://x/y',200,x'7b7d', ?)",
        )
        .bind((Utc::now() - chrono::Duration::seconds(10)).to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let revalidator = revalidator(pool).await;
        let due = revalidator.due_entries().await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn entry_within_cooldown_is_skipped() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO apps (id, name, api_key_hash) VALUES ('t1','t1','h')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url) VALUES ('s1','t1','a','a','https://x')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO cache_entries (id, tenant_id, source_id, cache_key, request_method, request_url, response_status, response_body, expires_at, revalidate_at)
             VALUES ('e1','t1','s1','k1','GET','https://x/y',200,x'7b7d', ?, ?)",
        )
        .bind((Utc::now() - chrono::Duration::seconds(10)).to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let revalidator = revalidator(pool).await;
        let due = revalidator.due_entries().await.unwrap();
        assert!(due.is_empty());
    }
}
