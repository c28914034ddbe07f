//! Fixed-window rate limiting (spec.md §3 "Rate Limit Rule", §4.4).
//!
//! The windowing algorithm itself lives in [`crate::distributed`]; this
//! module resolves which rule applies (source-specific overrides
//! tenant-wide, enforced by `uq_rate_limit_rules_scope`) and shapes the
//! result the dispatcher and management API need.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::distributed::DistributedStore;

#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub max_requests: u64,
    pub window_seconds: u64,
    pub enabled: bool,
}

/// A stored rule, with its identity and scope, as returned by the
/// management API (spec.md §6 "Management surface"). [`RateLimitRule`]
/// above stays the narrower shape `check()` resolves down to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRuleRecord {
    pub id: String,
    pub tenant_id: String,
    pub source_id: Option<String>,
    pub max_requests: i64,
    pub window_seconds: i64,
    pub enabled: bool,
}

#[derive(FromRow)]
struct RateLimitRuleRow {
    id: String,
    tenant_id: String,
    source_id: Option<String>,
    max_requests: i64,
    window_seconds: i64,
    enabled: i64,
}

impl RateLimitRuleRow {
    fn into_record(self) -> RateLimitRuleRecord {
        RateLimitRuleRecord {
            id: self.id,
            tenant_id: self.tenant_id,
            source_id: self.source_id,
            max_requests: self.max_requests,
            window_seconds: self.window_seconds,
            enabled: self.enabled != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_seconds: u64,
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("backing store error: {0}")]
    Store(#[from] crate::distributed::DistributedError),
}

pub type RateLimitResult<T> = Result<T, RateLimitError>;

#[derive(Clone)]
pub struct RateLimiter {
    pool: SqlitePool,
    store: DistributedStore,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool, store: DistributedStore) -> Self {
        Self { pool, store }
    }

    /// Create or replace the rule for a (tenant, source) scope — `source_id
    /// = None` means tenant-wide, enforced by `uq_rate_limit_rules_scope`
    /// (spec.md §6 "Management surface").
    pub async fn upsert(
        &self,
        tenant_id: &str,
        source_id: Option<&str>,
        max_requests: i64,
        window_seconds: i64,
        enabled: bool,
    ) -> RateLimitResult<RateLimitRuleRecord> {
        sqlx::query(
            "INSERT INTO rate_limit_rules (id, tenant_id, source_id, max_requests, window_seconds, enabled)
             VALUES (lower(hex(randomblob(16))), ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, COALESCE(source_id, '')) DO UPDATE SET
                max_requests = excluded.max_requests,
                window_seconds = excluded.window_seconds,
                enabled = excluded.enabled",
        )
        .bind(tenant_id)
        .bind(source_id)
        .bind(max_requests)
        .bind(window_seconds)
        .bind(enabled as i64)
        .execute(&self.pool)
        .await?;

        self.fetch_record(tenant_id, source_id)
            .await?
            .ok_or_else(|| RateLimitError::Db(sqlx::Error::RowNotFound))
    }

    pub async fn list(&self, tenant_id: &str) -> RateLimitResult<Vec<RateLimitRuleRecord>> {
        let rows: Vec<RateLimitRuleRow> = sqlx::query_as(
            "SELECT id, tenant_id, source_id, max_requests, window_seconds, enabled
             FROM rate_limit_rules WHERE tenant_id = ? ORDER BY source_id IS NULL DESC, rowid ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RateLimitRuleRow::into_record).collect())
    }

    pub async fn delete(&self, tenant_id: &str, id: &str) -> RateLimitResult<()> {
        sqlx::query("DELETE FROM rate_limit_rules WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_record(&self, tenant_id: &str, source_id: Option<&str>) -> RateLimitResult<Option<RateLimitRuleRecord>> {
        let row: Option<RateLimitRuleRow> = match source_id {
            Some(source_id) => {
                sqlx::query_as(
                    "SELECT id, tenant_id, source_id, max_requests, window_seconds, enabled
                     FROM rate_limit_rules WHERE tenant_id = ? AND source_id = ?",
                )
                .bind(tenant_id)
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, tenant_id, source_id, max_requests, window_seconds, enabled
                     FROM rate_limit_rules WHERE tenant_id = ? AND source_id IS NULL",
                )
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row.map(RateLimitRuleRow::into_record))
    }

    /// Look up the rule governing a (tenant, source) pair: the
    /// source-specific rule wins over the tenant-wide one when both exist
    /// (spec.md §4.4).
    async fn rule_for(&self, tenant_id: &str, source_id: Option<&str>) -> RateLimitResult<Option<RateLimitRule>> {
        if let Some(source_id) = source_id {
            if let Some(rule) = self.fetch_rule(tenant_id, Some(source_id)).await? {
                return Ok(Some(rule));
            }
        }
        self.fetch_rule(tenant_id, None).await
    }

    async fn fetch_rule(&self, tenant_id: &str, source_id: Option<&str>) -> RateLimitResult<Option<RateLimitRule>> {
        let row: Option<(i64, i64, i64)> = match source_id {
            Some(source_id) => {
                sqlx::query_as(
                    "SELECT max_requests, window_seconds, enabled FROM rate_limit_rules
                     WHERE tenant_id = ? AND source_id = ?",
                )
                .bind(tenant_id)
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT max_requests, window_seconds, enabled FROM rate_limit_rules
                     WHERE tenant_id = ? AND source_id IS NULL",
                )
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(row.map(|(max_requests, window_seconds, enabled)| RateLimitRule {
            max_requests: max_requests as u64,
            window_seconds: window_seconds as u64,
            enabled: enabled != 0,
        }))
    }

    /// Check and consume one unit of quota. A tenant with no configured
    /// rule at all is unrestricted — absence of a rule is not a zero limit
    /// (spec.md §4.4 edge case).
    pub async fn check(
        &self,
        tenant_id: &str,
        source_id: Option<&str>,
        identifier: &str,
    ) -> RateLimitResult<RateLimitDecision> {
        let rule = self.rule_for(tenant_id, source_id).await?;

        let Some(rule) = rule else {
            return Ok(RateLimitDecision {
                allowed: true,
                limit: u64::MAX,
                remaining: u64::MAX,
                reset_seconds: 0,
            });
        };

        if !rule.enabled {
            return Ok(RateLimitDecision {
                allowed: true,
                limit: rule.max_requests,
                remaining: rule.max_requests,
                reset_seconds: 0,
            });
        }

        let window_key = format!("ratelimit:{tenant_id}:{}:{identifier}", source_id.unwrap_or("_"));
        let window = self.store.increment_window(&window_key, rule.window_seconds).await?;

        let reset_seconds = rule
            .window_seconds
            .saturating_sub(now_secs().saturating_sub(window.window_started_at));

        if window.count <= rule.max_requests {
            Ok(RateLimitDecision {
                allowed: true,
                limit: rule.max_requests,
                remaining: rule.max_requests - window.count,
                reset_seconds,
            })
        } else {
            Ok(RateLimitDecision {
                allowed: false,
                limit: rule.max_requests,
                remaining: 0,
                reset_seconds,
            })
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, DatabaseConfig};

    async fn limiter() -> (RateLimiter, SqlitePool) {
        let pool = ConnectionPool::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .pool;
        let store = DistributedStore::connect(None).await;
        (RateLimiter::new(pool.clone(), store), pool)
    }

    #[tokio::test]
    async fn no_rule_is_unrestricted() {
        let (limiter, _) = limiter().await;
        let decision = limiter.check("t1", Some("s1"), "caller").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_scope() {
        let (limiter, pool) = limiter().await;
        sqlx::query("INSERT INTO apps (id, name, api_key_hash) VALUES ('t1','t1','h')")
            .execute(&pool)
            .await
            .unwrap();

        let first = limiter.upsert("t1", None, 10, 60, true).await.unwrap();
        let second = limiter.upsert("t1", None, 20, 60, true).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.max_requests, 20);

        let rules = limiter.list("t1").await.unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[tokio::test]
    async fn source_rule_overrides_tenant_rule() {
        let (limiter, pool) = limiter().await;
        sqlx::query("INSERT INTO apps (id, name, api_key_hash) VALUES ('t1','t1','h')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO rate_limit_rules (id, tenant_id, source_id, max_requests, window_seconds) VALUES ('r1','t1',NULL,1,60)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO rate_limit_rules (id, tenant_id, source_id, max_requests, window_seconds) VALUES ('r2','t1','s1',5,60)",
        )
        .execute(&pool)
        .await
        .unwrap();

        for _ in 0..5 {
            let decision = limiter.check("t1", Some("s1"), "caller").await.unwrap();
            assert!(decision.allowed);
        }
        let sixth = limiter.check("t1", Some("s1"), "caller").await.unwrap();
        assert!(!sixth.allowed);
    }

    #[tokio::test]
    async fn denies_after_limit_reached() {
        let (limiter, pool) = limiter().await;
        sqlx::query("INSERT INTO apps (id, name, api_key_hash) VALUES ('t1','t1','h')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO rate_limit_rules (id, tenant_id, source_id, max_requests, window_seconds) VALUES ('r1','t1',NULL,2,60)",
        )
        .execute(&pool)
        .await
        .unwrap();

        assert!(limiter.check("t1", None, "caller").await.unwrap().allowed);
        assert!(limiter.check("t1", None, "caller").await.unwrap().allowed);
        assert!(!limiter.check("t1", None, "caller").await.unwrap().allowed);
    }
}
