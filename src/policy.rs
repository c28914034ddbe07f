//! Policy engine (spec.md §3 "Cache Policy", §4.6).
//!
//! Invoked by the dispatcher after the upstream responds, before any write:
//! kill switch, then the TTL ceiling, then compliance. Mock fallback
//! (spec.md §4.6 step 4) is orchestrated by the dispatcher directly against
//! [`crate::mock::MockCatalog`] since it picks a *different response*
//! entirely rather than gating the store of the one already fetched.

use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::compliance::{ComplianceError, ComplianceGate, Denial};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CachePolicy {
    pub max_ttl_seconds: i64,
    pub no_cache: bool,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Compliance(#[from] ComplianceError),
}

pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyDecision {
    pub store: bool,
    pub effective_ttl_seconds: i64,
    pub compliance_denial: Option<Denial>,
}

#[derive(Clone)]
pub struct PolicyEngine {
    pool: SqlitePool,
    compliance: ComplianceGate,
}

impl PolicyEngine {
    pub fn new(pool: SqlitePool, compliance: ComplianceGate) -> Self {
        Self { pool, compliance }
    }

    /// Create or replace the policy for a (tenant, source) pair, as the
    /// management API does (spec.md §6 "Management surface").
    pub async fn upsert(
        &self,
        tenant_id: &str,
        source_id: &str,
        max_ttl_seconds: i64,
        no_cache: bool,
        purge_schedule: Option<&str>,
    ) -> PolicyResult<()> {
        sqlx::query(
            "INSERT INTO cache_policies (id, tenant_id, source_id, max_ttl_seconds, no_cache, purge_schedule)
             VALUES (lower(hex(randomblob(16))), ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, source_id) DO UPDATE SET
                max_ttl_seconds = excluded.max_ttl_seconds,
                no_cache = excluded.no_cache,
                purge_schedule = excluded.purge_schedule",
        )
        .bind(tenant_id)
        .bind(source_id)
        .bind(max_ttl_seconds)
        .bind(no_cache as i64)
        .bind(purge_schedule)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, tenant_id: &str, source_id: &str) -> PolicyResult<Option<CachePolicy>> {
        self.policy_for(tenant_id, source_id).await
    }

    async fn policy_for(&self, tenant_id: &str, source_id: &str) -> PolicyResult<Option<CachePolicy>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT max_ttl_seconds, no_cache FROM cache_policies WHERE tenant_id = ? AND source_id = ?",
        )
        .bind(tenant_id)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(max_ttl_seconds, no_cache)| CachePolicy {
            max_ttl_seconds,
            no_cache: no_cache != 0,
        }))
    }

    /// spec.md §4.6 step 2: `effective = min(requested_ttl or default,
    /// max_ttl)` with `0` ("infinity") on either side treated specially —
    /// a requested `ttl=0` becomes `max_ttl` when a ceiling is configured,
    /// rather than literally comparing as the smallest possible value.
    pub fn effective_ttl(requested_ttl: i64, policy: Option<&CachePolicy>) -> i64 {
        let Some(policy) = policy else {
            return requested_ttl;
        };
        if policy.max_ttl_seconds <= 0 {
            return requested_ttl;
        }
        if requested_ttl == 0 {
            return policy.max_ttl_seconds;
        }
        requested_ttl.min(policy.max_ttl_seconds)
    }

    /// Full post-response gate (spec.md §4.6 steps 1-3). `tenant_kill_switch`
    /// and `source_kill_switch` are read by the caller from the tenant/source
    /// records; this function only applies the resulting boolean.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate(
        &self,
        tenant_id: &str,
        source_id: &str,
        tenant_kill_switch: bool,
        source_kill_switch: bool,
        requested_ttl: i64,
        request_region: Option<&str>,
        pii_detected: bool,
        request_method: &str,
        request_url: &str,
        response_status: u16,
    ) -> PolicyResult<PolicyDecision> {
        if tenant_kill_switch || source_kill_switch {
            return Ok(PolicyDecision {
                store: false,
                effective_ttl_seconds: 0,
                compliance_denial: None,
            });
        }

        let policy = self.policy_for(tenant_id, source_id).await?;
        if policy.as_ref().is_some_and(|p| p.no_cache) {
            return Ok(PolicyDecision {
                store: false,
                effective_ttl_seconds: 0,
                compliance_denial: None,
            });
        }

        let denial = self
            .compliance
            .evaluate(
                tenant_id,
                source_id,
                request_region,
                pii_detected,
                request_method,
                request_url,
                response_status,
            )
            .await?;

        Ok(PolicyDecision {
            store: denial.is_none(),
            effective_ttl_seconds: Self::effective_ttl(requested_ttl, policy.as_ref()),
            compliance_denial: denial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, DatabaseConfig};

    async fn engine() -> (PolicyEngine, SqlitePool) {
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
        sqlx::query(
            "INSERT INTO sources (id, tenant_id, name, canonical_name, base_url) VALUES ('s1','t1','a','a','https://x')",
        )
        .execute(&pool)
        .await
        .unwrap();
        (PolicyEngine::new(pool.clone(), ComplianceGate::new(pool.clone())), pool)
    }

    #[tokio::test]
    async fn ttl_ceiling_caps_requested_ttl() {
        let (engine, pool) = engine().await;
        sqlx::query("INSERT INTO cache_policies (id, tenant_id, source_id, max_ttl_seconds) VALUES ('p1','t1','s1',60)")
            .execute(&pool)
            .await
            .unwrap();

        let decision = engine
            .evaluate("t1", "s1", false, false, 3600, None, false, "GET", "https://x/y", 200)
            .await
            .unwrap();
        assert_eq!(decision.effective_ttl_seconds, 60);
        assert!(decision.store);
    }

    #[tokio::test]
    async fn requested_ttl_zero_becomes_ceiling_when_one_is_set() {
        let (engine, pool) = engine().await;
        sqlx::query("INSERT INTO cache_policies (id, tenant_id, source_id, max_ttl_seconds) VALUES ('p1','t1','s1',60)")
            .execute(&pool)
            .await
            .unwrap();

        let decision = engine
            .evaluate("t1", "s1", false, false, 0, None, false, "GET", "https://x/y", 200)
            .await
            .unwrap();
        assert_eq!(decision.effective_ttl_seconds, 60);
    }

    #[tokio::test]
    async fn kill_switch_blocks_store() {
        let (engine, _pool) = engine().await;
        let decision = engine
            .evaluate("t1", "s1", false, true, 60, None, false, "GET", "https://x/y", 200)
            .await
            .unwrap();
        assert!(!decision.store);
    }

    #[tokio::test]
    async fn no_cache_policy_blocks_store() {
        let (engine, pool) = engine().await;
        sqlx::query("INSERT INTO cache_policies (id, tenant_id, source_id, no_cache) VALUES ('p1','t1','s1',1)")
            .execute(&pool)
            .await
            .unwrap();

        let decision = engine
            .evaluate("t1", "s1", false, false, 60, None, false, "GET", "https://x/y", 200)
            .await
            .unwrap();
        assert!(!decision.store);
    }
}
