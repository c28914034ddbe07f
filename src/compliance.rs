//! Compliance gate (spec.md §3 "Compliance Rule", §4.6 step 3).
//!
//! Region, then PII, then TOS, in that order; the first denial short-circuits
//! the store. Grounded on the teacher's region/allow-deny-list shape seen
//! across its compliance modules, narrowed to exactly the three checks
//! spec.md names (no GDPR/HIPAA/SOC2 machinery — those were named
//! collaborators in spec.md §1, out of scope for this core).

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TosRule {
    pub url_pattern: String,
    pub method: Option<String>,
    pub status_code: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ComplianceRule {
    pub allowed_regions: Option<Vec<String>>,
    pub denied_regions: Option<Vec<String>>,
    pub pii_block_cache: bool,
    pub tos_rules: Vec<TosRule>,
}

#[derive(FromRow)]
struct ComplianceRow {
    allowed_regions_json: Option<String>,
    denied_regions_json: Option<String>,
    pii_block_cache: i64,
    tos_rules_json: String,
}

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type ComplianceResult<T> = Result<T, ComplianceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    Region,
    Pii,
    Tos,
}

#[derive(Clone)]
pub struct ComplianceGate {
    pool: SqlitePool,
}

impl ComplianceGate {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create or replace the compliance rule for a (tenant, source) pair.
    pub async fn upsert(
        &self,
        tenant_id: &str,
        source_id: &str,
        allowed_regions: Option<&[String]>,
        denied_regions: Option<&[String]>,
        pii_block_cache: bool,
        tos_rules: &[TosRule],
    ) -> ComplianceResult<()> {
        let allowed_json = allowed_regions.map(|r| serde_json::to_string(r).unwrap_or_default());
        let denied_json = denied_regions.map(|r| serde_json::to_string(r).unwrap_or_default());
        let tos_json = serde_json::to_string(tos_rules).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            "INSERT INTO compliance_rules (id, tenant_id, source_id, allowed_regions_json, denied_regions_json, pii_block_cache, tos_rules_json)
             VALUES (lower(hex(randomblob(16))), ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, source_id) DO UPDATE SET
                allowed_regions_json = excluded.allowed_regions_json,
                denied_regions_json = excluded.denied_regions_json,
                pii_block_cache = excluded.pii_block_cache,
                tos_rules_json = excluded.tos_rules_json",
        )
        .bind(tenant_id)
        .bind(source_id)
        .bind(allowed_json)
        .bind(denied_json)
        .bind(pii_block_cache as i64)
        .bind(tos_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, tenant_id: &str, source_id: &str) -> ComplianceResult<Option<ComplianceRule>> {
        self.rule_for(tenant_id, source_id).await
    }

    async fn rule_for(&self, tenant_id: &str, source_id: &str) -> ComplianceResult<Option<ComplianceRule>> {
        let row: Option<ComplianceRow> = sqlx::query_as(
            "SELECT allowed_regions_json, denied_regions_json, pii_block_cache, tos_rules_json
             FROM compliance_rules WHERE tenant_id = ? AND source_id = ?",
        )
        .bind(tenant_id)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ComplianceRule {
            allowed_regions: r.allowed_regions_json.and_then(|j| serde_json::from_str(&j).ok()),
            denied_regions: r.denied_regions_json.and_then(|j| serde_json::from_str(&j).ok()),
            pii_block_cache: r.pii_block_cache != 0,
            tos_rules: serde_json::from_str(&r.tos_rules_json).unwrap_or_default(),
        }))
    }

    /// Evaluate region -> PII -> TOS in order (spec.md §4.6 step 3). Returns
    /// the first denial, if any; `pii_detected` is supplied by the caller
    /// since PII detection over the response body is out of this gate's
    /// scope (the dispatcher decides what counts as PII-bearing content).
    pub async fn evaluate(
        &self,
        tenant_id: &str,
        source_id: &str,
        request_region: Option<&str>,
        pii_detected: bool,
        request_method: &str,
        request_url: &str,
        response_status: u16,
    ) -> ComplianceResult<Option<Denial>> {
        let Some(rule) = self.rule_for(tenant_id, source_id).await? else {
            return Ok(None);
        };

        if let Some(region) = request_region {
            if let Some(denied) = &rule.denied_regions {
                if denied.iter().any(|r| r.eq_ignore_ascii_case(region)) {
                    return Ok(Some(Denial::Region));
                }
            }
            if let Some(allowed) = &rule.allowed_regions {
                if !allowed.is_empty() && !allowed.iter().any(|r| r.eq_ignore_ascii_case(region)) {
                    return Ok(Some(Denial::Region));
                }
            }
        }

        if rule.pii_block_cache && pii_detected {
            return Ok(Some(Denial::Pii));
        }

        for tos in &rule.tos_rules {
            let method_matches = tos
                .method
                .as_deref()
                .map(|m| m.eq_ignore_ascii_case(request_method))
                .unwrap_or(true);
            let status_matches = tos.status_code.map(|s| s as u16 == response_status).unwrap_or(true);
            let url_matches = url_matches_pattern(request_url, &tos.url_pattern);
            if method_matches && status_matches && url_matches {
                return Ok(Some(Denial::Tos));
            }
        }

        Ok(None)
    }
}

/// A TOS URL pattern is a regex when it compiles as one, else a plain
/// substring match (spec.md §3 "Mock Response" describes the same
/// regex-or-substring duality for URL patterns; TOS rules reuse it).
fn url_matches_pattern(url: &str, pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(url),
        Err(_) => url.contains(pattern),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, DatabaseConfig};

    async fn gate() -> SqlitePool {
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
        pool
    }

    #[tokio::test]
    async fn region_denial_short_circuits_before_tos() {
        let pool = gate().await;
        sqlx::query(
            "INSERT INTO compliance_rules (id, tenant_id, source_id, denied_regions_json, tos_rules_json)
             VALUES ('c1','t1','s1','[\"eu\"]','[]')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let gate = ComplianceGate::new(pool);
        let denial = gate
            .evaluate("t1", "s1", Some("eu"), false, "GET", "https://x/y", 200)
            .await
            .unwrap();
        assert_eq!(denial, Some(Denial::Region));
    }

    #[tokio::test]
    async fn no_rule_allows_everything() {
        let pool = gate().await;
        let gate = ComplianceGate::new(pool);
        let denial = gate.evaluate("t1", "s1", Some("us"), true, "GET", "https://x/y", 200).await.unwrap();
        assert_eq!(denial, None);
    }

    #[tokio::test]
    async fn tos_rule_matches_method_and_status() {
        let pool = gate().await;
        sqlx::query(
            "INSERT INTO compliance_rules (id, tenant_id, source_id, tos_rules_json)
             VALUES ('c1','t1','s1','[{\"url_pattern\":\"/scrape\",\"method\":\"GET\",\"status_code\":200}]')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let gate = ComplianceGate::new(pool);
        let denial = gate
            .evaluate("t1", "s1", None, false, "GET", "https://x/scrape/items", 200)
            .await
            .unwrap();
        assert_eq!(denial, Some(Denial::Tos));
    }
}
