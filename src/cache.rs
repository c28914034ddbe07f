//! Cache store (spec.md §3 "Cache Entry", §4.5).
//!
//! Get/Put/List/Invalidate/Purge over the `cache_entries` table. The two
//! uniqueness invariants from spec.md §3 are enforced by the partial unique
//! indexes in `migrations/0001_init.sql`; this module only has to pick the
//! right WHERE clause per [`crate::key::StorageMode`] (spec.md §9's "cyclic
//! storage-mode ambiguity" note — branch on `storage_mode`, never infer it
//! from `pool_id` nullability).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::key::StorageMode;
use crate::lineage::{EventType, LineageRecorder};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub tenant_id: String,
    pub source_id: String,
    pub pool_id: Option<String>,
    pub cache_key: String,
    pub request_method: String,
    pub request_url: String,
    pub body_fingerprint: Option<String>,
    pub response_status: i64,
    pub response_headers: HashMap<String, String>,
    pub response_body: Vec<u8>,
    pub content_type: Option<String>,
    pub ttl_seconds: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub hit_count: i64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub revalidate_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct CacheEntryRow {
    id: String,
    tenant_id: String,
    source_id: String,
    pool_id: Option<String>,
    cache_key: String,
    request_method: String,
    request_url: String,
    body_fingerprint: Option<String>,
    response_status: i64,
    response_headers_json: String,
    response_body: Vec<u8>,
    content_type: Option<String>,
    ttl_seconds: i64,
    expires_at: Option<String>,
    hit_count: i64,
    last_hit_at: Option<String>,
    tags_json: String,
    revalidate_at: Option<String>,
    created_at: String,
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_time_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_time)
}

impl CacheEntryRow {
    fn into_entry(self) -> CacheEntry {
        CacheEntry {
            id: self.id,
            tenant_id: self.tenant_id,
            source_id: self.source_id,
            pool_id: self.pool_id,
            cache_key: self.cache_key,
            request_method: self.request_method,
            request_url: self.request_url,
            body_fingerprint: self.body_fingerprint,
            response_status: self.response_status,
            response_headers: serde_json::from_str(&self.response_headers_json).unwrap_or_default(),
            response_body: self.response_body,
            content_type: self.content_type,
            ttl_seconds: self.ttl_seconds,
            expires_at: parse_time_opt(self.expires_at),
            hit_count: self.hit_count,
            last_hit_at: parse_time_opt(self.last_hit_at),
            tags: serde_json::from_str(&self.tags_json).unwrap_or_default(),
            revalidate_at: parse_time_opt(self.revalidate_at),
            created_at: parse_time(&self.created_at),
        }
    }
}

const SELECT_COLUMNS: &str = "id, tenant_id, source_id, pool_id, cache_key, request_method, request_url,
     body_fingerprint, response_status, response_headers_json, response_body, content_type,
     ttl_seconds, expires_at, hit_count, last_hit_at, tags_json, revalidate_at, created_at";

pub struct NewCacheEntry {
    pub tenant_id: String,
    pub source_id: String,
    pub pool_id: Option<String>,
    pub cache_key: String,
    pub request_method: String,
    pub request_url: String,
    pub body_fingerprint: Option<String>,
    pub response_status: i64,
    pub response_headers: HashMap<String, String>,
    pub response_body: Vec<u8>,
    pub content_type: Option<String>,
    pub ttl_seconds: i64,
    pub tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    CreatedAt,
    HitCount,
    ExpiresAt,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::HitCount => "hit_count",
            SortField::ExpiresAt => "expires_at",
        }
    }
}

/// Sentinel for [`CacheFilter::pool_id`]: restrict to entries that are
/// `pool IS NULL` *and* whose owning source is currently `dedicated` (spec.md
/// §4.5 "List/Filter" — excludes orphaned entries left behind when a source
/// was reassigned to a shared pool, via an inner join against `sources`).
#[derive(Debug, Clone, Default)]
pub struct CacheFilter {
    pub expired_only: Option<bool>,
    pub source_id: Option<String>,
    pub pool_id: Option<PoolFilter>,
    pub search: Option<String>,
    pub min_hits: Option<i64>,
    pub max_hits: Option<i64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort: SortField,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub enum PoolFilter {
    Pool(String),
    DedicatedOnly,
}

pub enum TagMatch {
    Any,
    All,
}

#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
    lineage: LineageRecorder,
}

impl CacheStore {
    pub fn new(pool: SqlitePool, lineage: LineageRecorder) -> Self {
        Self { pool, lineage }
    }

    /// spec.md §4.5 "Get". Filters out expired-but-not-yet-purged rows (the
    /// store tolerates orphan expired entries between sweeps; every reader
    /// must re-check, per spec.md §9 Open Question (c)).
    pub async fn get(
        &self,
        tenant_id: &str,
        key: &str,
        source_id: &str,
        storage_mode: StorageMode,
        pool_id: Option<&str>,
    ) -> CacheResult<Option<CacheEntry>> {
        let now = Utc::now().to_rfc3339();
        let row: Option<CacheEntryRow> = match storage_mode {
            StorageMode::Dedicated => {
                sqlx::query_as(&format!(
                    "SELECT {SELECT_COLUMNS} FROM cache_entries
                     WHERE tenant_id = ? AND source_id = ? AND cache_key = ?
                       AND (expires_at IS NULL OR expires_at > ?)"
                ))
                .bind(tenant_id)
                .bind(source_id)
                .bind(key)
                .bind(&now)
                .fetch_optional(&self.pool)
                .await?
            }
            StorageMode::Shared => {
                let Some(pool_id) = pool_id else {
                    return Ok(None);
                };
                sqlx::query_as(&format!(
                    "SELECT {SELECT_COLUMNS} FROM cache_entries
                     WHERE tenant_id = ? AND pool_id = ? AND cache_key = ?
                       AND (expires_at IS NULL OR expires_at > ?)"
                ))
                .bind(tenant_id)
                .bind(pool_id)
                .bind(key)
                .bind(&now)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let Some(row) = row else {
            return Ok(None);
        };
        let entry = row.into_entry();

        sqlx::query("UPDATE cache_entries SET hit_count = hit_count + 1, last_hit_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&entry.id)
            .execute(&self.pool)
            .await?;

        let _ = self
            .lineage
            .record(
                tenant_id,
                Some(&entry.id),
                EventType::Accessed,
                None,
                Some(source_id),
                Some("cache_hit"),
                serde_json::json!({ "key": key }),
            )
            .await;

        Ok(Some(CacheEntry {
            hit_count: entry.hit_count + 1,
            ..entry
        }))
    }

    /// spec.md §4.5 "Put". Resolves the uniqueness target from
    /// `storage_mode`, overwriting on conflict and resetting `hit_count`
    /// rather than accumulating across logically-distinct payloads.
    pub async fn put(&self, entry: NewCacheEntry, storage_mode: StorageMode) -> CacheResult<CacheEntry> {
        let now = Utc::now();
        let expires_at = if entry.ttl_seconds == 0 {
            None
        } else {
            Some(now + chrono::Duration::seconds(entry.ttl_seconds))
        };

        let existing_id: Option<String> = match storage_mode {
            StorageMode::Dedicated => {
                sqlx::query_scalar(
                    "SELECT id FROM cache_entries WHERE tenant_id = ? AND source_id = ? AND cache_key = ?",
                )
                .bind(&entry.tenant_id)
                .bind(&entry.source_id)
                .bind(&entry.cache_key)
                .fetch_optional(&self.pool)
                .await?
            }
            StorageMode::Shared => match entry.pool_id.as_deref() {
                Some(pool_id) => {
                    sqlx::query_scalar(
                        "SELECT id FROM cache_entries WHERE tenant_id = ? AND pool_id = ? AND cache_key = ?",
                    )
                    .bind(&entry.tenant_id)
                    .bind(pool_id)
                    .bind(&entry.cache_key)
                    .fetch_optional(&self.pool)
                    .await?
                }
                None => None,
            },
        };

        let headers_json = serde_json::to_string(&entry.response_headers).unwrap_or_else(|_| "{}".to_string());
        let tags_json = serde_json::to_string(&entry.tags).unwrap_or_else(|_| "[]".to_string());
        let expires_at_str = expires_at.map(|t| t.to_rfc3339());

        let id = if let Some(id) = existing_id {
            sqlx::query(
                "UPDATE cache_entries SET
                    response_status = ?, response_headers_json = ?, response_body = ?, content_type = ?,
                    ttl_seconds = ?, expires_at = ?, hit_count = 0, last_hit_at = NULL, tags_json = ?,
                    body_fingerprint = ?, revalidate_at = NULL
                 WHERE id = ?",
            )
            .bind(entry.response_status)
            .bind(&headers_json)
            .bind(&entry.response_body)
            .bind(&entry.content_type)
            .bind(entry.ttl_seconds)
            .bind(&expires_at_str)
            .bind(&tags_json)
            .bind(&entry.body_fingerprint)
            .bind(&id)
            .execute(&self.pool)
            .await?;

            let _ = self
                .lineage
                .record(
                    &entry.tenant_id,
                    Some(&id),
                    EventType::Updated,
                    None,
                    Some(&entry.source_id),
                    Some("overwrite"),
                    serde_json::json!({ "key": entry.cache_key }),
                )
                .await;
            id
        } else {
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO cache_entries (
                    id, tenant_id, source_id, pool_id, cache_key, request_method, request_url,
                    body_fingerprint, response_status, response_headers_json, response_body, content_type,
                    ttl_seconds, expires_at, hit_count, tags_json, created_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
            )
            .bind(&id)
            .bind(&entry.tenant_id)
            .bind(&entry.source_id)
            .bind(&entry.pool_id)
            .bind(&entry.cache_key)
            .bind(&entry.request_method)
            .bind(&entry.request_url)
            .bind(&entry.body_fingerprint)
            .bind(entry.response_status)
            .bind(&headers_json)
            .bind(&entry.response_body)
            .bind(&entry.content_type)
            .bind(entry.ttl_seconds)
            .bind(&expires_at_str)
            .bind(&tags_json)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;

            let _ = self
                .lineage
                .record(
                    &entry.tenant_id,
                    Some(&id),
                    EventType::Created,
                    None,
                    Some(&entry.source_id),
                    Some("cache_miss_store"),
                    serde_json::json!({ "key": entry.cache_key }),
                )
                .await;
            id
        };

        self.get_by_id(&entry.tenant_id, &id)
            .await?
            .ok_or(CacheError::Db(sqlx::Error::RowNotFound))
    }

    pub async fn get_by_id(&self, tenant_id: &str, id: &str) -> CacheResult<Option<CacheEntry>> {
        let row: Option<CacheEntryRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM cache_entries WHERE tenant_id = ? AND id = ?"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CacheEntryRow::into_entry))
    }

    /// spec.md §4.5 "List/Filter": paginated, composable predicates.
    pub async fn list(&self, tenant_id: &str, filter: &CacheFilter) -> CacheResult<Vec<CacheEntry>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT ce.id, ce.tenant_id, ce.source_id, ce.pool_id, ce.cache_key, ce.request_method, ce.request_url,
                    ce.body_fingerprint, ce.response_status, ce.response_headers_json, ce.response_body, ce.content_type,
                    ce.ttl_seconds, ce.expires_at, ce.hit_count, ce.last_hit_at, ce.tags_json, ce.revalidate_at, ce.created_at
             FROM cache_entries ce",
        );

        if matches!(filter.pool_id, Some(PoolFilter::DedicatedOnly)) {
            qb.push(" INNER JOIN sources src ON src.id = ce.source_id AND src.storage_mode = 'dedicated'");
        }

        qb.push(" WHERE ce.tenant_id = ");
        qb.push_bind(tenant_id.to_string());

        match filter.expired_only {
            Some(true) => {
                qb.push(" AND ce.expires_at IS NOT NULL AND ce.expires_at <= ");
                qb.push_bind(Utc::now().to_rfc3339());
            }
            Some(false) => {
                qb.push(" AND (ce.expires_at IS NULL OR ce.expires_at > ");
                qb.push_bind(Utc::now().to_rfc3339());
                qb.push(")");
            }
            None => {}
        }

        if let Some(source_id) = &filter.source_id {
            qb.push(" AND ce.source_id = ");
            qb.push_bind(source_id.clone());
        }

        match &filter.pool_id {
            Some(PoolFilter::Pool(pool_id)) => {
                qb.push(" AND ce.pool_id = ");
                qb.push_bind(pool_id.clone());
            }
            Some(PoolFilter::DedicatedOnly) => {
                qb.push(" AND ce.pool_id IS NULL");
            }
            None => {}
        }

        if let Some(search) = &filter.search {
            let pattern = format!("%{search}%");
            qb.push(" AND (ce.request_url LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR ce.request_method LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR ce.cache_key LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR ce.content_type LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR CAST(ce.response_status AS TEXT) LIKE ");
            qb.push_bind(pattern);
            qb.push(")");
        }

        if let Some(min_hits) = filter.min_hits {
            qb.push(" AND ce.hit_count >= ");
            qb.push_bind(min_hits);
        }
        if let Some(max_hits) = filter.max_hits {
            qb.push(" AND ce.hit_count <= ");
            qb.push_bind(max_hits);
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND ce.created_at >= ");
            qb.push_bind(after.to_rfc3339());
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND ce.created_at <= ");
            qb.push_bind(before.to_rfc3339());
        }

        qb.push(format!(" ORDER BY ce.{} DESC LIMIT ", filter.sort.column()));
        qb.push_bind(i64::from(filter.limit.max(1)));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(filter.page.saturating_sub(1)) * i64::from(filter.limit.max(1)));

        let rows: Vec<CacheEntryRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(CacheEntryRow::into_entry).collect())
    }

    pub async fn invalidate_key(&self, tenant_id: &str, source_id: &str, key: &str) -> CacheResult<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE tenant_id = ? AND source_id = ? AND cache_key = ?")
            .bind(tenant_id)
            .bind(source_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            let _ = self
                .lineage
                .record(tenant_id, None, EventType::Invalidated, None, Some(source_id), Some("invalidate_key"), serde_json::json!({ "key": key }))
                .await;
        }
        Ok(result.rows_affected())
    }

    pub async fn invalidate_url_prefix(&self, tenant_id: &str, prefix: &str) -> CacheResult<u64> {
        let pattern = format!("{prefix}%");
        let result = sqlx::query("DELETE FROM cache_entries WHERE tenant_id = ? AND request_url LIKE ?")
            .bind(tenant_id)
            .bind(&pattern)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            let _ = self
                .lineage
                .record(tenant_id, None, EventType::Invalidated, None, None, Some("invalidate_url_prefix"), serde_json::json!({ "prefix": prefix }))
                .await;
        }
        Ok(result.rows_affected())
    }

    pub async fn invalidate_key_prefix(&self, tenant_id: &str, prefix: &str) -> CacheResult<u64> {
        let pattern = format!("{prefix}%");
        let result = sqlx::query("DELETE FROM cache_entries WHERE tenant_id = ? AND cache_key LIKE ?")
            .bind(tenant_id)
            .bind(&pattern)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            let _ = self
                .lineage
                .record(tenant_id, None, EventType::Invalidated, None, None, Some("invalidate_key_prefix"), serde_json::json!({ "prefix": prefix }))
                .await;
        }
        Ok(result.rows_affected())
    }

    /// spec.md §4.5 "tag set with any-or-all matching". Evaluated in Rust
    /// over `tags_json` rather than SQL JSON functions, to keep this query
    /// portable to the Postgres backend `sqlx` is configured for too.
    pub async fn invalidate_by_tags(&self, tenant_id: &str, tags: &[String], mode: TagMatch) -> CacheResult<u64> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, tags_json FROM cache_entries WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?;

        let mut to_delete = Vec::new();
        for (id, tags_json) in rows {
            let entry_tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
            let matches = match mode {
                TagMatch::Any => tags.iter().any(|t| entry_tags.contains(t)),
                TagMatch::All => tags.iter().all(|t| entry_tags.contains(t)),
            };
            if matches {
                to_delete.push(id);
            }
        }

        let mut deleted = 0u64;
        for id in &to_delete {
            let result = sqlx::query("DELETE FROM cache_entries WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            deleted += result.rows_affected();
        }
        if deleted > 0 {
            let _ = self
                .lineage
                .record(tenant_id, None, EventType::Invalidated, None, None, Some("invalidate_by_tags"), serde_json::json!({ "tags": tags }))
                .await;
        }
        Ok(deleted)
    }

    /// spec.md §4.5 "Purge-all and purge-expired operate at the tenant or
    /// the pool level."
    pub async fn purge_expired(&self, tenant_id: &str, pool_id: Option<&str>) -> CacheResult<u64> {
        let now = Utc::now().to_rfc3339();
        let result = match pool_id {
            Some(pool_id) => {
                sqlx::query("DELETE FROM cache_entries WHERE tenant_id = ? AND pool_id = ? AND expires_at IS NOT NULL AND expires_at <= ?")
                    .bind(tenant_id)
                    .bind(pool_id)
                    .bind(&now)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM cache_entries WHERE tenant_id = ? AND expires_at IS NOT NULL AND expires_at <= ?")
                    .bind(tenant_id)
                    .bind(&now)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    pub async fn purge_all(&self, tenant_id: &str, pool_id: Option<&str>) -> CacheResult<u64> {
        let result = match pool_id {
            Some(pool_id) => {
                sqlx::query("DELETE FROM cache_entries WHERE tenant_id = ? AND pool_id = ?")
                    .bind(tenant_id)
                    .bind(pool_id)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM cache_entries WHERE tenant_id = ?")
                    .bind(tenant_id)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Sum of `hit_count` across every entry a source owns, the input to the
    /// cost-savings calculation (SPEC_FULL.md §B: `savings = hits *
    /// cost_per_request`, which needs the source's rate and lives in the
    /// management handler instead of here).
    pub async fn total_hits_for_source(&self, tenant_id: &str, source_id: &str) -> CacheResult<i64> {
        let (total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(hit_count), 0) FROM cache_entries WHERE tenant_id = ? AND source_id = ?",
        )
        .bind(tenant_id)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    /// Aggregate counters for the metrics endpoint (SPEC_FULL.md §B): total
    /// entries, total accumulated hits, and how many are currently expired
    /// but not yet swept.
    pub async fn metrics(&self, tenant_id: &str) -> CacheResult<CacheMetrics> {
        let (total_entries, total_hits): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(hit_count), 0) FROM cache_entries WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        let (expired_entries,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cache_entries
             WHERE tenant_id = ? AND expires_at IS NOT NULL AND expires_at <= datetime('now')",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheMetrics { total_entries, total_hits, expired_entries })
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheMetrics {
    pub total_entries: i64,
    pub total_hits: i64,
    pub expired_entries: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, DatabaseConfig};

    async fn store() -> CacheStore {
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
        CacheStore::new(pool, LineageRecorder::new(ConnectionPool::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        }).await.unwrap().pool))
    }

    fn entry(ttl: i64) -> NewCacheEntry {
        NewCacheEntry {
            tenant_id: "t1".to_string(),
            source_id: "s1".to_string(),
            pool_id: None,
            cache_key: "k1".to_string(),
            request_method: "GET".to_string(),
            request_url: "https://api.example.com/items".to_string(),
            body_fingerprint: None,
            response_status: 200,
            response_headers: HashMap::new(),
            response_body: b"{}".to_vec(),
            content_type: Some("application/json".to_string()),
            ttl_seconds: ttl,
            tags: vec!["weather".to_string()],
        }
    }

    #[tokio::test]
    async fn put_then_get_is_a_hit() {
        let store = store().await;
        store.put(entry(60), StorageMode::Dedicated).await.unwrap();

        let hit = store.get("t1", "k1", "s1", StorageMode::Dedicated, None).await.unwrap();
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().hit_count, 1);
    }

    #[tokio::test]
    async fn ttl_zero_never_expires() {
        let store = store().await;
        let stored = store.put(entry(0), StorageMode::Dedicated).await.unwrap();
        assert!(stored.expires_at.is_none());
    }

    #[tokio::test]
    async fn upsert_resets_hit_count_to_zero() {
        let store = store().await;
        store.put(entry(60), StorageMode::Dedicated).await.unwrap();
        store.get("t1", "k1", "s1", StorageMode::Dedicated, None).await.unwrap();
        store.get("t1", "k1", "s1", StorageMode::Dedicated, None).await.unwrap();

        let overwritten = store.put(entry(120), StorageMode::Dedicated).await.unwrap();
        assert_eq!(overwritten.hit_count, 0);

        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM cache_entries"))
            .fetch_all(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1, "upsert must leave exactly one row");
    }

    #[tokio::test]
    async fn purge_expired_then_list_expired_is_empty() {
        let store = store().await;
        let mut stale = entry(1);
        stale.cache_key = "stale".to_string();
        store.put(stale, StorageMode::Dedicated).await.unwrap();

        sqlx::query("UPDATE cache_entries SET expires_at = ? WHERE cache_key = 'stale'")
            .bind((Utc::now() - chrono::Duration::seconds(10)).to_rfc3339())
            .execute(&store.pool)
            .await
            .unwrap();

        let purged = store.purge_expired("t1", None).await.unwrap();
        assert_eq!(purged, 1);

        let remaining = store
            .list(
                "t1",
                &CacheFilter {
                    expired_only: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn double_invalidate_is_a_noop_on_second_call() {
        let store = store().await;
        store.put(entry(60), StorageMode::Dedicated).await.unwrap();

        let first = store.invalidate_key("t1", "s1", "k1").await.unwrap();
        assert_eq!(first, 1);
        let second = store.invalidate_key("t1", "s1", "k1").await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn dedicated_only_excludes_reassigned_sources() {
        let store = store().await;
        store.put(entry(60), StorageMode::Dedicated).await.unwrap();

        sqlx::query("INSERT INTO storage_pools (id, tenant_id, name) VALUES ('p1','t1','shared-pool')")
            .execute(&store.pool)
            .await
            .unwrap();
        sqlx::query("UPDATE sources SET storage_mode = 'shared', pool_id = 'p1' WHERE id = 's1'")
            .execute(&store.pool)
            .await
            .unwrap();

        let filtered = store
            .list(
                "t1",
                &CacheFilter {
                    pool_id: Some(PoolFilter::DedicatedOnly),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }
}
