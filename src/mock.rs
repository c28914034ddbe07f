//! Mock responses (spec.md §3 "Mock Response", §4.6 step 4).
//!
//! Scanned in ascending priority order; the first `(method, url-pattern,
//! body-pattern)` match wins. Mock responses are never cached (spec.md
//! §4.6): the dispatcher must not hand a mock hit to [`crate::cache::CacheStore::put`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MockResponse {
    pub id: String,
    pub tenant_id: String,
    pub source_id: String,
    pub method: String,
    pub url_pattern: String,
    pub body_pattern: Option<String>,
    pub status: i64,
    pub headers_json: String,
    pub body: Vec<u8>,
    pub priority: i64,
    pub active: bool,
}

#[derive(FromRow)]
struct MockRow {
    id: String,
    tenant_id: String,
    source_id: String,
    method: String,
    url_pattern: String,
    body_pattern: Option<String>,
    status: i64,
    headers_json: String,
    body: Vec<u8>,
    priority: i64,
    active: i64,
}

impl MockRow {
    fn into_mock(self) -> MockResponse {
        MockResponse {
            id: self.id,
            tenant_id: self.tenant_id,
            source_id: self.source_id,
            method: self.method,
            url_pattern: self.url_pattern,
            body_pattern: self.body_pattern,
            status: self.status,
            headers_json: self.headers_json,
            body: self.body,
            priority: self.priority,
            active: self.active != 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum MockError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type MockResult<T> = Result<T, MockError>;

#[derive(Clone)]
pub struct MockCatalog {
    pool: SqlitePool,
}

impl MockCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, tenant_id: &str, source_id: &str) -> MockResult<Vec<MockResponse>> {
        let rows: Vec<MockRow> = sqlx::query_as(
            "SELECT id, tenant_id, source_id, method, url_pattern, body_pattern, status, headers_json, body, priority, active
             FROM mock_responses WHERE tenant_id = ? AND source_id = ? AND active = 1
             ORDER BY priority ASC, rowid ASC",
        )
        .bind(tenant_id)
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MockRow::into_mock).collect())
    }

    /// First ascending-priority `(method, url-pattern, body-pattern)` match
    /// wins (spec.md §4.6).
    pub async fn find_match(
        &self,
        tenant_id: &str,
        source_id: &str,
        method: &str,
        url: &str,
        body: Option<&str>,
    ) -> MockResult<Option<MockResponse>> {
        let candidates = self.list(tenant_id, source_id).await?;
        Ok(candidates.into_iter().find(|m| {
            m.method.eq_ignore_ascii_case(method)
                && matches_pattern(url, &m.url_pattern)
                && m.body_pattern
                    .as_deref()
                    .map(|p| matches_pattern(body.unwrap_or(""), p))
                    .unwrap_or(true)
        }))
    }

    pub async fn create(&self, mock: MockResponse) -> MockResult<MockResponse> {
        let id = if mock.id.is_empty() { Uuid::new_v4().to_string() } else { mock.id };
        sqlx::query(
            "INSERT INTO mock_responses (id, tenant_id, source_id, method, url_pattern, body_pattern, status, headers_json, body, priority, active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&mock.tenant_id)
        .bind(&mock.source_id)
        .bind(&mock.method)
        .bind(&mock.url_pattern)
        .bind(&mock.body_pattern)
        .bind(mock.status)
        .bind(&mock.headers_json)
        .bind(&mock.body)
        .bind(mock.priority)
        .bind(mock.active as i64)
        .execute(&self.pool)
        .await?;

        Ok(MockResponse { id, ..mock })
    }
}

fn matches_pattern(haystack: &str, pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(haystack),
        Err(_) => haystack.contains(pattern),
    }
}
