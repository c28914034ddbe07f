//! Lineage recorder (spec.md §3 "Lineage Event", §4.5, SPEC_FULL.md §B
//! "Audit of demo-cap rejections").
//!
//! Append-only event sink shared by the cache store (created/accessed/
//! invalidated/updated/policy_changed) and the management surface (admin
//! rejections such as the demo-cap 403). One table, one writer path, per
//! spec.md §3's event model — we deliberately do not add a second audit
//! subsystem for admin actions.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Accessed,
    Invalidated,
    Updated,
    PolicyChanged,
    Audit,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Accessed => "accessed",
            EventType::Invalidated => "invalidated",
            EventType::Updated => "updated",
            EventType::PolicyChanged => "policy_changed",
            EventType::Audit => "audit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LineageEvent {
    pub id: String,
    pub tenant_id: String,
    pub entry_id: Option<String>,
    pub event_type: String,
    pub actor_id: Option<String>,
    pub source_id: Option<String>,
    pub action: Option<String>,
    pub metadata_json: String,
    pub at_time: String,
}

#[derive(Debug, Error)]
pub enum LineageError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type LineageResult<T> = Result<T, LineageError>;

#[derive(Clone)]
pub struct LineageRecorder {
    pool: SqlitePool,
}

impl LineageRecorder {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fire-and-forget from the caller's perspective but awaited here: the
    /// dispatcher must see this complete before returning response metadata
    /// that depends on it (spec.md §5 suspension point (f)).
    pub async fn record(
        &self,
        tenant_id: &str,
        entry_id: Option<&str>,
        event_type: EventType,
        actor_id: Option<&str>,
        source_id: Option<&str>,
        action: Option<&str>,
        metadata: serde_json::Value,
    ) -> LineageResult<()> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO lineage_events (id, tenant_id, entry_id, event_type, actor_id, source_id, action, metadata_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(entry_id)
        .bind(event_type.as_str())
        .bind(actor_id)
        .bind(source_id)
        .bind(action)
        .bind(metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn audit_rejection(&self, tenant_id: &str, actor_id: Option<&str>, action: &str, reason: &str) -> LineageResult<()> {
        self.record(
            tenant_id,
            None,
            EventType::Audit,
            actor_id,
            None,
            Some(action),
            serde_json::json!({ "reason": reason }),
        )
        .await
    }

    pub async fn for_entry(&self, tenant_id: &str, entry_id: &str, page: u32, limit: u32) -> LineageResult<Vec<LineageEvent>> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        Ok(sqlx::query_as(
            "SELECT id, tenant_id, entry_id, event_type, actor_id, source_id, action, metadata_json, at_time
             FROM lineage_events WHERE tenant_id = ? AND entry_id = ?
             ORDER BY at_time DESC LIMIT ? OFFSET ?",
        )
        .bind(tenant_id)
        .bind(entry_id)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn for_tenant(&self, tenant_id: &str, page: u32, limit: u32) -> LineageResult<Vec<LineageEvent>> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        Ok(sqlx::query_as(
            "SELECT id, tenant_id, entry_id, event_type, actor_id, source_id, action, metadata_json, at_time
             FROM lineage_events WHERE tenant_id = ?
             ORDER BY at_time DESC LIMIT ? OFFSET ?",
        )
        .bind(tenant_id)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Admin-action entries only (SPEC_FULL.md §B "Audit of demo-cap
    /// rejections") — the same table `for_tenant` reads, narrowed to the
    /// `Audit` event kind rather than a separate audit store.
    pub async fn audit_for_tenant(&self, tenant_id: &str, page: u32, limit: u32) -> LineageResult<Vec<LineageEvent>> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        Ok(sqlx::query_as(
            "SELECT id, tenant_id, entry_id, event_type, actor_id, source_id, action, metadata_json, at_time
             FROM lineage_events WHERE tenant_id = ? AND event_type = 'audit'
             ORDER BY at_time DESC LIMIT ? OFFSET ?",
        )
        .bind(tenant_id)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, DatabaseConfig};

    async fn recorder() -> LineageRecorder {
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
        LineageRecorder::new(pool)
    }

    #[tokio::test]
    async fn records_and_lists_by_tenant() {
        let recorder = recorder().await;
        recorder
            .record("t1", Some("e1"), EventType::Created, None, Some("s1"), None, serde_json::json!({}))
            .await
            .unwrap();
        recorder.audit_rejection("t1", Some("admin"), "create_source", "demo cap exceeded").await.unwrap();

        let events = recorder.for_tenant("t1", 1, 10).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn filters_by_entry() {
        let recorder = recorder().await;
        recorder
            .record("t1", Some("e1"), EventType::Created, None, None, None, serde_json::json!({}))
            .await
            .unwrap();
        recorder
            .record("t1", Some("e2"), EventType::Created, None, None, None, serde_json::json!({}))
            .await
            .unwrap();

        let events = recorder.for_entry("t1", "e1", 1, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entry_id.as_deref(), Some("e1"));
    }
}
