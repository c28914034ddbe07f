//! Source registry (spec.md §3 "Source", §4.2).
//!
//! Grounded on `database::connection_pool` for the pooled-store access
//! pattern and on `enterprise::crypto`'s envelope-encryption idea (here
//! narrowed to AES-256-GCM over a process-wide key, since key-management
//! infrastructure is out of scope per spec.md §1).

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng as AesOsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::key::StorageMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    None,
    Bearer,
    ApiKey,
    Basic,
}

impl AuthKind {
    fn as_str(self) -> &'static str {
        match self {
            AuthKind::None => "none",
            AuthKind::Bearer => "bearer",
            AuthKind::ApiKey => "api_key",
            AuthKind::Basic => "basic",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "bearer" => AuthKind::Bearer,
            "api_key" => AuthKind::ApiKey,
            "basic" => AuthKind::Basic,
            _ => AuthKind::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    #[default]
    None,
    Mock,
    AlternativeSource,
}

impl FallbackMode {
    fn as_str(self) -> &'static str {
        match self {
            FallbackMode::None => "none",
            FallbackMode::Mock => "mock",
            FallbackMode::AlternativeSource => "alternative_source",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "mock" => FallbackMode::Mock,
            "alternative_source" => FallbackMode::AlternativeSource,
            _ => FallbackMode::None,
        }
    }
}

impl StorageMode {
    fn as_str(self) -> &'static str {
        match self {
            StorageMode::Dedicated => "dedicated",
            StorageMode::Shared => "shared",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "shared" => StorageMode::Shared,
            _ => StorageMode::Dedicated,
        }
    }
}

/// Default vary headers for a newly created source (spec.md §3).
pub fn default_vary_headers() -> Vec<String> {
    vec![
        "accept".to_string(),
        "content-type".to_string(),
        "x-api-version".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub canonical_name: String,
    pub base_url: String,
    pub auth_kind: AuthKind,
    pub priority: i64,
    pub active: bool,
    pub timeout_ms: i64,
    pub retry_count: i64,
    pub breaker_failure_threshold: i64,
    pub breaker_volume_threshold: i64,
    pub vary_headers: Vec<String>,
    pub storage_mode: StorageMode,
    pub pool_id: Option<String>,
    pub kill_switch: bool,
    pub bypass_bot_detection: bool,
    pub fallback_mode: FallbackMode,
    pub cost_per_request: Option<f64>,
    pub round_robin: bool,
}

/// Decrypted auth material, materialized only for the duration of a
/// dispatch and never persisted in this form (spec.md §4.2, §5).
pub struct DecryptedAuth {
    pub kind: AuthKind,
    pub credentials: Option<String>,
    pub custom_headers: Vec<(String, String)>,
}

impl Drop for DecryptedAuth {
    fn drop(&mut self) {
        if let Some(credentials) = self.credentials.as_mut() {
            credentials.zeroize();
        }
    }
}

#[derive(FromRow)]
struct SourceRow {
    id: String,
    tenant_id: String,
    name: String,
    canonical_name: String,
    base_url: String,
    auth_kind: String,
    auth_credentials_encrypted: Option<Vec<u8>>,
    custom_headers_json: Option<String>,
    priority: i64,
    active: i64,
    timeout_ms: i64,
    retry_count: i64,
    breaker_failure_threshold: i64,
    breaker_volume_threshold: i64,
    vary_headers_json: String,
    storage_mode: String,
    pool_id: Option<String>,
    kill_switch: i64,
    bypass_bot_detection: i64,
    fallback_mode: String,
    cost_per_request: Option<f64>,
    round_robin: i64,
}

impl SourceRow {
    fn into_source(self) -> Source {
        Source {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            canonical_name: self.canonical_name,
            base_url: self.base_url,
            auth_kind: AuthKind::from_str(&self.auth_kind),
            priority: self.priority,
            active: self.active != 0,
            timeout_ms: self.timeout_ms,
            retry_count: self.retry_count,
            breaker_failure_threshold: self.breaker_failure_threshold,
            breaker_volume_threshold: self.breaker_volume_threshold,
            vary_headers: serde_json::from_str(&self.vary_headers_json).unwrap_or_default(),
            storage_mode: StorageMode::from_str(&self.storage_mode),
            pool_id: self.pool_id,
            kill_switch: self.kill_switch != 0,
            bypass_bot_detection: self.bypass_bot_detection != 0,
            fallback_mode: FallbackMode::from_str(&self.fallback_mode),
            cost_per_request: self.cost_per_request,
            round_robin: self.round_robin != 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("source not found")]
    NotFound,
    #[error("demo limit exceeded: at most {0} sources per tenant")]
    DemoLimitExceeded(usize),
    #[error("a shared-storage source must have a pool id")]
    SharedRequiresPool,
    #[error("encryption error: {0}")]
    Crypto(String),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Fields accepted when creating a source; mirrors the subset of `Source`
/// an admin supplies versus what the registry computes (id, timestamps).
pub struct NewSource {
    pub name: String,
    pub canonical_name: String,
    pub base_url: String,
    pub auth_kind: AuthKind,
    pub auth_credentials: Option<String>,
    pub custom_headers: Vec<(String, String)>,
    pub priority: i64,
    pub timeout_ms: i64,
    pub retry_count: i64,
    pub breaker_failure_threshold: i64,
    pub breaker_volume_threshold: i64,
    pub vary_headers: Vec<String>,
    pub storage_mode: StorageMode,
    pub pool_id: Option<String>,
    pub bypass_bot_detection: bool,
    pub fallback_mode: FallbackMode,
    pub cost_per_request: Option<f64>,
    pub round_robin: bool,
}

#[derive(Clone)]
pub struct SourceRegistry {
    pool: SqlitePool,
    cipher_key: [u8; 32],
}

impl SourceRegistry {
    pub fn new(pool: SqlitePool, cipher_key: [u8; 32]) -> Self {
        Self { pool, cipher_key }
    }

    /// Count currently-stored sources for a tenant, used to enforce the
    /// demo cap on both single and bulk creates (spec.md §6).
    pub async fn count(&self, tenant_id: &str) -> SourceResult<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sources WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    /// Create one or more sources atomically, enforcing the demo cap across
    /// the whole batch (spec.md §6: "the cap applies to... multi-URL create
    /// calls, counting by the number of entries it would produce").
    pub async fn create_batch(
        &self,
        tenant_id: &str,
        entries: Vec<NewSource>,
        demo_cap: usize,
    ) -> SourceResult<Vec<Source>> {
        let existing = self.count(tenant_id).await?;
        if existing + entries.len() > demo_cap {
            return Err(SourceError::DemoLimitExceeded(demo_cap));
        }

        let mut created = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.storage_mode == StorageMode::Shared && entry.pool_id.is_none() {
                return Err(SourceError::SharedRequiresPool);
            }
            created.push(self.insert(tenant_id, entry).await?);
        }
        Ok(created)
    }

    async fn insert(&self, tenant_id: &str, entry: NewSource) -> SourceResult<Source> {
        let id = Uuid::new_v4().to_string();
        let encrypted = entry
            .auth_credentials
            .as_deref()
            .map(|plain| self.encrypt(plain))
            .transpose()?;
        let headers_json =
            serde_json::to_string(&entry.custom_headers).unwrap_or_else(|_| "[]".to_string());
        let vary_json =
            serde_json::to_string(&entry.vary_headers).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            "INSERT INTO sources (
                id, tenant_id, name, canonical_name, base_url, auth_kind,
                auth_credentials_encrypted, custom_headers_json, priority, active,
                timeout_ms, retry_count, breaker_failure_threshold, breaker_volume_threshold,
                vary_headers_json, storage_mode, pool_id, kill_switch, bypass_bot_detection,
                fallback_mode, cost_per_request, round_robin
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(&entry.name)
        .bind(&entry.canonical_name)
        .bind(&entry.base_url)
        .bind(entry.auth_kind.as_str())
        .bind(encrypted)
        .bind(headers_json)
        .bind(entry.priority)
        .bind(entry.timeout_ms)
        .bind(entry.retry_count)
        .bind(entry.breaker_failure_threshold)
        .bind(entry.breaker_volume_threshold)
        .bind(vary_json)
        .bind(entry.storage_mode.as_str())
        .bind(&entry.pool_id)
        .bind(entry.bypass_bot_detection as i64)
        .bind(entry.fallback_mode.as_str())
        .bind(entry.cost_per_request)
        .bind(entry.round_robin as i64)
        .execute(&self.pool)
        .await?;

        self.get(tenant_id, &id).await
    }

    pub async fn get(&self, tenant_id: &str, id: &str) -> SourceResult<Source> {
        let row: SourceRow = sqlx::query_as(
            "SELECT id, tenant_id, name, canonical_name, base_url, auth_kind,
                    auth_credentials_encrypted, custom_headers_json, priority, active,
                    timeout_ms, retry_count, breaker_failure_threshold, breaker_volume_threshold,
                    vary_headers_json, storage_mode, pool_id, kill_switch, bypass_bot_detection,
                    fallback_mode, cost_per_request, round_robin
             FROM sources WHERE tenant_id = ? AND id = ?",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SourceError::NotFound)?;

        Ok(row.into_source())
    }

    /// Active sources ordered by ascending priority, ties broken by stable
    /// database (insertion) order (spec.md §4.2, §8 boundary property).
    pub async fn list_active(&self, tenant_id: &str) -> SourceResult<Vec<Source>> {
        let rows: Vec<SourceRow> = sqlx::query_as(
            "SELECT id, tenant_id, name, canonical_name, base_url, auth_kind,
                    auth_credentials_encrypted, custom_headers_json, priority, active,
                    timeout_ms, retry_count, breaker_failure_threshold, breaker_volume_threshold,
                    vary_headers_json, storage_mode, pool_id, kill_switch, bypass_bot_detection,
                    fallback_mode, cost_per_request, round_robin
             FROM sources WHERE tenant_id = ? AND active = 1
             ORDER BY priority ASC, rowid ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SourceRow::into_source).collect())
    }

    /// Group sibling sources sharing a canonical name, per spec.md §4.2:
    /// exact match, `"{canonical} - "` prefix, or `"{canonical} "` prefix.
    pub async fn resolve_by_name(&self, tenant_id: &str, canonical: &str) -> SourceResult<Vec<Source>> {
        let active = self.list_active(tenant_id).await?;
        let dash_prefix = format!("{canonical} - ");
        let space_prefix = format!("{canonical} ");
        Ok(active
            .into_iter()
            .filter(|s| {
                s.canonical_name == canonical
                    || s.canonical_name.starts_with(&dash_prefix)
                    || s.canonical_name.starts_with(&space_prefix)
            })
            .collect())
    }

    /// Decrypt a source's auth descriptor and custom headers on demand;
    /// never cached on shared state (spec.md §4.2, §5).
    pub async fn load_with_auth(&self, tenant_id: &str, id: &str) -> SourceResult<DecryptedAuth> {
        let row: (String, Option<Vec<u8>>, Option<String>) = sqlx::query_as(
            "SELECT auth_kind, auth_credentials_encrypted, custom_headers_json
             FROM sources WHERE tenant_id = ? AND id = ?",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SourceError::NotFound)?;

        let (kind_str, encrypted, headers_json) = row;
        let credentials = encrypted.map(|bytes| self.decrypt(&bytes)).transpose()?;
        let custom_headers: Vec<(String, String)> = headers_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Ok(DecryptedAuth {
            kind: AuthKind::from_str(&kind_str),
            credentials,
            custom_headers,
        })
    }

    /// Reassign a source's pool id and migrate every cache entry it owns to
    /// the new pool in a single update (spec.md §3 lifecycle, §4.5 "Storage
    /// migration"). Failures updating the source itself abort; failures
    /// migrating entries do not roll back the source update (spec.md §4.5).
    pub async fn change_storage(
        &self,
        tenant_id: &str,
        id: &str,
        storage_mode: StorageMode,
        pool_id: Option<String>,
    ) -> SourceResult<()> {
        if storage_mode == StorageMode::Shared && pool_id.is_none() {
            return Err(SourceError::SharedRequiresPool);
        }

        sqlx::query("UPDATE sources SET storage_mode = ?, pool_id = ? WHERE tenant_id = ? AND id = ?")
            .bind(storage_mode.as_str())
            .bind(&pool_id)
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        let _ = sqlx::query(
            "UPDATE cache_entries SET pool_id = ? WHERE tenant_id = ? AND source_id = ?",
        )
        .bind(&pool_id)
        .bind(tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await;

        Ok(())
    }

    fn encrypt(&self, plaintext: &str) -> SourceResult<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.cipher_key)
            .map_err(|e| SourceError::Crypto(e.to_string()))?;
        let mut nonce_bytes = [0u8; 12];
        AesOsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SourceError::Crypto(e.to_string()))?;
        let mut out = nonce_bytes.to_vec();
        out.append(&mut ciphertext);
        Ok(out)
    }

    fn decrypt(&self, blob: &[u8]) -> SourceResult<String> {
        if blob.len() < 12 {
            return Err(SourceError::Crypto("ciphertext too short".to_string()));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.cipher_key)
            .map_err(|e| SourceError::Crypto(e.to_string()))?;
        let nonce = Nonce::from_slice(&blob[..12]);
        let plaintext = cipher
            .decrypt(nonce, &blob[12..])
            .map_err(|e| SourceError::Crypto(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| SourceError::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, DatabaseConfig};

    async fn registry() -> SourceRegistry {
        let pool = ConnectionPool::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .pool;
        SourceRegistry::new(pool, [7u8; 32])
    }

    fn new_source(name: &str, priority: i64) -> NewSource {
        NewSource {
            name: name.to_string(),
            canonical_name: name.to_string(),
            base_url: "https://upstream.example.com".to_string(),
            auth_kind: AuthKind::Bearer,
            auth_credentials: Some("secret-token".to_string()),
            custom_headers: vec![],
            priority,
            timeout_ms: 5000,
            retry_count: 1,
            breaker_failure_threshold: 5,
            breaker_volume_threshold: 5,
            vary_headers: default_vary_headers(),
            storage_mode: StorageMode::Dedicated,
            pool_id: None,
            bypass_bot_detection: false,
            fallback_mode: FallbackMode::None,
            cost_per_request: Some(0.001),
            round_robin: false,
        }
    }

    #[tokio::test]
    async fn demo_cap_blocks_third_source() {
        let registry = registry().await;
        let tenant = "t1";
        registry
            .create_batch(tenant, vec![new_source("a", 1), new_source("b", 2)], 2)
            .await
            .unwrap();

        let result = registry
            .create_batch(tenant, vec![new_source("c", 3)], 2)
            .await;
        assert!(matches!(result, Err(SourceError::DemoLimitExceeded(2))));
    }

    #[tokio::test]
    async fn bulk_create_counts_toward_cap() {
        let registry = registry().await;
        let result = registry
            .create_batch("t1", vec![new_source("a", 1), new_source("b", 2), new_source("c", 3)], 2)
            .await;
        assert!(matches!(result, Err(SourceError::DemoLimitExceeded(2))));
    }

    #[tokio::test]
    async fn list_active_orders_by_priority_then_insertion() {
        let registry = registry().await;
        registry
            .create_batch("t1", vec![new_source("b", 1), new_source("a", 1)], 2)
            .await
            .unwrap();

        let sources = registry.list_active("t1").await.unwrap();
        assert_eq!(sources[0].name, "b");
        assert_eq!(sources[1].name, "a");
    }

    #[tokio::test]
    async fn auth_round_trips_through_encryption() {
        let registry = registry().await;
        let [created] = registry
            .create_batch("t1", vec![new_source("a", 1)], 2)
            .await
            .unwrap()
            .try_into()
            .unwrap_or_else(|_| panic!("expected one source"));

        let decrypted = registry.load_with_auth("t1", &created.id).await.unwrap();
        assert_eq!(decrypted.credentials.as_deref(), Some("secret-token"));
    }

    #[tokio::test]
    async fn resolve_by_name_groups_siblings() {
        let registry = registry().await;
        registry
            .create_batch(
                "t1",
                vec![
                    {
                        let mut s = new_source("primary", 1);
                        s.canonical_name = "weather".to_string();
                        s
                    },
                    {
                        let mut s = new_source("backup", 2);
                        s.canonical_name = "weather - backup".to_string();
                        s
                    },
                ],
                2,
            )
            .await
            .unwrap();

        let siblings = registry.resolve_by_name("t1", "weather").await.unwrap();
        assert_eq!(siblings.len(), 2);
    }

    #[tokio::test]
    async fn shared_without_pool_is_rejected() {
        let registry = registry().await;
        let mut source = new_source("a", 1);
        source.storage_mode = StorageMode::Shared;
        source.pool_id = None;

        let result = registry.create_batch("t1", vec![source], 2).await;
        assert!(matches!(result, Err(SourceError::SharedRequiresPool)));
    }
}
