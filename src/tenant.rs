//! Tenant identity and authentication (spec.md §3 "Tenant (App)", §6
//! "Tenant authentication").
//!
//! Grounded on `auth::rbac`'s `Role`/permission-check shape, simplified to
//! the three roles the spec names. API keys are stored hashed (argon2, same
//! primitive the teacher uses for user passwords in `auth::mod`), never in
//! plaintext.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    pub fn can_write(self) -> bool {
        matches!(self, Role::Admin)
    }

    fn from_str(s: &str) -> Self {
        match s {
            "editor" => Role::Editor,
            "admin" => Role::Admin,
            _ => Role::Viewer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub kill_switch: bool,
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("invalid or unknown API key")]
    InvalidApiKey,
    #[error("role {required:?} required, tenant has {actual:?}")]
    InsufficientRole { required: Role, actual: Role },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("hashing error: {0}")]
    Hash(String),
}

pub type TenantResult<T> = Result<T, TenantError>;

/// Resolves bearer/API-key credentials to a tenant, as the proxy front door
/// does on every request (spec.md §6).
#[derive(Clone)]
pub struct TenantDirectory {
    pool: SqlitePool,
}

impl TenantDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, name: &str, role: Role) -> TenantResult<(Tenant, String)> {
        let id = Uuid::new_v4().to_string();
        let plaintext_key = format!("cg_{}", Uuid::new_v4().simple());
        let hash = hash_key(&plaintext_key).map_err(TenantError::Hash)?;

        sqlx::query("INSERT INTO apps (id, name, api_key_hash, role) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(name)
            .bind(&hash)
            .bind(role_str(role))
            .execute(&self.pool)
            .await?;

        Ok((
            Tenant {
                id,
                name: name.to_string(),
                role,
                kill_switch: false,
            },
            plaintext_key,
        ))
    }

    /// Resolve an opaque API key (from `X-API-Key` or a `Bearer` token) to
    /// its owning tenant. Every stored hash is checked because argon2 salts
    /// are per-row; this is acceptable at the scale a 2-source demo cap
    /// implies and mirrors how API-key lookup works in the teacher's
    /// `saas::tenant` module.
    pub async fn resolve_api_key(&self, presented_key: &str) -> TenantResult<Tenant> {
        let rows: Vec<(String, String, String, String, i64)> =
            sqlx::query_as("SELECT id, name, api_key_hash, role, kill_switch FROM apps")
                .fetch_all(&self.pool)
                .await?;

        for (id, name, hash, role, kill_switch) in rows {
            if verify_key(presented_key, &hash) {
                return Ok(Tenant {
                    id,
                    name,
                    role: Role::from_str(&role),
                    kill_switch: kill_switch != 0,
                });
            }
        }

        Err(TenantError::InvalidApiKey)
    }

    pub async fn set_kill_switch(&self, tenant_id: &str, enabled: bool) -> TenantResult<()> {
        sqlx::query("UPDATE apps SET kill_switch = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn require_role(tenant: &Tenant, required: Role) -> TenantResult<()> {
        if tenant.role >= required {
            Ok(())
        } else {
            Err(TenantError::InsufficientRole {
                required,
                actual: tenant.role,
            })
        }
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Viewer => "viewer",
        Role::Editor => "editor",
        Role::Admin => "admin",
    }
}

fn hash_key(key: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(key.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| e.to_string())
}

fn verify_key(key: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default().verify_password(key.as_bytes(), &parsed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, DatabaseConfig};

    async fn test_pool() -> SqlitePool {
        ConnectionPool::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .pool
    }

    #[tokio::test]
    async fn create_and_resolve_round_trips() {
        let directory = TenantDirectory::new(test_pool().await);
        let (tenant, key) = directory.create("acme", Role::Admin).await.unwrap();

        let resolved = directory.resolve_api_key(&key).await.unwrap();
        assert_eq!(resolved.id, tenant.id);
        assert_eq!(resolved.role, Role::Admin);
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let directory = TenantDirectory::new(test_pool().await);
        directory.create("acme", Role::Viewer).await.unwrap();

        let result = directory.resolve_api_key("not-a-real-key").await;
        assert!(matches!(result, Err(TenantError::InvalidApiKey)));
    }

    #[test]
    fn role_ordering_gates_writes() {
        assert!(Role::Admin > Role::Editor);
        assert!(Role::Editor > Role::Viewer);
        assert!(Role::Admin.can_write());
        assert!(!Role::Editor.can_write());
    }
}
