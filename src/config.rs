//! Process-wide settings, loaded once from the environment at startup.
//!
//! Grounded on `enterprise::config::EnterpriseConfig`'s flat, env-friendly
//! shape: typed fields with sane defaults rather than a config-file DSL.

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::db::DatabaseConfig;

/// Demo cap on sources per tenant (spec.md §6). Kept a `const` rather than a
/// configuration field: the spec's Open Question (b) leaves this undecided,
/// and a hard build-time constant matches how the rest of the demo-limit
/// logic (403 + audit) is wired as unconditional behavior, not a toggle.
pub const DEMO_SOURCE_CAP: usize = 2;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub database: DatabaseConfig,
    /// `redis://...`; absent means rate limiting and the purge lock run
    /// in per-process fallback mode (spec.md §4.4, §4.9, §5).
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    /// Controls whether 500 responses include the underlying error message
    /// (spec.md §7).
    pub development_mode: bool,
    /// Upper bound on rate-limit/cache-lookup steps before failing open
    /// (spec.md §5).
    pub backing_store_deadline: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        let bind_addr =
            std::env::var("CACHEGATE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let database_url =
            std::env::var("CACHEGATE_DATABASE_URL").unwrap_or_else(|_| "sqlite://cachegate.db".to_string());
        let redis_url = std::env::var("CACHEGATE_REDIS_URL").ok();
        let jwt_secret = std::env::var("CACHEGATE_JWT_SECRET")
            .unwrap_or_else(|_| "development-only-insecure-secret".to_string());
        let development_mode = std::env::var("CACHEGATE_DEV_MODE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Self {
            bind_addr,
            database: DatabaseConfig {
                url: database_url,
                ..Default::default()
            },
            redis_url,
            jwt_secret,
            development_mode,
            backing_store_deadline: Duration::from_secs(2),
        }
    }

    /// 32-byte AES-256-GCM key for source credential envelope encryption
    /// (spec.md §4.2), derived from `jwt_secret` rather than a second env var
    /// — this process has no session/JWT surface of its own, so the secret's
    /// only job is seeding derived keys.
    pub fn cipher_key(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.jwt_secret.as_bytes());
        hasher.finalize().into()
    }
}
