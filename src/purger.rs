//! Scheduled purger (spec.md §4.9).
//!
//! One timer per tenant/source cache policy that carries a `purge_schedule`
//! cron expression; each firing takes the distributed lock before sweeping so
//! only one replica actually deletes rows, then records an audit event via
//! [`crate::lineage::LineageRecorder`]. Grounded on the teacher's
//! `scheduling::cron_scheduler` tick-and-dispatch loop, narrowed to the one
//! job kind this system runs.

use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::time;

use crate::cache::CacheStore;
use crate::distributed::DistributedStore;
use crate::lineage::LineageRecorder;

/// How long a purge lock is held before it's considered abandoned
/// (spec.md §4.9: "5 minutes, long enough for a purge sweep on a
/// pathologically large tenant, short enough that a crashed holder doesn't
/// wedge the schedule for long").
const PURGE_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum PurgerError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),
}

pub type PurgerResult<T> = Result<T, PurgerError>;

#[derive(Debug, sqlx::FromRow)]
struct ScheduledPolicy {
    id: String,
    tenant_id: String,
    source_id: String,
    purge_schedule: String,
}

pub struct Purger {
    pool: SqlitePool,
    cache: CacheStore,
    lineage: LineageRecorder,
    distributed: DistributedStore,
}

impl Purger {
    pub fn new(pool: SqlitePool, cache: CacheStore, lineage: LineageRecorder, distributed: DistributedStore) -> Self {
        Self { pool, cache, lineage, distributed }
    }

    async fn scheduled_policies(&self) -> PurgerResult<Vec<ScheduledPolicy>> {
        Ok(sqlx::query_as(
            "SELECT id, tenant_id, source_id, purge_schedule FROM cache_policies WHERE purge_schedule IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// A policy's cron expression fires if any instant in the last `since`
    /// window lies on its schedule. Invalid cron expressions are skipped
    /// rather than crashing the sweep (spec.md §4.9 "a malformed schedule
    /// disables that one policy's purge, not the whole sweep").
    fn is_due(expression: &str, since: chrono::Duration) -> bool {
        let Ok(schedule) = Schedule::try_from(expression) else {
            tracing::warn!(expression, "invalid purge_schedule, skipping");
            return false;
        };
        let now = Utc::now();
        let window_start = now - since;
        schedule
            .after(&window_start)
            .take_while(|at| *at <= now)
            .next()
            .is_some()
    }

    /// One tick: evaluate every policy's schedule against the window since
    /// the last tick, acquire a per-policy lock, and purge expired entries
    /// for that policy's source. In single-instance mode (no Redis) the lock
    /// always succeeds locally, so nothing changes (spec.md §4.9).
    pub async fn tick(&self, since: chrono::Duration) -> PurgerResult<usize> {
        let policies = self.scheduled_policies().await?;
        let mut purged_total = 0;

        for policy in policies {
            if !Self::is_due(&policy.purge_schedule, since) {
                continue;
            }

            let lock_key = format!("purge-lock:{}", policy.id);
            let Some(guard) = self.distributed.try_lock(&lock_key, PURGE_LOCK_TTL).await.unwrap_or(None) else {
                tracing::debug!(policy_id = %policy.id, "purge lock held elsewhere, skipping this tick");
                continue;
            };

            let purged = self.cache.purge_expired(&policy.tenant_id, None).await?;
            purged_total += purged as usize;

            let _ = self
                .lineage
                .audit_rejection(&policy.tenant_id, None, "scheduled_purge", &format!("purged {purged} entries for source {}", policy.source_id))
                .await;

            guard.release().await;
        }

        Ok(purged_total)
    }

    /// Run [`Self::tick`] on a fixed cadence until the process exits, passing
    /// the elapsed time since the previous tick as the due-window.
    pub async fn run_forever(self, poll_interval: Duration) {
        let mut ticker = time::interval(poll_interval);
        let mut last_tick = Utc::now();
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let since = now - last_tick;
            match self.tick(since).await {
                Ok(count) if count > 0 => tracing::info!(count, "scheduled purge swept entries"),
                Ok(_) => {}
                Err(err) => tracing::error!(%err, "scheduled purge tick failed"),
            }
            last_tick = now;
        }
    }
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

    #[test]
    fn malformed_schedule_is_never_due() {
        assert!(!Purger::is_due("not a cron expression", chrono::Duration::minutes(5)));
    }

    #[test]
    fn every_minute_schedule_is_due_within_a_minute_window() {
        assert!(Purger::is_due("0 * * * * *", chrono::Duration::minutes(2)));
    }

    #[tokio::test]
    async fn tick_purges_due_policy_and_releases_lock() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO apps (id, name, api_key_hash) VALUES ('t1','t1','h')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url) VALUES ('s1','t1','a','a','https://x')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO cache_policies (id, tenant_id, source_id, purge_schedule) VALUES ('p1','t1','s1','0 * * * * *')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO cache_entries (id, tenant_id, source_id, cache_key, request_method, request_url, response_status, response_body, expires_at)
             VALUES ('e1','t1','s1','k1','GET','https://x/y',200,x'7b7d', ?)",
        )
        .bind((Utc::now() - chrono::Duration::seconds(10)).to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let lineage = LineageRecorder::new(pool.clone());
        let purger = Purger::new(pool.clone(), CacheStore::new(pool.clone(), lineage.clone()), lineage, DistributedStore::connect(None).await);

        let purged = purger.tick(chrono::Duration::minutes(2)).await.unwrap();
        assert_eq!(purged, 1);

        let second = purger.tick(chrono::Duration::minutes(2)).await.unwrap();
        assert_eq!(second, 0);
    }
}
