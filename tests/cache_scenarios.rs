//! End-to-end scenarios against a real in-memory SQLite store, exercising
//! the cache/source/rate-limit layers together the way the dispatcher would
//! (spec.md §8 "End-to-end scenarios" S2, S3, S4, and the "Round-trip &
//! idempotence" properties above them).

use cachegate::cache::{CacheStore, NewCacheEntry, PoolFilter, CacheFilter};
use cachegate::db::{ConnectionPool, DatabaseConfig};
use cachegate::distributed::DistributedStore;
use cachegate::key::StorageMode;
use cachegate::lineage::LineageRecorder;
use cachegate::pool::PoolRegistry;
use cachegate::ratelimit::RateLimiter;
use cachegate::source::{AuthKind, FallbackMode, NewSource, SourceRegistry};

async fn memory_pool() -> sqlx::SqlitePool {
    ConnectionPool::connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..Default::default()
    })
    .await
    .unwrap()
    .pool
}

async fn seed_tenant(pool: &sqlx::SqlitePool, tenant_id: &str) {
    sqlx::query("INSERT INTO apps (id, name, api_key_hash) VALUES (?, ?, 'h')")
        .bind(tenant_id)
        .bind(tenant_id)
        .execute(pool)
        .await
        .unwrap();
}

fn new_entry(tenant_id: &str, source_id: &str, pool_id: Option<&str>, key: &str, ttl: i64) -> NewCacheEntry {
    NewCacheEntry {
        tenant_id: tenant_id.to_string(),
        source_id: source_id.to_string(),
        pool_id: pool_id.map(str::to_string),
        cache_key: key.to_string(),
        request_method: "GET".to_string(),
        request_url: "https://api.example.com/items/9".to_string(),
        body_fingerprint: None,
        response_status: 200,
        response_headers: Default::default(),
        response_body: br#"{"id":9}"#.to_vec(),
        content_type: Some("application/json".to_string()),
        ttl_seconds: ttl,
        tags: vec!["items".to_string()],
    }
}

/// spec.md §8 S2 — a dedicated source and a shared-pool source never
/// collide, and a second shared-pool source sees the first one's entry.
#[tokio::test]
async fn dedicated_and_shared_sources_isolate_correctly() {
    let pool = memory_pool().await;
    seed_tenant(&pool, "t1").await;
    let lineage = LineageRecorder::new(pool.clone());
    let store = CacheStore::new(pool.clone(), lineage);

    sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url, storage_mode) VALUES ('src-a','t1','A','shop','https://a.example.com','dedicated')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO storage_pools (id, tenant_id, name) VALUES ('pool-p','t1','shared-pool')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url, storage_mode, pool_id) VALUES ('src-b','t1','B','shop','https://b.example.com','shared','pool-p')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url, storage_mode, pool_id) VALUES ('src-c','t1','C','shop','https://c.example.com','shared','pool-p')")
        .execute(&pool)
        .await
        .unwrap();

    let key = "deadbeef";
    store.put(new_entry("t1", "src-a", None, key, 300), StorageMode::Dedicated).await.unwrap();
    store.put(new_entry("t1", "src-b", Some("pool-p"), key, 300), StorageMode::Shared).await.unwrap();

    let via_a = store.get("t1", key, "src-a", StorageMode::Dedicated, None).await.unwrap();
    assert!(via_a.is_some());
    assert_eq!(via_a.unwrap().source_id, "src-a");

    // src-c never wrote an entry, but shares pool-p with src-b, so it sees B's entry.
    let via_c = store.get("t1", key, "src-c", StorageMode::Shared, Some("pool-p")).await.unwrap();
    let via_c = via_c.expect("shared pool entry visible to sibling source");
    assert_eq!(via_c.source_id, "src-b");

    let entries = store.list("t1", &CacheFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 2, "dedicated and shared entries are distinct rows");
}

/// spec.md §8 "DedicatedOnly" list filter excludes entries whose owning
/// source has since been reassigned to a shared pool (§4.5 "List/Filter").
#[tokio::test]
async fn dedicated_only_filter_excludes_reassigned_sources() {
    let pool = memory_pool().await;
    seed_tenant(&pool, "t1").await;
    let lineage = LineageRecorder::new(pool.clone());
    let store = CacheStore::new(pool.clone(), lineage);

    sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url, storage_mode) VALUES ('src-a','t1','A','a','https://a.example.com','dedicated')")
        .execute(&pool)
        .await
        .unwrap();
    store.put(new_entry("t1", "src-a", None, "key-1", 300), StorageMode::Dedicated).await.unwrap();

    // Source is reassigned to shared, but its old dedicated entry is left orphaned with pool_id = NULL.
    sqlx::query("UPDATE sources SET storage_mode = 'shared', pool_id = 'pool-x' WHERE id = 'src-a'")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO storage_pools (id, tenant_id, name) VALUES ('pool-x','t1','x')")
        .execute(&pool)
        .await
        .unwrap();

    let filter = CacheFilter {
        pool_id: Some(PoolFilter::DedicatedOnly),
        ..Default::default()
    };
    let entries = store.list("t1", &filter).await.unwrap();
    assert!(entries.is_empty(), "orphaned entry for a now-shared source must not count as dedicated-only");
}

/// spec.md §8 S3 — TTL ceiling and "upserting the same payload twice" idempotence.
#[tokio::test]
async fn put_twice_with_same_payload_leaves_one_row_with_reset_hit_count() {
    let pool = memory_pool().await;
    seed_tenant(&pool, "t1").await;
    let lineage = LineageRecorder::new(pool.clone());
    let store = CacheStore::new(pool.clone(), lineage);
    sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url) VALUES ('src-a','t1','A','a','https://a.example.com')")
        .execute(&pool)
        .await
        .unwrap();

    let key = "same-key";
    store.put(new_entry("t1", "src-a", None, key, 60), StorageMode::Dedicated).await.unwrap();
    store.get("t1", key, "src-a", StorageMode::Dedicated, None).await.unwrap();
    store.get("t1", key, "src-a", StorageMode::Dedicated, None).await.unwrap();
    let entry = store.put(new_entry("t1", "src-a", None, key, 60), StorageMode::Dedicated).await.unwrap();

    assert_eq!(entry.hit_count, 0, "overwrite resets hit_count");
    let all = store.list("t1", &CacheFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1, "upserting the same payload twice leaves exactly one row");
}

/// spec.md §3: a dedicated source may still carry a non-null pool id purely
/// for grouping; isolation for it stays keyed on (tenant, source, key), so
/// upserting the same payload twice must still converge to one row even
/// though `pool_id` is non-null on every write.
#[tokio::test]
async fn put_twice_on_dedicated_source_with_grouping_pool_id_leaves_one_row() {
    let pool = memory_pool().await;
    seed_tenant(&pool, "t1").await;
    let lineage = LineageRecorder::new(pool.clone());
    let store = CacheStore::new(pool.clone(), lineage);
    sqlx::query("INSERT INTO storage_pools (id, tenant_id, name) VALUES ('pool-group','t1','grouping-only')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url, storage_mode, pool_id) VALUES ('src-a','t1','A','a','https://a.example.com','dedicated','pool-group')")
        .execute(&pool)
        .await
        .unwrap();

    let key = "same-key";
    store
        .put(new_entry("t1", "src-a", Some("pool-group"), key, 60), StorageMode::Dedicated)
        .await
        .unwrap();
    let entry = store
        .put(new_entry("t1", "src-a", Some("pool-group"), key, 60), StorageMode::Dedicated)
        .await
        .unwrap();

    assert_eq!(entry.hit_count, 0, "overwrite resets hit_count");
    let all = store.list("t1", &CacheFilter::default()).await.unwrap();
    assert_eq!(
        all.len(),
        1,
        "a dedicated source's grouping pool_id must not prevent upsert from finding its own prior row"
    );
}

/// spec.md §8 property 3 (TTL ceiling) and "purging expired entries then
/// listing with expired=true returns empty".
#[tokio::test]
async fn purge_expired_then_list_is_empty() {
    let pool = memory_pool().await;
    seed_tenant(&pool, "t1").await;
    let lineage = LineageRecorder::new(pool.clone());
    let store = CacheStore::new(pool.clone(), lineage);
    sqlx::query("INSERT INTO sources (id, tenant_id, name, canonical_name, base_url) VALUES ('src-a','t1','A','a','https://a.example.com')")
        .execute(&pool)
        .await
        .unwrap();

    // ttl_seconds = 0 would never expire, so write an already-past expiry directly.
    store.put(new_entry("t1", "src-a", None, "expired-key", 1), StorageMode::Dedicated).await.unwrap();
    sqlx::query("UPDATE cache_entries SET expires_at = '2000-01-01T00:00:00Z' WHERE cache_key = 'expired-key'")
        .execute(&pool)
        .await
        .unwrap();

    let purged = store.purge_expired("t1", None).await.unwrap();
    assert_eq!(purged, 1);

    let filter = CacheFilter {
        expired_only: Some(true),
        ..Default::default()
    };
    let remaining = store.list("t1", &filter).await.unwrap();
    assert!(remaining.is_empty());
}

/// spec.md §8 S4 — `max=3, window=10s`: first three calls allowed, the
/// fourth denied, using the in-process fallback counter (no Redis in tests).
#[tokio::test]
async fn rate_limit_window_denies_after_max_requests() {
    let pool = memory_pool().await;
    seed_tenant(&pool, "t1").await;
    let distributed = DistributedStore::connect(None).await;
    let limiter = RateLimiter::new(pool.clone(), distributed);
    limiter.upsert("t1", None, 3, 10, true).await.unwrap();

    let mut decisions = Vec::new();
    for _ in 0..4 {
        decisions.push(limiter.check("t1", None, "client-a").await.unwrap());
    }

    assert!(decisions[0].allowed && decisions[1].allowed && decisions[2].allowed);
    assert!(!decisions[3].allowed);
    assert!(decisions[3].reset_seconds >= 1 && decisions[3].reset_seconds <= 10);
}

/// A tenant with no configured rule at all is unrestricted (spec.md §4.4
/// edge case: absence of a rule is not a zero limit).
#[tokio::test]
async fn rate_limit_with_no_rule_is_unrestricted() {
    let pool = memory_pool().await;
    seed_tenant(&pool, "t1").await;
    let distributed = DistributedStore::connect(None).await;
    let limiter = RateLimiter::new(pool.clone(), distributed);

    for _ in 0..50 {
        let decision = limiter.check("t1", None, "client-a").await.unwrap();
        assert!(decision.allowed);
    }
}

/// spec.md §8 property 7 and §6: a create that would push a tenant past the
/// demo cap is rejected, whether single or batched.
#[tokio::test]
async fn demo_cap_rejects_batches_that_would_exceed_it() {
    let pool = memory_pool().await;
    seed_tenant(&pool, "t1").await;
    let sources = SourceRegistry::new(pool.clone(), [7u8; 32]);

    let make = |name: &str| NewSource {
        name: name.to_string(),
        canonical_name: name.to_string(),
        base_url: format!("https://{name}.example.com"),
        auth_kind: AuthKind::None,
        auth_credentials: None,
        custom_headers: Vec::new(),
        priority: 100,
        timeout_ms: 10_000,
        retry_count: 0,
        breaker_failure_threshold: 5,
        breaker_volume_threshold: 5,
        vary_headers: cachegate::source::default_vary_headers(),
        storage_mode: StorageMode::Dedicated,
        pool_id: None,
        bypass_bot_detection: false,
        fallback_mode: FallbackMode::None,
        cost_per_request: None,
        round_robin: false,
    };

    let created = sources.create_batch("t1", vec![make("a"), make("b")], 2).await.unwrap();
    assert_eq!(created.len(), 2);

    let result = sources.create_batch("t1", vec![make("c")], 2).await;
    assert!(result.is_err(), "a third source must be rejected under a cap of 2");

    let result = sources.create_batch("t1", vec![make("d"), make("e"), make("f")], 2).await;
    assert!(result.is_err(), "a multi-URL batch that would exceed the cap is rejected as a whole");

    assert_eq!(sources.count("t1").await.unwrap(), 2, "no partial writes from a rejected batch");
}

/// A shared-mode pool registered through `PoolRegistry` is visible to every
/// source that opts into it (spec.md §3 "Storage Pool").
#[tokio::test]
async fn pool_registry_get_or_create_is_idempotent() {
    let pool = memory_pool().await;
    seed_tenant(&pool, "t1").await;
    let pools = PoolRegistry::new(pool.clone());

    let first = pools.get_or_create("t1", "shop-pool").await.unwrap();
    let second = pools.get_or_create("t1", "shop-pool").await.unwrap();
    assert_eq!(first.id, second.id);

    let all = pools.list("t1").await.unwrap();
    assert_eq!(all.len(), 1);
}
