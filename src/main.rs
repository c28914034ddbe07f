//! cachegate - API Caching and Failover Proxy
//!
//! Boots the HTTP server: loads settings, connects the relational store,
//! wires every collaborator into [`cachegate::api::state::AppState`], mounts
//! the proxy/data/management routes behind the middleware stack spec.md §6
//! and §7 describe, and spawns the revalidator and purger background sweeps.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware as axum_middleware,
    routing::{delete, get, patch, post, put},
    Router,
};

use cachegate::api::{data, management, middleware, proxy, state::AppState};
use cachegate::breaker::BreakerRegistry;
use cachegate::cache::CacheStore;
use cachegate::compliance::ComplianceGate;
use cachegate::config::Settings;
use cachegate::db::ConnectionPool;
use cachegate::dispatcher::Dispatcher;
use cachegate::distributed::DistributedStore;
use cachegate::lineage::LineageRecorder;
use cachegate::mock::MockCatalog;
use cachegate::policy::PolicyEngine;
use cachegate::pool::PoolRegistry;
use cachegate::purger::Purger;
use cachegate::ratelimit::RateLimiter;
use cachegate::revalidator::Revalidator;
use cachegate::source::SourceRegistry;
use cachegate::tenant::TenantDirectory;

/// How often the stale-entry sweep runs (spec.md §4.8).
const REVALIDATION_INTERVAL: Duration = Duration::from_secs(60);
/// How often the scheduled-purge tick runs (spec.md §4.9).
const PURGE_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env();
    tracing::info!(bind_addr = %settings.bind_addr, dev_mode = settings.development_mode, "cachegate starting up");

    let db = ConnectionPool::connect(&settings.database).await?;
    let pool = db.pool.clone();
    let cipher_key = settings.cipher_key();

    let lineage = LineageRecorder::new(pool.clone());
    let sources = SourceRegistry::new(pool.clone(), cipher_key);
    let cache = CacheStore::new(pool.clone(), lineage.clone());
    let breakers = BreakerRegistry::new();
    let compliance = ComplianceGate::new(pool.clone());
    let policy = PolicyEngine::new(pool.clone(), compliance.clone());
    let mocks = MockCatalog::new(pool.clone());
    let pools = PoolRegistry::new(pool.clone());
    let distributed = DistributedStore::connect(settings.redis_url.as_deref()).await;
    let rate_limiter = RateLimiter::new(pool.clone(), distributed.clone());
    let tenants = TenantDirectory::new(pool.clone());
    let dispatcher = Dispatcher::new(
        sources.clone(),
        cache.clone(),
        breakers.clone(),
        policy.clone(),
        mocks.clone(),
        lineage.clone(),
    );

    let revalidator = Revalidator::new(pool.clone(), dispatcher.clone());
    let purger = Purger::new(pool.clone(), cache.clone(), lineage.clone(), distributed.clone());
    tokio::spawn(revalidator.run_forever(REVALIDATION_INTERVAL));
    tokio::spawn(purger.run_forever(PURGE_POLL_INTERVAL));

    let state = Arc::new(AppState {
        settings: settings.clone(),
        db: pool,
        sources,
        cache,
        breakers,
        policy,
        compliance,
        mocks,
        lineage,
        pools,
        rate_limiter,
        distributed,
        tenants,
        dispatcher,
    });

    let app = Router::new()
        .route("/healthz", get(management::healthz))
        .route("/readyz", get(management::readyz))
        .route("/data", post(data::fetch_data))
        .route("/proxy/:canonical_name/*path", axum::routing::any(proxy::proxy_handler))
        .route("/management/sources", post(management::create_sources).get(management::list_sources))
        .route("/management/sources/:id", get(management::get_source))
        .route("/management/sources/:id/storage", patch(management::change_source_storage))
        .route("/management/sources/:id/savings", get(management::source_savings))
        .route("/management/pools", post(management::create_pool).get(management::list_pools))
        .route("/management/policies/:source_id", put(management::upsert_policy).get(management::get_policy))
        .route("/management/compliance/:source_id", put(management::upsert_compliance))
        .route("/management/rate-limits", put(management::upsert_rate_limit).get(management::list_rate_limits))
        .route("/management/rate-limits/:id", delete(management::delete_rate_limit))
        .route("/management/mocks/:source_id", post(management::create_mock).get(management::list_mocks))
        .route("/management/cache", get(management::list_cache_entries))
        .route("/management/cache/invalidate-key", post(management::invalidate_key))
        .route("/management/cache/invalidate-tags", post(management::invalidate_by_tags))
        .route("/management/cache/purge", post(management::purge_cache))
        .route("/management/lineage", get(management::lineage_for_tenant))
        .route("/management/lineage/:entry_id", get(management::lineage_for_entry))
        .route("/management/audit", get(management::audit_log))
        .route("/management/metrics", get(management::metrics))
        .layer(axum_middleware::from_fn(middleware::security_headers_middleware))
        .layer(axum_middleware::from_fn(middleware::request_logging_middleware))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::rate_limit_middleware))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::tenant_auth_middleware))
        .layer(middleware::cors_layer())
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(bind_addr = %settings.bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
