//! Shared application state (spec.md §5 "Concurrency & Resource Model").
//!
//! One instance, built once in `main` and handed to axum as `State<Arc<AppState>>`
//! (the teacher's `api::handlers::AppState` shape), wrapping every collaborator
//! the HTTP layer calls into. Collaborators are each already internally
//! `Clone`-cheap (a pool handle, a `DashMap`, or similar), so `AppState`
//! itself only needs to be wrapped in one `Arc` rather than one per field.

use sqlx::SqlitePool;

use crate::breaker::BreakerRegistry;
use crate::cache::CacheStore;
use crate::compliance::ComplianceGate;
use crate::config::Settings;
use crate::dispatcher::Dispatcher;
use crate::distributed::DistributedStore;
use crate::lineage::LineageRecorder;
use crate::mock::MockCatalog;
use crate::policy::PolicyEngine;
use crate::pool::PoolRegistry;
use crate::ratelimit::RateLimiter;
use crate::source::SourceRegistry;
use crate::tenant::TenantDirectory;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub db: SqlitePool,
    pub sources: SourceRegistry,
    pub cache: CacheStore,
    pub breakers: BreakerRegistry,
    pub policy: PolicyEngine,
    pub compliance: ComplianceGate,
    pub mocks: MockCatalog,
    pub lineage: LineageRecorder,
    pub pools: PoolRegistry,
    pub rate_limiter: RateLimiter,
    pub distributed: DistributedStore,
    pub tenants: TenantDirectory,
    pub dispatcher: Dispatcher,
}
