//! Management surface (spec.md §6 "Management surface"): REST endpoints for
//! sources, pools, policies, rate-limit rules, mocks, cache entries, lineage,
//! audit, cost savings, and metrics.
//!
//! Every write here is role-gated to admin via [`require_role`]; list
//! endpoints accept `page`/`limit` and return a [`PaginatedResponse`];
//! mutations return the updated entity wrapped in an [`ApiResponse`], per
//! spec.md §6. Grounded on the same handler shape as [`super::proxy`] and
//! [`super::data`] — pull the request into the owning subsystem's call,
//! convert its error with `?`, wrap the result.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheFilter, PoolFilter, SortField, TagMatch};
use crate::compliance::TosRule;
use crate::key::StorageMode;
use crate::lineage::LineageEvent;
use crate::mock::MockResponse;
use crate::pool::StoragePool;
use crate::ratelimit::RateLimitRuleRecord;
use crate::source::{AuthKind, FallbackMode, NewSource, Source};
use crate::tenant::{Role, Tenant};

use super::middleware::require_role;
use super::responses::{ApiError, ApiResponse, PaginatedResponse};
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

// ---------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSourceRequest {
    pub name: String,
    pub canonical_name: String,
    pub base_url: String,
    #[serde(default)]
    pub auth_kind: AuthKind,
    #[serde(default)]
    pub auth_credentials: Option<String>,
    #[serde(default)]
    pub custom_headers: Vec<(String, String)>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default = "default_retry_count")]
    pub retry_count: i64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: i64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_volume_threshold: i64,
    #[serde(default = "crate::source::default_vary_headers")]
    pub vary_headers: Vec<String>,
    #[serde(default)]
    pub storage_mode: StorageMode,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub bypass_bot_detection: bool,
    #[serde(default)]
    pub fallback_mode: FallbackMode,
    #[serde(default)]
    pub cost_per_request: Option<f64>,
    #[serde(default)]
    pub round_robin: bool,
}

impl From<NewSourceRequest> for NewSource {
    fn from(req: NewSourceRequest) -> Self {
        NewSource {
            name: req.name,
            canonical_name: req.canonical_name,
            base_url: req.base_url,
            auth_kind: req.auth_kind,
            auth_credentials: req.auth_credentials,
            custom_headers: req.custom_headers,
            priority: req.priority,
            timeout_ms: req.timeout_ms,
            retry_count: req.retry_count,
            breaker_failure_threshold: req.breaker_failure_threshold,
            breaker_volume_threshold: req.breaker_volume_threshold,
            vary_headers: req.vary_headers,
            storage_mode: req.storage_mode,
            pool_id: req.pool_id,
            bypass_bot_detection: req.bypass_bot_detection,
            fallback_mode: req.fallback_mode,
            cost_per_request: req.cost_per_request,
            round_robin: req.round_robin,
        }
    }
}

fn default_timeout_ms() -> i64 {
    5000
}
fn default_retry_count() -> i64 {
    1
}
fn default_breaker_threshold() -> i64 {
    5
}

#[derive(Debug, Deserialize)]
pub struct CreateSourcesRequest {
    pub sources: Vec<NewSourceRequest>,
}

/// `POST /management/sources`. Enforces the demo cap (spec.md §6
/// "Environment") across the whole batch; a rejection is audited.
pub async fn create_sources(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Json(payload): Json<CreateSourcesRequest>,
) -> Result<Json<ApiResponse<Vec<Source>>>, ApiError> {
    require_role(&tenant, Role::Admin)?;

    let entries: Vec<NewSource> = payload.sources.into_iter().map(Into::into).collect();
    let result = state
        .sources
        .create_batch(&tenant.id, entries, crate::config::DEMO_SOURCE_CAP)
        .await;

    match result {
        Ok(sources) => Ok(Json(ApiResponse::success(sources))),
        Err(crate::source::SourceError::DemoLimitExceeded(cap)) => {
            let _ = state
                .lineage
                .audit_rejection(&tenant.id, Some(&tenant.id), "create_source", &format!("demo cap of {cap} exceeded"))
                .await;
            Err(crate::source::SourceError::DemoLimitExceeded(cap).into())
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn list_sources(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<ApiResponse<Vec<Source>>>, ApiError> {
    let sources = state.sources.list_active(&tenant.id).await?;
    Ok(Json(ApiResponse::success(sources)))
}

pub async fn get_source(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Source>>, ApiError> {
    let source = state.sources.get(&tenant.id, &id).await?;
    Ok(Json(ApiResponse::success(source)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStorageRequest {
    pub storage_mode: StorageMode,
    #[serde(default)]
    pub pool_id: Option<String>,
}

/// `PATCH /management/sources/{id}/storage` (spec.md §4.5 "Storage
/// migration").
pub async fn change_source_storage(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
    Json(payload): Json<ChangeStorageRequest>,
) -> Result<Json<ApiResponse<Source>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    state
        .sources
        .change_storage(&tenant.id, &id, payload.storage_mode, payload.pool_id)
        .await?;
    let source = state.sources.get(&tenant.id, &id).await?;
    Ok(Json(ApiResponse::success(source)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavingsResult {
    pub source_id: String,
    pub total_hits: i64,
    pub cost_per_request: f64,
    pub savings: f64,
}

/// `GET /management/sources/{id}/savings` (SPEC_FULL.md §B "Cost savings
/// accounting"): `hit_count * cost_per_request` summed across every entry
/// the source owns.
pub async fn source_savings(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<SavingsResult>>, ApiError> {
    let source = state.sources.get(&tenant.id, &id).await?;
    let total_hits = state.cache.total_hits_for_source(&tenant.id, &id).await?;
    let cost_per_request = source.cost_per_request.unwrap_or(0.0);

    Ok(Json(ApiResponse::success(SavingsResult {
        source_id: id,
        total_hits,
        cost_per_request,
        savings: total_hits as f64 * cost_per_request,
    })))
}

// ---------------------------------------------------------------------
// Storage pools
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
}

pub async fn create_pool(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Json(payload): Json<CreatePoolRequest>,
) -> Result<Json<ApiResponse<StoragePool>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    let pool = state.pools.create(&tenant.id, &payload.name).await?;
    Ok(Json(ApiResponse::success(pool)))
}

pub async fn list_pools(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<ApiResponse<Vec<StoragePool>>>, ApiError> {
    let pools = state.pools.list(&tenant.id).await?;
    Ok(Json(ApiResponse::success(pools)))
}

// ---------------------------------------------------------------------
// Cache policies
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertPolicyRequest {
    #[serde(default)]
    pub max_ttl_seconds: i64,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub purge_schedule: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePolicyResponse {
    pub source_id: String,
    pub max_ttl_seconds: i64,
    pub no_cache: bool,
}

pub async fn upsert_policy(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(source_id): Path<String>,
    Json(payload): Json<UpsertPolicyRequest>,
) -> Result<Json<ApiResponse<CachePolicyResponse>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    state
        .policy
        .upsert(&tenant.id, &source_id, payload.max_ttl_seconds, payload.no_cache, payload.purge_schedule.as_deref())
        .await?;
    let policy = state.policy.get(&tenant.id, &source_id).await?.ok_or_else(|| ApiError::internal("policy vanished after upsert"))?;
    Ok(Json(ApiResponse::success(CachePolicyResponse {
        source_id,
        max_ttl_seconds: policy.max_ttl_seconds,
        no_cache: policy.no_cache,
    })))
}

pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(source_id): Path<String>,
) -> Result<Json<ApiResponse<Option<CachePolicyResponse>>>, ApiError> {
    let policy = state.policy.get(&tenant.id, &source_id).await?;
    Ok(Json(ApiResponse::success(policy.map(|p| CachePolicyResponse {
        source_id: source_id.clone(),
        max_ttl_seconds: p.max_ttl_seconds,
        no_cache: p.no_cache,
    }))))
}

// ---------------------------------------------------------------------
// Compliance rules
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertComplianceRequest {
    #[serde(default)]
    pub allowed_regions: Option<Vec<String>>,
    #[serde(default)]
    pub denied_regions: Option<Vec<String>>,
    #[serde(default)]
    pub pii_block_cache: bool,
    #[serde(default)]
    pub tos_rules: Vec<TosRule>,
}

pub async fn upsert_compliance(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(source_id): Path<String>,
    Json(payload): Json<UpsertComplianceRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    state
        .compliance
        .upsert(
            &tenant.id,
            &source_id,
            payload.allowed_regions.as_deref(),
            payload.denied_regions.as_deref(),
            payload.pii_block_cache,
            &payload.tos_rules,
        )
        .await?;
    Ok(Json(ApiResponse::success(())))
}

// ---------------------------------------------------------------------
// Rate-limit rules
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRateLimitRequest {
    #[serde(default)]
    pub source_id: Option<String>,
    pub max_requests: i64,
    pub window_seconds: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

pub async fn upsert_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Json(payload): Json<UpsertRateLimitRequest>,
) -> Result<Json<ApiResponse<RateLimitRuleRecord>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    let rule = state
        .rate_limiter
        .upsert(&tenant.id, payload.source_id.as_deref(), payload.max_requests, payload.window_seconds, payload.enabled)
        .await?;
    Ok(Json(ApiResponse::success(rule)))
}

pub async fn list_rate_limits(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<ApiResponse<Vec<RateLimitRuleRecord>>>, ApiError> {
    let rules = state.rate_limiter.list(&tenant.id).await?;
    Ok(Json(ApiResponse::success(rules)))
}

pub async fn delete_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    state.rate_limiter.delete(&tenant.id, &id).await?;
    Ok(Json(ApiResponse::success(())))
}

// ---------------------------------------------------------------------
// Mock responses
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMockRequest {
    pub method: String,
    pub url_pattern: String,
    #[serde(default)]
    pub body_pattern: Option<String>,
    #[serde(default = "default_mock_status")]
    pub status: i64,
    #[serde(default)]
    pub headers_json: Option<String>,
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default = "default_mock_priority")]
    pub priority: i64,
}

fn default_mock_status() -> i64 {
    200
}
fn default_mock_priority() -> i64 {
    100
}

pub async fn create_mock(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(source_id): Path<String>,
    Json(payload): Json<CreateMockRequest>,
) -> Result<Json<ApiResponse<MockResponse>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    let mock = state
        .mocks
        .create(MockResponse {
            id: String::new(),
            tenant_id: tenant.id,
            source_id,
            method: payload.method,
            url_pattern: payload.url_pattern,
            body_pattern: payload.body_pattern,
            status: payload.status,
            headers_json: payload.headers_json.unwrap_or_else(|| "{}".to_string()),
            body: payload.body,
            priority: payload.priority,
            active: true,
        })
        .await?;
    Ok(Json(ApiResponse::success(mock)))
}

pub async fn list_mocks(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(source_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<MockResponse>>>, ApiError> {
    let mocks = state.mocks.list(&tenant.id, &source_id).await?;
    Ok(Json(ApiResponse::success(mocks)))
}

// ---------------------------------------------------------------------
// Cache entries
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheListParams {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub dedicated_only: bool,
    #[serde(default)]
    pub expired_only: Option<bool>,
    #[serde(default)]
    pub search: Option<String>,
}

pub async fn list_cache_entries(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<CacheListParams>,
) -> Result<Json<PaginatedResponse<crate::cache::CacheEntry>>, ApiError> {
    let pool_filter = if params.dedicated_only {
        Some(PoolFilter::DedicatedOnly)
    } else {
        params.pool_id.map(PoolFilter::Pool)
    };

    let filter = CacheFilter {
        expired_only: params.expired_only,
        source_id: params.source_id,
        pool_id: pool_filter,
        search: params.search,
        min_hits: None,
        max_hits: None,
        created_after: None,
        created_before: None,
        sort: SortField::default(),
        page: params.page,
        limit: params.limit,
    };

    let entries = state.cache.list(&tenant.id, &filter).await?;
    Ok(Json(PaginatedResponse::new(entries, params.page, params.limit)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateKeyRequest {
    pub source_id: String,
    pub key: String,
}

pub async fn invalidate_key(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Json(payload): Json<InvalidateKeyRequest>,
) -> Result<Json<ApiResponse<u64>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    let removed = state.cache.invalidate_key(&tenant.id, &payload.source_id, &payload.key).await?;
    Ok(Json(ApiResponse::success(removed)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateTagsRequest {
    pub tags: Vec<String>,
    #[serde(default)]
    pub match_all: bool,
}

pub async fn invalidate_by_tags(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Json(payload): Json<InvalidateTagsRequest>,
) -> Result<Json<ApiResponse<u64>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    let mode = if payload.match_all { TagMatch::All } else { TagMatch::Any };
    let removed = state.cache.invalidate_by_tags(&tenant.id, &payload.tags, mode).await?;
    Ok(Json(ApiResponse::success(removed)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeRequest {
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub expired_only: bool,
}

pub async fn purge_cache(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Json(payload): Json<PurgeRequest>,
) -> Result<Json<ApiResponse<u64>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    let removed = if payload.expired_only {
        state.cache.purge_expired(&tenant.id, payload.pool_id.as_deref()).await?
    } else {
        state.cache.purge_all(&tenant.id, payload.pool_id.as_deref()).await?
    };
    Ok(Json(ApiResponse::success(removed)))
}

// ---------------------------------------------------------------------
// Lineage and audit
// ---------------------------------------------------------------------

pub async fn lineage_for_tenant(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<PageParams>,
) -> Result<Json<PaginatedResponse<LineageEvent>>, ApiError> {
    let events = state.lineage.for_tenant(&tenant.id, params.page, params.limit).await?;
    Ok(Json(PaginatedResponse::new(events, params.page, params.limit)))
}

pub async fn lineage_for_entry(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path(entry_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<PaginatedResponse<LineageEvent>>, ApiError> {
    let events = state.lineage.for_entry(&tenant.id, &entry_id, params.page, params.limit).await?;
    Ok(Json(PaginatedResponse::new(events, params.page, params.limit)))
}

pub async fn audit_log(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<PageParams>,
) -> Result<Json<PaginatedResponse<LineageEvent>>, ApiError> {
    require_role(&tenant, Role::Admin)?;
    let events = state.lineage.audit_for_tenant(&tenant.id, params.page, params.limit).await?;
    Ok(Json(PaginatedResponse::new(events, params.page, params.limit)))
}

// ---------------------------------------------------------------------
// Metrics (SPEC_FULL.md §B "Metrics endpoint")
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakerMetrics {
    pub source_id: String,
    pub source_name: String,
    pub state: &'static str,
    pub failure_count: u64,
    pub success_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub cache: crate::cache::CacheMetrics,
    pub breakers: Vec<SourceBreakerMetrics>,
}

/// `GET /management/metrics`. JSON, not Prometheus text exposition — this is
/// an admin-facing snapshot, not a scrape target (SPEC_FULL.md §B).
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<ApiResponse<MetricsResponse>>, ApiError> {
    let cache = state.cache.metrics(&tenant.id).await?;
    let sources = state.sources.list_active(&tenant.id).await?;

    let breakers = sources
        .iter()
        .filter_map(|source| {
            state.breakers.stats(&source.id).map(|stats| SourceBreakerMetrics {
                source_id: source.id.clone(),
                source_name: source.name.clone(),
                state: match stats.state {
                    crate::breaker::CircuitState::Closed => "closed",
                    crate::breaker::CircuitState::Open => "open",
                    crate::breaker::CircuitState::HalfOpen => "half_open",
                },
                failure_count: stats.failures as u64,
                success_count: stats.requests as u64,
            })
        })
        .collect();

    Ok(Json(ApiResponse::success(MetricsResponse { cache, breakers })))
}

// ---------------------------------------------------------------------
// Health / readiness (spec.md §6: unauthenticated probes)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
}

pub async fn healthz() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

pub async fn readyz(State(state): State<Arc<AppState>>) -> Result<Json<HealthStatus>, ApiError> {
    sqlx::query("SELECT 1").execute(&state.db).await.map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(HealthStatus { status: "ready" }))
}
