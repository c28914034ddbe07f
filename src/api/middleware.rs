//! HTTP middleware: request id, tenant auth, rate limiting, logging, CORS,
//! security headers (spec.md §6 "Tenant authentication", §4.4, §7).
//!
//! Grounded on the teacher's `api::middleware` layer-by-layer shape
//! (`from_fn`/`from_fn_with_state` functions plus a `cors_layer()` builder),
//! narrowed to this system's own auth source (`TenantDirectory::resolve_api_key`,
//! not JWT) and its own identifier precedence for rate limiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::tenant::Tenant;

use super::responses::ApiError;
use super::state::AppState;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Paths that never require a tenant API key or count against rate limits
/// (spec.md §6: health/readiness probes are unauthenticated).
const EXCLUDED_PATHS: &[&str] = &["/healthz", "/readyz"];

fn is_excluded(path: &str) -> bool {
    EXCLUDED_PATHS.iter().any(|p| path == *p)
}

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(request_id.clone());
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Resolve `X-API-Key` or `Authorization: Bearer <key>` to a [`Tenant`] and
/// stash it in request extensions (spec.md §6). Handlers that need write
/// access separately call [`crate::tenant::TenantDirectory::require_role`].
pub async fn tenant_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if is_excluded(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let presented = extract_api_key(&request).ok_or_else(|| ApiError::unauthorized("missing API key"))?;
    let tenant = state.tenants.resolve_api_key(&presented).await?;

    request.extensions_mut().insert(presented);
    request.extensions_mut().insert(tenant);

    Ok(next.run(request).await)
}

fn extract_api_key(request: &Request) -> Option<String> {
    if let Some(key) = request.headers().get("X-API-Key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Identifier precedence for partitioning a rate-limit window: the
/// presented key (bearer/API key are the same header at this point) first,
/// falling back to the client's forwarded IP, then a fixed default so an
/// unauthenticated caller on an excluded path still gets one shared window
/// rather than panicking for lack of an identifier (spec.md §4.4).
fn rate_limit_identifier(request: &Request) -> String {
    if let Some(key) = request.extensions().get::<String>() {
        return key.clone();
    }
    if let Some(ip) = request.headers().get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        return ip.to_string();
    }
    "default".to_string()
}

/// Enforce the rate limit rule governing this tenant (and, when the path
/// names one, this source). Fails open on a backing-store error rather than
/// blocking every request behind a degraded limiter (spec.md §7).
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if is_excluded(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let Some(tenant) = request.extensions().get::<Tenant>().cloned() else {
        return Ok(next.run(request).await);
    };
    let identifier = rate_limit_identifier(&request);
    let source_id = source_id_from_path(request.uri().path());

    match state.rate_limiter.check(&tenant.id, source_id.as_deref(), &identifier).await {
        Ok(decision) if !decision.allowed => {
            return Err(ApiError::rate_limited(decision.reset_seconds));
        }
        Ok(decision) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
                headers.insert("X-RateLimit-Limit", v);
            }
            if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
                headers.insert("X-RateLimit-Remaining", v);
            }
            if let Ok(v) = HeaderValue::from_str(&decision.reset_seconds.to_string()) {
                headers.insert("X-RateLimit-Reset", v);
            }
            return Ok(response);
        }
        Err(err) => {
            tracing::warn!(%err, "rate limit check failed, failing open");
            Ok(next.run(request).await)
        }
    }
}

/// `/proxy/{canonical_name}/...` paths carry a source name the rate limiter
/// can scope to; every other path rate-limits tenant-wide.
fn source_id_from_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/proxy/")?;
    rest.split('/').next().map(str::to_string)
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let duration = start.elapsed();
    tracing::info!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        duration_ms = duration.as_millis() as u64,
        "request completed"
    );

    let mut response = response;
    if let Ok(v) = HeaderValue::from_str(&duration.as_millis().to_string()) {
        response.headers_mut().insert("X-Response-Time", v);
    }
    response
}

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    response
}

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderValue::from_static("x-api-key"),
            HeaderValue::from_static("x-request-id"),
            HeaderValue::from_static("x-cache-refresh"),
            HeaderValue::from_static("x-cache-ttl"),
        ])
        .expose_headers([
            HeaderValue::from_static("x-request-id"),
            HeaderValue::from_static("x-cache"),
            HeaderValue::from_static("x-cache-key"),
            HeaderValue::from_static("x-cache-hits"),
            HeaderValue::from_static("x-cache-expires"),
            HeaderValue::from_static("x-source"),
            HeaderValue::from_static("x-ratelimit-limit"),
            HeaderValue::from_static("x-ratelimit-remaining"),
            HeaderValue::from_static("x-ratelimit-reset"),
        ])
        .max_age(Duration::from_secs(3600))
}

/// Require at least `required` role on the tenant stored in extensions by
/// [`tenant_auth_middleware`]. Used inline by management write handlers
/// rather than as a layer, since the required role varies per-route.
pub fn require_role(tenant: &Tenant, required: crate::tenant::Role) -> Result<(), ApiError> {
    crate::tenant::TenantDirectory::require_role(tenant, required).map_err(Into::into)
}
