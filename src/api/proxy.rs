//! Proxy front door: `ANY /proxy/{canonical_name}/{path...}` (spec.md §6).
//!
//! Grounded on the dispatcher's own `Target::BySourceName` path; this
//! handler's job is purely HTTP-shape translation — pull the caller's
//! method/headers/body into a [`DispatchRequest`], translate the response
//! back into headers the spec names (`X-Cache`, `X-Cache-Key`, ...).

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};

use crate::dispatcher::{DispatchRequest, Target};
use crate::tenant::Tenant;

use super::responses::ApiError;
use super::state::AppState;

const FORWARD_EXCLUDED: &[&str] = &["host", "x-api-key", "authorization", "content-length", "x-cache-refresh", "x-cache-ttl"];

fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_lowercase();
            if FORWARD_EXCLUDED.contains(&name.as_str()) {
                return None;
            }
            value.to_str().ok().map(|v| (name, v.to_string()))
        })
        .collect()
}

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Path((canonical_name, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let force_refresh = headers
        .get("X-Cache-Refresh")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let ttl_override = headers
        .get("X-Cache-TTL")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    let request_region = headers.get("X-Request-Region").and_then(|v| v.to_str().ok()).map(str::to_string);
    let pii_detected = headers
        .get("X-Contains-PII")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let body = if body.is_empty() { None } else { Some(String::from_utf8_lossy(&body).into_owned()) };

    let target = Target::BySourceName { canonical_name, path };
    let request = DispatchRequest {
        tenant_id: tenant.id.clone(),
        target: target.clone(),
        method: method.as_str().to_string(),
        body,
        headers: forwardable_headers(&headers),
        force_refresh,
        ttl_override,
        request_region,
        pii_detected,
        tenant_kill_switch: tenant.kill_switch,
    };

    let response = state.dispatcher.dispatch(request).await?;

    if response.meta.stale {
        state.dispatcher.spawn_stale_revalidation(DispatchRequest {
            tenant_id: tenant.id,
            target,
            method: "GET".to_string(),
            body: None,
            headers: Vec::new(),
            force_refresh: true,
            ttl_override: None,
            request_region: None,
            pii_detected: false,
            tenant_kill_switch: false,
        });
    }

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder
        .header("X-Cache", response.meta.cache_status)
        .header("X-Cache-Key", &response.meta.cache_key)
        .header("X-Cache-Hits", response.meta.hit_count.to_string())
        .header("X-Source", &response.meta.source_name);
    if let Some(content_type) = &response.content_type {
        builder = builder.header("Content-Type", content_type.as_str());
    }
    if let Some(expires_at) = response.meta.expires_at {
        builder = builder.header("X-Cache-Expires", expires_at.to_rfc3339());
    }

    builder
        .body(axum::body::Body::from(response.body))
        .map(IntoResponse::into_response)
        .map_err(|e| ApiError::internal(e.to_string()))
}
