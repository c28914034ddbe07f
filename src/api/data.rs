//! Programmatic cache API: `POST /data` (spec.md §6 "Data API").
//!
//! Unlike the proxy front door, the caller names the upstream URL directly
//! and gets the response wrapped in the standard envelope instead of being
//! handed the raw upstream body.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::State, Extension, Json};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatcher::{DispatchRequest, Target};
use crate::tenant::Tenant;

use super::responses::{ApiError, ApiResponse};
use super::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub ttl: Option<i64>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Base64-encoded; the body may not be valid UTF-8.
    pub body: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataResult {
    pub cached: bool,
    pub cache_key: String,
    pub source_name: String,
    pub hit_count: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub response: UpstreamResponse,
}

pub async fn fetch_data(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<Tenant>,
    Json(payload): Json<DataRequest>,
) -> Result<Json<ApiResponse<DataResult>>, ApiError> {
    let request = DispatchRequest {
        tenant_id: tenant.id,
        target: Target::ByUrl { url: payload.url },
        method: payload.method,
        body: payload.body,
        headers: payload.headers.into_iter().collect(),
        force_refresh: payload.force_refresh,
        ttl_override: payload.ttl,
        request_region: None,
        pii_detected: false,
        tenant_kill_switch: tenant.kill_switch,
    };

    let response = state.dispatcher.dispatch(request).await?;

    let result = DataResult {
        cached: response.meta.cache_status == "HIT",
        cache_key: response.meta.cache_key,
        source_name: response.meta.source_name,
        hit_count: response.meta.hit_count,
        expires_at: response.meta.expires_at,
        response: UpstreamResponse {
            status: response.status,
            headers: response.headers,
            body: STANDARD.encode(&response.body),
            content_type: response.content_type,
        },
    };

    Ok(Json(ApiResponse::success(result)))
}
