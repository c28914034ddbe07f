//! Response envelope and error taxonomy for the HTTP surface (spec.md §6,
//! §7 "Error Handling Design").
//!
//! Narrowed from the teacher's `api::responses` (which also carries HAL,
//! JSON:API, and RFC 7807 variants this system has no use for) down to the
//! one envelope shape spec.md §6 actually describes: `{data, success,
//! message, timestamp}` on success, `{error, message, requestId}` on
//! failure. Every subsystem error converts into [`ApiError`] at this one
//! seam so handlers never match on a collaborator's error type directly.

use std::collections::HashMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerError;
use crate::cache::CacheError;
use crate::compliance::ComplianceError;
use crate::dispatcher::DispatchError;
use crate::distributed::DistributedError;
use crate::lineage::LineageError;
use crate::mock::MockError;
use crate::policy::PolicyError;
use crate::pool::PoolError;
use crate::ratelimit::RateLimitError;
use crate::source::SourceError;
use crate::tenant::TenantError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self { data: Some(data), success: true, message: None, timestamp: Utc::now() }
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self { data: Some(data), success: true, message: Some(message.into()), timestamp: Utc::now() }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// A page of results plus the pagination bookkeeping the management list
/// endpoints expose (spec.md §6 "Management surface" — list endpoints are
/// paginated).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, page: u32, limit: u32) -> Self {
        Self { data, page, limit, success: true, timestamp: Utc::now() }
    }
}

impl<T> IntoResponse for PaginatedResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// The HTTP error taxonomy from spec.md §7: one variant per status code
/// class, each subsystem error folded in via `From`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip)]
    pub status: u16,
}

impl ApiError {
    fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self { error: error.to_string(), message: message.into(), request_id: None, status: status.as_u16() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            format!("rate limit exceeded, retry after {retry_after_seconds}s"),
        )
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "upstream_unreachable", message)
    }

    pub fn upstream_challenge(provider: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "upstream_challenge", format!("challenge from {}", provider.into()))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(msg) => ApiError::bad_request(msg),
            DispatchError::NoActiveSources => ApiError::not_found("no active sources for this request"),
            DispatchError::BadGateway(msg) => ApiError::bad_gateway(msg),
            DispatchError::UpstreamChallenge { provider, .. } => ApiError::upstream_challenge(provider),
            DispatchError::Source(e) => e.into(),
            DispatchError::Cache(e) => e.into(),
            DispatchError::Policy(e) => e.into(),
            DispatchError::Mock(e) => e.into(),
        }
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound => ApiError::not_found("source not found"),
            SourceError::DemoLimitExceeded(cap) => {
                ApiError::forbidden(format!("demo limit exceeded: at most {cap} sources per tenant"))
            }
            SourceError::SharedRequiresPool => ApiError::bad_request("a shared-storage source must have a pool id"),
            SourceError::Crypto(msg) => ApiError::internal(msg),
            SourceError::Db(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Db(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Db(e) => ApiError::internal(e.to_string()),
            PolicyError::Compliance(e) => e.into(),
        }
    }
}

impl From<ComplianceError> for ApiError {
    fn from(err: ComplianceError) -> Self {
        match err {
            ComplianceError::Db(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<MockError> for ApiError {
    fn from(err: MockError) -> Self {
        match err {
            MockError::Db(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NotFound => ApiError::not_found("storage pool not found"),
            PoolError::Db(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<LineageError> for ApiError {
    fn from(err: LineageError) -> Self {
        match err {
            LineageError::Db(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<TenantError> for ApiError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::InvalidApiKey => ApiError::unauthorized("invalid or unknown API key"),
            TenantError::InsufficientRole { required, actual } => {
                ApiError::forbidden(format!("role {required:?} required, tenant has {actual:?}"))
            }
            TenantError::Db(e) => ApiError::internal(e.to_string()),
            TenantError::Hash(msg) => ApiError::internal(msg),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Db(e) => ApiError::internal(e.to_string()),
            RateLimitError::Store(e) => e.into(),
        }
    }
}

impl From<DistributedError> for ApiError {
    fn from(err: DistributedError) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<BreakerError> for ApiError {
    fn from(_: BreakerError) -> Self {
        ApiError::bad_gateway("source circuit open")
    }
}

/// Extra response headers the pool/bucket collaborators compute for the
/// caller (rate-limit counters, cache status) — folded into the response by
/// the handler, not by this module, since they're per-endpoint.
pub type ExtraHeaders = HashMap<String, String>;
