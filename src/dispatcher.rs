//! Dispatcher (spec.md §4.7): validate -> resolve sources -> kill-switch ->
//! derive key -> cache lookup -> (MISS) iterate candidates through breakers
//! -> policy -> store -> return.
//!
//! This is the orchestration seam the rest of the crate exists to serve;
//! grounded on the teacher's `api::gateway` request-pipeline shape (a single
//! struct holding handles to every collaborator subsystem, one public entry
//! point per externally-triggered action) but built against this system's
//! own collaborators instead.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use thiserror::Error;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::cache::{CacheStore, NewCacheEntry};
use crate::key::{self, StorageMode};
use crate::lineage::{EventType, LineageRecorder};
use crate::mock::MockCatalog;
use crate::policy::PolicyEngine;
use crate::source::{Source, SourceRegistry};

const MAX_URL_LEN: usize = 2048;
/// Well-known ports that have no business fronting an HTTP(S) upstream
/// (spec.md §4.7 step 1). 80/443 are exempted even though they appear on
/// some of these lists elsewhere.
const DANGEROUS_PORTS: &[u16] = &[20, 21, 22, 23, 25, 53, 110, 135, 139, 143, 445, 1433, 1521, 3306, 3389, 5432, 5900, 6379, 9200, 11211, 27017];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid request URL: {0}")]
    Validation(String),
    #[error("no active sources configured")]
    NoActiveSources,
    #[error("upstream unreachable: {0}")]
    BadGateway(String),
    #[error("upstream challenge from {provider} (bypass_bot_detection={bypass_enabled})")]
    UpstreamChallenge { provider: String, bypass_enabled: bool },
    #[error(transparent)]
    Source(#[from] crate::source::SourceError),
    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),
    #[error(transparent)]
    Policy(#[from] crate::policy::PolicyError),
    #[error(transparent)]
    Mock(#[from] crate::mock::MockError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Clone)]
pub enum Target {
    /// Proxy front door: `/proxy/{canonical_name}/{path}`.
    BySourceName { canonical_name: String, path: String },
    /// Programmatic cache API: an explicit absolute URL, matched against
    /// active sources by host (spec.md §4.2 selection step 1).
    ByUrl { url: String },
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub tenant_id: String,
    pub target: Target,
    pub method: String,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub force_refresh: bool,
    pub ttl_override: Option<i64>,
    pub request_region: Option<String>,
    pub pii_detected: bool,
    pub tenant_kill_switch: bool,
}

#[derive(Debug, Clone)]
pub struct CacheMeta {
    pub cache_status: &'static str,
    pub cache_key: String,
    pub source_id: String,
    pub source_name: String,
    pub hit_count: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub mock: bool,
    pub compliance_blocked: bool,
}

pub struct DispatchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub meta: CacheMeta,
}

/// spec.md §4.7 step 1: reject non-http(s), private/loopback/link-local
/// hosts, and dangerous ports (80/443 exempted). Limits length to 2048.
pub fn validate_url(raw: &str) -> DispatchResult<url::Url> {
    if raw.len() > MAX_URL_LEN {
        return Err(DispatchError::Validation(format!("url exceeds {MAX_URL_LEN} characters")));
    }
    let url = url::Url::parse(raw).map_err(|e| DispatchError::Validation(e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(DispatchError::Validation("only http(s) URLs are allowed".to_string()));
    }

    let host = url.host_str().ok_or_else(|| DispatchError::Validation("url has no host".to_string()))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Err(DispatchError::Validation("loopback host is not allowed".to_string()));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_disallowed_ip(ip) {
            return Err(DispatchError::Validation(format!("{ip} is a private/loopback/link-local address")));
        }
    }

    if let Some(port) = url.port() {
        let exempt = matches!(url.scheme(), "http" | "https") && (port == 80 || port == 443);
        if !exempt && DANGEROUS_PORTS.contains(&port) {
            return Err(DispatchError::Validation(format!("port {port} is not allowed")));
        }
    }

    Ok(url)
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_disallowed_ip(IpAddr::V4(v4));
            }
            let segments = v6.segments();
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            is_link_local || is_unique_local
        }
    }
}

/// `(provider, pattern, message)` catalog for upstream challenge pages
/// (spec.md §4.7 step 7, §9 "Challenge detection is string-matching").
static CHALLENGE_CATALOG: Lazy<Vec<(&'static str, Regex, &'static str)>> = Lazy::new(|| {
    vec![
        ("cloudflare", Regex::new(r"(?i)cf-browser-verification|Attention Required! \| Cloudflare|cf-chl-bypass").unwrap(), "Cloudflare challenge page"),
        ("aws_waf", Regex::new(r"(?i)awswaf|aws-waf-token").unwrap(), "AWS WAF challenge"),
        ("akamai", Regex::new(r"(?i)akamai.*(bot|reference #)").unwrap(), "Akamai bot-manager challenge"),
        ("imperva", Regex::new(r"(?i)incapsula|imperva").unwrap(), "Imperva/Incapsula challenge"),
        ("sucuri", Regex::new(r"(?i)sucuri.?(cloudproxy|website firewall)").unwrap(), "Sucuri firewall challenge"),
    ]
});

fn detect_challenge(content_type: Option<&str>, body: &[u8]) -> Option<(&'static str, &'static str)> {
    let looks_like_html = content_type.map(|c| c.contains("text/html")).unwrap_or(false);
    let text = String::from_utf8_lossy(body);
    for (provider, pattern, message) in CHALLENGE_CATALOG.iter() {
        if pattern.is_match(&text) {
            return Some((provider, message));
        }
    }
    // Generic: an HTML document answering what should be a JSON endpoint.
    if looks_like_html && text.trim_start().starts_with("<!DOCTYPE html") {
        return Some(("generic", "HTML challenge page on a JSON endpoint"));
    }
    None
}

const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailer", "transfer-encoding", "upgrade"];

/// Join a source's base URL with a proxied path the way a reverse proxy
/// normalizes it: exactly one `/` between them.
fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    sources: SourceRegistry,
    cache: CacheStore,
    breakers: BreakerRegistry,
    policy: PolicyEngine,
    mocks: MockCatalog,
    lineage: LineageRecorder,
    http: Client,
    round_robin: DashMap<String, Arc<AtomicU64>>,
}

impl Dispatcher {
    pub fn new(
        sources: SourceRegistry,
        cache: CacheStore,
        breakers: BreakerRegistry,
        policy: PolicyEngine,
        mocks: MockCatalog,
        lineage: LineageRecorder,
    ) -> Self {
        Self {
            sources,
            cache,
            breakers,
            policy,
            mocks,
            lineage,
            http: Client::new(),
            round_robin: DashMap::new(),
        }
    }

    async fn candidates(&self, tenant_id: &str, target: &Target) -> DispatchResult<(Vec<Source>, String, String)> {
        match target {
            Target::BySourceName { canonical_name, path } => {
                let siblings = self.sources.resolve_by_name(tenant_id, canonical_name).await?;
                if siblings.is_empty() {
                    return Err(DispatchError::NoActiveSources);
                }
                let url = join_url(&siblings[0].base_url, path);
                Ok((siblings, url, canonical_name.clone()))
            }
            Target::ByUrl { url } => {
                let active = self.sources.list_active(tenant_id).await?;
                if active.is_empty() {
                    return Err(DispatchError::NoActiveSources);
                }
                Ok((active, url.clone(), String::new()))
            }
        }
    }

    /// spec.md §4.2 selection step 1: a host match wins regardless of
    /// priority; otherwise ascending priority (already the registry's
    /// ordering) with stable ties.
    fn reorder_by_host_match(candidates: Vec<Source>, request_url: &url::Url) -> Vec<Source> {
        let request_host = request_url.host_str().map(str::to_string);
        let Some(request_host) = request_host else {
            return candidates;
        };
        let mut matched = Vec::new();
        let mut rest = Vec::new();
        for source in candidates {
            let source_host = url::Url::parse(&source.base_url).ok().and_then(|u| u.host_str().map(str::to_string));
            if source_host.as_deref() == Some(request_host.as_str()) {
                matched.push(source);
            } else {
                rest.push(source);
            }
        }
        matched.extend(rest);
        matched
    }

    fn next_round_robin(&self, tenant_id: &str, canonical_name: &str, len: usize) -> usize {
        let key = format!("{tenant_id}:{canonical_name}");
        let counter = self.round_robin.entry(key).or_insert_with(|| Arc::new(AtomicU64::new(0)));
        (counter.fetch_add(1, Ordering::SeqCst) as usize) % len.max(1)
    }

    /// Kick off a forced-refresh re-dispatch in the background and discard
    /// the result; used by the proxy front door when it hands a stale HIT
    /// back to the caller (spec.md §4.8 "the caller gets the stale entry
    /// immediately, revalidation happens out of band"). Only GET requests
    /// are safe to replay, matching the revalidator sweep's own rule.
    pub fn spawn_stale_revalidation(&self, request: DispatchRequest) {
        if !request.method.eq_ignore_ascii_case("GET") {
            return;
        }
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(err) = dispatcher.dispatch(request).await {
                tracing::debug!(%err, "background stale revalidation failed");
            }
        });
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchResult<DispatchResponse> {
        let (candidates, target_url, canonical_name) = self.candidates(&request.tenant_id, &request.target).await?;
        let parsed_url = validate_url(&target_url)?;
        let candidates = Self::reorder_by_host_match(candidates, &parsed_url);
        let primary = &candidates[0];

        let bypass = request.tenant_kill_switch || primary.kill_switch;

        let headers_kv: Vec<(String, String)> = request
            .headers
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.to_lowercase().as_str()))
            .cloned()
            .collect();

        let cache_key = key::derive(
            &request.method,
            parsed_url.as_str(),
            request.body.as_deref(),
            &headers_kv,
            Some(&primary.id),
            &primary.vary_headers,
            primary.storage_mode,
        );

        if !request.force_refresh && !bypass {
            if let Some(entry) = self
                .cache
                .get(&request.tenant_id, &cache_key, &primary.id, primary.storage_mode, primary.pool_id.as_deref())
                .await?
            {
                let stale = entry.expires_at.map(|e| e <= Utc::now()).unwrap_or(false);
                return Ok(DispatchResponse {
                    status: entry.response_status as u16,
                    headers: entry.response_headers.clone(),
                    body: entry.response_body.clone(),
                    content_type: entry.content_type.clone(),
                    meta: CacheMeta {
                        cache_status: "HIT",
                        cache_key,
                        source_id: entry.source_id.clone(),
                        source_name: primary.name.clone(),
                        hit_count: entry.hit_count,
                        expires_at: entry.expires_at,
                        stale,
                        mock: false,
                        compliance_blocked: false,
                    },
                });
            }
        }

        let round_robin = primary.round_robin;
        let ordered: Vec<&Source> = if round_robin {
            let idx = self.next_round_robin(&request.tenant_id, &canonical_name, candidates.len());
            vec![&candidates[idx]]
        } else {
            candidates.iter().collect()
        };

        let mut last_error: Option<String> = None;
        for (attempt, source) in ordered.iter().enumerate() {
            let breaker = self.breakers.get_or_create(
                &source.id,
                BreakerConfig {
                    failure_threshold: source.breaker_failure_threshold as u32,
                    volume_threshold: source.breaker_volume_threshold as u32,
                    ..BreakerConfig::default()
                },
            );

            if breaker.is_allowed().is_err() {
                tracing::warn!(source_id = %source.id, "breaker open, skipping source");
                last_error = Some(format!("source {} circuit open", source.name));
                continue;
            }

            let upstream_url = match &request.target {
                Target::BySourceName { path, .. } => join_url(&source.base_url, path),
                Target::ByUrl { url } => url.clone(),
            };

            match self.try_source(&request, source, &upstream_url, &headers_kv, false).await {
                Ok(upstream) => {
                    if upstream.status == 404 && !round_robin {
                        breaker.record_failure();
                        tracing::info!(source_id = %source.id, "404 in priority mode, advancing to next candidate");
                        last_error = Some("404 from upstream".to_string());
                        continue;
                    }

                    breaker.record_success();
                    return self.finish(&request, source, &cache_key, &upstream_url, upstream).await;
                }
                Err(DispatchError::UpstreamChallenge { provider, bypass_enabled }) => {
                    if bypass_enabled && attempt == 0 {
                        if let Ok(retried) = self.try_source(&request, source, &upstream_url, &headers_kv, true).await {
                            breaker.record_success();
                            return self.finish(&request, source, &cache_key, &upstream_url, retried).await;
                        }
                    }
                    breaker.record_failure();
                    last_error = Some(format!("challenge from {provider}"));
                    if !round_robin {
                        continue;
                    }
                    break;
                }
                Err(err) => {
                    breaker.record_failure();
                    last_error = Some(err.to_string());
                    if !round_robin {
                        continue;
                    }
                    break;
                }
            }
        }

        if primary.fallback_mode == crate::source::FallbackMode::Mock {
            if let Ok(Some(mock)) = self
                .mocks
                .find_match(&request.tenant_id, &primary.id, &request.method, parsed_url.as_str(), request.body.as_deref())
                .await
            {
                let headers: HashMap<String, String> = serde_json::from_str(&mock.headers_json).unwrap_or_default();
                return Ok(DispatchResponse {
                    status: mock.status as u16,
                    headers,
                    content_type: Some("application/json".to_string()),
                    body: mock.body,
                    meta: CacheMeta {
                        cache_status: "MISS",
                        cache_key,
                        source_id: primary.id.clone(),
                        source_name: primary.name.clone(),
                        hit_count: 0,
                        expires_at: None,
                        stale: false,
                        mock: true,
                        compliance_blocked: false,
                    },
                });
            }
        }

        Err(DispatchError::BadGateway(
            last_error.unwrap_or_else(|| "all candidate sources failed".to_string()),
        ))
    }

    async fn try_source(
        &self,
        request: &DispatchRequest,
        source: &Source,
        url: &str,
        headers_kv: &[(String, String)],
        browser_impersonation: bool,
    ) -> DispatchResult<UpstreamResponse> {
        let auth = self.sources.load_with_auth(&request.tenant_id, &source.id).await?;

        let mut builder = self
            .http
            .request(
                request.method.parse().unwrap_or(reqwest::Method::GET),
                url,
            )
            .timeout(Duration::from_millis(source.timeout_ms.max(0) as u64));

        for (name, value) in headers_kv {
            builder = builder.header(name, value);
        }
        for (name, value) in &auth.custom_headers {
            builder = builder.header(name, value);
        }
        match auth.kind {
            crate::source::AuthKind::Bearer => {
                if let Some(token) = &auth.credentials {
                    builder = builder.bearer_auth(token);
                }
            }
            crate::source::AuthKind::ApiKey => {
                if let Some(key) = &auth.credentials {
                    builder = builder.header("X-API-Key", key);
                }
            }
            crate::source::AuthKind::Basic => {
                if let Some(creds) = &auth.credentials {
                    if let Some((user, pass)) = creds.split_once(':') {
                        builder = builder.basic_auth(user, Some(pass));
                    }
                }
            }
            crate::source::AuthKind::None => {}
        }

        if (source.bypass_bot_detection && browser_impersonation) || browser_impersonation {
            builder = builder
                .header("User-Agent", "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
                .header("Accept-Language", "en-US,en;q=0.9");
        }

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DispatchError::BadGateway(e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(|e| DispatchError::BadGateway(e.to_string()))?.to_vec();

        if let Some((provider, message)) = detect_challenge(content_type.as_deref(), &body) {
            tracing::warn!(provider, message, "upstream challenge detected");
            return Err(DispatchError::UpstreamChallenge {
                provider: provider.to_string(),
                bypass_enabled: source.bypass_bot_detection,
            });
        }

        Ok(UpstreamResponse { status, headers, content_type, body })
    }

    async fn finish(
        &self,
        request: &DispatchRequest,
        source: &Source,
        cache_key: &str,
        dispatched_url: &str,
        upstream: UpstreamResponse,
    ) -> DispatchResult<DispatchResponse> {
        if upstream.status >= 400 && upstream.status != 404 {
            return Ok(DispatchResponse {
                status: upstream.status,
                headers: upstream.headers,
                body: upstream.body,
                content_type: upstream.content_type,
                meta: CacheMeta {
                    cache_status: "MISS",
                    cache_key: cache_key.to_string(),
                    source_id: source.id.clone(),
                    source_name: source.name.clone(),
                    hit_count: 0,
                    expires_at: None,
                    stale: false,
                    mock: false,
                    compliance_blocked: false,
                },
            });
        }

        let requested_ttl = request.ttl_override.unwrap_or(0);
        let decision = self
            .policy
            .evaluate(
                &request.tenant_id,
                &source.id,
                request.tenant_kill_switch,
                source.kill_switch,
                requested_ttl,
                request.request_region.as_deref(),
                request.pii_detected,
                &request.method,
                dispatched_url,
                upstream.status,
            )
            .await?;

        if !decision.store {
            if decision.compliance_denial.is_some() {
                let _ = self
                    .lineage
                    .record(
                        &request.tenant_id,
                        None,
                        EventType::PolicyChanged,
                        None,
                        Some(&source.id),
                        Some("compliance_blocked"),
                        serde_json::json!({ "key": cache_key }),
                    )
                    .await;
            }
            return Ok(DispatchResponse {
                status: upstream.status,
                headers: upstream.headers,
                body: upstream.body,
                content_type: upstream.content_type,
                meta: CacheMeta {
                    cache_status: "MISS",
                    cache_key: cache_key.to_string(),
                    source_id: source.id.clone(),
                    source_name: source.name.clone(),
                    hit_count: 0,
                    expires_at: None,
                    stale: false,
                    mock: false,
                    compliance_blocked: decision.compliance_denial.is_some(),
                },
            });
        }

        let body_fingerprint = key::body_fingerprint(request.body.as_deref());
        let entry = self
            .cache
            .put(
                NewCacheEntry {
                    tenant_id: request.tenant_id.clone(),
                    source_id: source.id.clone(),
                    // A dedicated source may still carry a pool id for grouping
                    // (spec.md §3), but cache isolation is by source id, not pool
                    // id — never persist it onto the entry for that mode (spec.md
                    // §9's "cyclic storage-mode ambiguity" note).
                    pool_id: match source.storage_mode {
                        StorageMode::Dedicated => None,
                        StorageMode::Shared => source.pool_id.clone(),
                    },
                    cache_key: cache_key.to_string(),
                    request_method: request.method.clone(),
                    request_url: dispatched_url.to_string(),
                    body_fingerprint,
                    response_status: upstream.status as i64,
                    response_headers: upstream.headers.clone(),
                    response_body: upstream.body.clone(),
                    content_type: upstream.content_type.clone(),
                    ttl_seconds: decision.effective_ttl_seconds,
                    tags: Vec::new(),
                },
                source.storage_mode,
            )
            .await?;

        Ok(DispatchResponse {
            status: upstream.status,
            headers: upstream.headers,
            body: upstream.body,
            content_type: upstream.content_type,
            meta: CacheMeta {
                cache_status: "MISS",
                cache_key: cache_key.to_string(),
                source_id: source.id.clone(),
                source_name: source.name.clone(),
                hit_count: entry.hit_count,
                expires_at: entry.expires_at,
                stale: false,
                mock: false,
                compliance_blocked: false,
            },
        })
    }
}

struct UpstreamResponse {
    status: u16,
    headers: HashMap<String, String>,
    content_type: Option<String>,
    body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_scheme() {
        assert!(validate_url("ftp://example.com/file").is_err());
    }

    #[test]
    fn rejects_loopback() {
        assert!(validate_url("http://127.0.0.1/admin").is_err());
        assert!(validate_url("http://localhost/admin").is_err());
    }

    #[test]
    fn rejects_private_ipv4() {
        assert!(validate_url("http://10.0.0.5/internal").is_err());
        assert!(validate_url("http://192.168.1.1/internal").is_err());
    }

    #[test]
    fn rejects_link_local_ipv6() {
        assert!(validate_url("http://[fe80::1]/internal").is_err());
    }

    #[test]
    fn rejects_dangerous_port() {
        assert!(validate_url("http://example.com:6379/").is_err());
    }

    #[test]
    fn exempts_standard_ports() {
        assert!(validate_url("https://example.com:443/items").is_ok());
        assert!(validate_url("http://example.com/items").is_ok());
    }

    #[test]
    fn rejects_overlong_url() {
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LEN));
        assert!(validate_url(&long).is_err());
    }

    #[test]
    fn detects_cloudflare_challenge() {
        let body = b"<html>Attention Required! | Cloudflare</html>";
        assert_eq!(detect_challenge(Some("text/html"), body).map(|(p, _)| p), Some("cloudflare"));
    }

    #[test]
    fn join_url_collapses_slashes() {
        assert_eq!(join_url("https://api.example.com/", "/items/9"), "https://api.example.com/items/9");
        assert_eq!(join_url("https://api.example.com", "items/9"), "https://api.example.com/items/9");
    }
}
