//! Cache key derivation (spec.md §4.1).
//!
//! Produces a stable 256-bit hex digest over a canonical JSON projection of
//! the request. Grounded on the teacher's hashing conventions in
//! `enterprise::ratelimit::distributed` (`sha2`/deterministic hashing for
//! sharding keys), generalized here to the full normalize-then-hash pipeline
//! the cache key needs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Dedicated,
    Shared,
}

/// Canonical projection that gets hashed. Field order here is irrelevant to
/// the result (it's re-serialized through `serde_json::to_value` and the
/// map keys inside are plain strings), but the *content* must be identical
/// for any two logically-equivalent requests.
#[derive(Debug, Serialize)]
struct CanonicalRequest {
    method: String,
    url: String,
    body: Option<serde_json::Value>,
    headers: Option<BTreeMap<String, String>>,
    source_id: Option<String>,
}

/// Normalize a URL: sort query params lexicographically by name (stable for
/// duplicate names), collapse a trailing slash on a non-root path. Leaves
/// case untouched ("lowercase nothing" per spec.md §4.1).
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        let mut sorted = pairs;
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = url.clone();
        out.query_pairs_mut().clear();
        for (k, v) in &sorted {
            out.query_pairs_mut().append_pair(k, v);
        }
        url = out;
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    url.to_string()
}

/// Re-serialize a JSON-parseable body in canonical form (sorted object keys
/// via `BTreeMap`'s `Serialize` impl falling out of `serde_json::Value`'s own
/// map ordering once round-tripped through `serde_json::to_value`); fall back
/// to the raw string, then to `None` for an empty body.
pub fn normalize_body(body: Option<&str>) -> Option<serde_json::Value> {
    let body = body?;
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => Some(canonicalize_json(value)),
        Err(_) => Some(serde_json::Value::String(body.to_string())),
    }
}

fn canonicalize_json(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize_json(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(canonicalize_json).collect())
        }
        other => other,
    }
}

/// Body fingerprint kept separately for audit purposes (spec.md §4.1):
/// a hash of the normalized body, nullable when there is no body.
pub fn body_fingerprint(body: Option<&str>) -> Option<String> {
    let normalized = normalize_body(body)?;
    let canonical = serde_json::to_string(&normalized).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

/// Derive the 256-bit hex cache key digest.
///
/// `vary_headers` is the source's ordered set of header names that
/// participate in the key; only the intersection with `headers` is used,
/// lowercased, and `None` when the intersection is empty.
pub fn derive(
    method: &str,
    url: &str,
    body: Option<&str>,
    headers: &[(String, String)],
    source_id: Option<&str>,
    vary_headers: &[String],
    storage_mode: StorageMode,
) -> String {
    let vary_lower: Vec<String> = vary_headers.iter().map(|h| h.to_lowercase()).collect();
    let mut selected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let lower = name.to_lowercase();
        if vary_lower.contains(&lower) {
            selected.insert(lower, value.clone());
        }
    }

    let canonical = CanonicalRequest {
        method: method.to_uppercase(),
        url: normalize_url(url),
        body: normalize_body(body),
        headers: if selected.is_empty() { None } else { Some(selected) },
        source_id: match storage_mode {
            StorageMode::Dedicated => source_id.map(str::to_string),
            StorageMode::Shared => None,
        },
    };

    let json = serde_json::to_string(&canonical).expect("canonical request always serializes");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vary() -> Vec<String> {
        vec!["accept".to_string(), "content-type".to_string()]
    }

    #[test]
    fn query_param_order_does_not_affect_key() {
        let a = derive(
            "GET",
            "https://api.example.com/items?b=2&a=1",
            None,
            &[],
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        let b = derive(
            "GET",
            "https://api.example.com/items?a=1&b=2",
            None,
            &[],
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn trailing_slash_on_non_root_path_is_collapsed() {
        let a = derive(
            "GET",
            "https://api.example.com/items/",
            None,
            &[],
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        let b = derive(
            "GET",
            "https://api.example.com/items",
            None,
            &[],
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn reordered_json_keys_hash_identically() {
        let a = derive(
            "POST",
            "https://api.example.com/items",
            Some(r#"{"a":1,"b":2}"#),
            &[],
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        let b = derive(
            "POST",
            "https://api.example.com/items",
            Some(r#"{"b":2,"a":1}"#),
            &[],
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn empty_body_hashes_deterministically() {
        let a = derive(
            "GET",
            "https://api.example.com/items",
            Some(""),
            &[],
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        let b = derive(
            "GET",
            "https://api.example.com/items",
            Some(""),
            &[],
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn dedicated_includes_source_shared_omits_it() {
        let dedicated = derive(
            "GET",
            "https://api.example.com/items",
            None,
            &[],
            Some("src-a"),
            &vary(),
            StorageMode::Dedicated,
        );
        let dedicated_other_source = derive(
            "GET",
            "https://api.example.com/items",
            None,
            &[],
            Some("src-b"),
            &vary(),
            StorageMode::Dedicated,
        );
        assert_ne!(dedicated, dedicated_other_source);

        let shared_a = derive(
            "GET",
            "https://api.example.com/items",
            None,
            &[],
            Some("src-a"),
            &vary(),
            StorageMode::Shared,
        );
        let shared_b = derive(
            "GET",
            "https://api.example.com/items",
            None,
            &[],
            Some("src-b"),
            &vary(),
            StorageMode::Shared,
        );
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn only_vary_headers_participate() {
        let headers = vec![
            ("Accept".to_string(), "application/json".to_string()),
            ("X-Ignored".to_string(), "anything".to_string()),
        ];
        let with_ignored = derive(
            "GET",
            "https://api.example.com/items",
            None,
            &headers,
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        let without_ignored = derive(
            "GET",
            "https://api.example.com/items",
            None,
            &headers[..1],
            Some("src"),
            &vary(),
            StorageMode::Dedicated,
        );
        assert_eq!(with_ignored, without_ignored);
    }
}
