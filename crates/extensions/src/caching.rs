//! Conditional caching toolkit.
//!
//! The caching extension subscribes to no lifecycle event. Functions call it
//! explicitly: to validate a client's `if_none_match` / `if_modified_since`
//! against the current representation, to answer `not_modified`, and to keep
//! a server-side result cache keyed by function, version and arguments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::Extension;
use protocol::{
    CacheStore, ExtensionObject, ForrstError, RequestObject, ResponseObject, Timestamp,
};
use serde_json::{json, Map, Value};

use crate::digest::{hash_value, sha256_hex};
use crate::option_pointer;

pub const CACHING_URN: &str = "urn:forrst:ext:caching";

const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Strips a weak-validator prefix and surrounding quotes.
pub fn normalize_etag(etag: &str) -> &str {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    etag.trim_matches('"')
}

/// Whether the client's copy is still current.
///
/// ETags take precedence over timestamps. Without an ETag the copy is current
/// when the resource has not been modified after the client's last-known
/// time. With neither, the client must refetch.
pub fn is_valid(
    client_etag: Option<&str>,
    client_modified: Option<Timestamp>,
    current_etag: Option<&str>,
    current_modified: Option<Timestamp>,
) -> bool {
    if let Some(client) = client_etag {
        return current_etag.is_some_and(|current| normalize_etag(client) == normalize_etag(current));
    }
    match (client_modified, current_modified) {
        (Some(client), Some(current)) => current <= client,
        _ => false,
    }
}

/// Quoted 64-bit fingerprint of `value`.
pub fn generate_etag(value: &Value) -> String {
    let digest = hash_value(value);
    format!("\"{}\"", &digest[..16])
}

/// Server-side cache key for a call.
pub fn cache_key(function: &str, version: Option<&str>, arguments: Option<&Map<String, Value>>) -> String {
    let arguments = arguments.cloned().unwrap_or_default();
    let fingerprint = sha256_hex(format!(
        "{function}|{}|{}",
        version.unwrap_or("latest"),
        hash_value(&Value::Object(arguments))
    ));
    format!("forrst:cache:{fingerprint}")
}

/// Conditional options a request declared on the caching extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalOptions {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<Timestamp>,
}

impl ConditionalOptions {
    /// Reads the options of the request's caching invocation. A request that
    /// does not declare caching has no conditions.
    pub fn from_request(request: &RequestObject) -> Result<Self, ForrstError> {
        let Some(invocation) = request.extension(CACHING_URN) else {
            return Ok(Self::default());
        };

        let if_none_match = match invocation.option("if_none_match") {
            None | Some(Value::Null) => None,
            Some(Value::String(etag)) => Some(etag.clone()),
            Some(_) => {
                return Err(ForrstError::invalid_arguments(
                    option_pointer(request, CACHING_URN, "if_none_match"),
                    "if_none_match must be a string",
                ))
            }
        };
        let if_modified_since = match invocation.option("if_modified_since") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(raw.as_str().and_then(Timestamp::parse_rfc3339).ok_or_else(|| {
                ForrstError::invalid_arguments(
                    option_pointer(request, CACHING_URN, "if_modified_since"),
                    "if_modified_since must be an RFC 3339 timestamp",
                )
            })?),
        };

        Ok(Self {
            if_none_match,
            if_modified_since,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }

    /// Whether the client's copy matches the current representation.
    pub fn matches(&self, current_etag: Option<&str>, current_modified: Option<Timestamp>) -> bool {
        is_valid(
            self.if_none_match.as_deref(),
            self.if_modified_since,
            current_etag,
            current_modified,
        )
    }
}

/// The caching extension: response helpers plus a server-side result cache.
pub struct CachingExtension {
    store: Arc<dyn CacheStore>,
    result_ttl: Duration,
}

impl CachingExtension {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            result_ttl: DEFAULT_RESULT_TTL,
        }
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Appends a caching annotation, preserving every earlier annotation.
    pub fn enrich(
        response: ResponseObject,
        etag: &str,
        last_modified: Option<Timestamp>,
        max_age: Option<Duration>,
    ) -> ResponseObject {
        let mut data = Map::new();
        data.insert("etag".into(), json!(etag));
        if let Some(modified) = last_modified {
            data.insert("last_modified".into(), json!(modified.to_string()));
        }
        if let Some(max_age) = max_age {
            data.insert("max_age".into(), json!({"value": max_age.as_secs(), "unit": "second"}));
        }
        response.with_extension(ExtensionObject::response(CACHING_URN, data))
    }

    /// A `not_modified` answer: no result body, the current validator only.
    pub fn not_modified(id: impl Into<String>, etag: &str) -> ResponseObject {
        let mut data = Map::new();
        data.insert("status".into(), json!("not_modified"));
        data.insert("etag".into(), json!(etag));
        ResponseObject::success(id, Value::Null)
            .with_extension(ExtensionObject::response(CACHING_URN, data))
    }

    /// Answers `request` with `result`, or with `not_modified` when the
    /// client's conditional options still match.
    pub fn conditional_response(
        request: &RequestObject,
        result: Value,
        last_modified: Option<Timestamp>,
    ) -> Result<ResponseObject, ForrstError> {
        let etag = generate_etag(&result);
        let conditions = ConditionalOptions::from_request(request)?;
        if conditions.matches(Some(&etag), last_modified) {
            tracing::debug!(request_id = %request.id, etag = %etag, "client copy is current");
            return Ok(Self::not_modified(request.id.clone(), &etag));
        }
        Ok(Self::enrich(
            ResponseObject::success(request.id.clone(), result),
            &etag,
            last_modified,
            None,
        ))
    }

    /// Cached result of the call `request` makes, if any.
    pub async fn lookup(&self, request: &RequestObject) -> Result<Option<Value>, ForrstError> {
        let key = request_cache_key(request);
        Ok(self.store.get(&key).await?)
    }

    /// Caches `result` for the call `request` makes.
    pub async fn remember(&self, request: &RequestObject, result: &Value) -> Result<(), ForrstError> {
        let key = request_cache_key(request);
        self.store.put(&key, result.clone(), self.result_ttl).await?;
        tracing::debug!(function = %request.call.function, ttl_secs = self.result_ttl.as_secs(), "cached function result");
        Ok(())
    }
}

impl std::fmt::Debug for CachingExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingExtension")
            .field("result_ttl", &self.result_ttl)
            .finish()
    }
}

#[async_trait]
impl Extension for CachingExtension {
    fn urn(&self) -> &str {
        CACHING_URN
    }
}

fn request_cache_key(request: &RequestObject) -> String {
    cache_key(
        &request.call.function,
        request.call.version.as_deref(),
        request.call.arguments.as_ref(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(value: &str) -> Option<Timestamp> {
        Timestamp::parse_rfc3339(value)
    }

    #[test]
    fn etags_compare_after_normalization() {
        assert_eq!(normalize_etag("W/\"abc\""), "abc");
        assert!(is_valid(Some("W/\"abc\""), None, Some("\"abc\""), None));
        assert!(!is_valid(Some("\"abc\""), None, Some("\"abd\""), None));
        assert!(!is_valid(Some("\"abc\""), None, None, None));
    }

    #[test]
    fn etag_takes_precedence_over_timestamps() {
        let old = at("2024-01-01T00:00:00Z");
        let new = at("2024-06-01T00:00:00Z");
        assert!(!is_valid(Some("\"a\""), new, Some("\"b\""), old));
        assert!(is_valid(Some("\"a\""), old, Some("\"a\""), new));
    }

    #[test]
    fn timestamps_decide_without_etags_and_nothing_means_refetch() {
        let old = at("2024-01-01T00:00:00Z");
        let new = at("2024-06-01T00:00:00Z");
        assert!(is_valid(None, new, None, old));
        assert!(is_valid(None, new, None, new));
        assert!(!is_valid(None, old, None, new));
        assert!(!is_valid(None, None, Some("\"a\""), old));
    }

    #[test]
    fn etags_are_stable_quoted_64_bit_fingerprints() {
        let a = generate_etag(&json!({"x": 1, "y": [1, 2]}));
        let b = generate_etag(&serde_json::from_str(r#"{"y": [1, 2], "x": 1}"#).unwrap());
        assert_eq!(a, b);
        assert_eq!(a.len(), 18);
        assert!(a.starts_with('"') && a.ends_with('"'));
        assert_ne!(a, generate_etag(&json!({"x": 2, "y": [1, 2]})));
    }

    #[test]
    fn cache_keys_depend_on_function_version_and_arguments() {
        let args = json!({"a": 1}).as_object().cloned();
        let base = cache_key("urn:x:fn:list", None, args.as_ref());
        assert_eq!(base, cache_key("urn:x:fn:list", Some("latest"), args.as_ref()));
        assert_ne!(base, cache_key("urn:x:fn:list", Some("1.0.0"), args.as_ref()));
        assert_ne!(base, cache_key("urn:x:fn:other", None, args.as_ref()));
        assert_ne!(base, cache_key("urn:x:fn:list", None, None));
    }

    #[test]
    fn enrichment_appends_to_prior_annotations() {
        let prior = ResponseObject::success("r1", json!(1))
            .with_extension(ExtensionObject::response("urn:x:ext:other", Map::new()));
        let enriched = CachingExtension::enrich(prior, "\"e\"", at("2024-01-01T00:00:00Z"), Some(Duration::from_secs(60)));

        let urns: Vec<&str> = enriched.extensions().iter().map(|e| e.urn.as_str()).collect();
        assert_eq!(urns, ["urn:x:ext:other", CACHING_URN]);
        let data = enriched.extension(CACHING_URN).unwrap().data.as_ref().unwrap();
        assert_eq!(data["max_age"], json!({"value": 60, "unit": "second"}));
    }

    #[test]
    fn conditional_response_answers_not_modified_for_a_matching_etag() {
        let result = json!({"items": [1, 2, 3]});
        let etag = generate_etag(&result);
        let mut options = Map::new();
        options.insert("if_none_match".into(), json!(format!("W/{etag}")));
        let request = RequestObject::new("r2", "urn:x:fn:list")
            .with_extension(ExtensionObject::request(CACHING_URN, Some(options)));

        let response = CachingExtension::conditional_response(&request, result.clone(), None).unwrap();
        assert_eq!(response.result, Some(Value::Null));
        assert_eq!(
            response.extension(CACHING_URN).unwrap().data.as_ref().unwrap()["status"],
            json!("not_modified")
        );

        let fresh = RequestObject::new("r3", "urn:x:fn:list");
        let response = CachingExtension::conditional_response(&fresh, result.clone(), None).unwrap();
        assert_eq!(response.result, Some(result));
        assert_eq!(
            response.extension(CACHING_URN).unwrap().data.as_ref().unwrap()["etag"],
            json!(etag)
        );
    }

    #[test]
    fn malformed_conditional_options_are_invalid_arguments() {
        let mut options = Map::new();
        options.insert("if_modified_since".into(), json!("yesterday"));
        let request = RequestObject::new("r1", "urn:x:fn:list")
            .with_extension(ExtensionObject::request(CACHING_URN, Some(options)));

        let err = ConditionalOptions::from_request(&request).unwrap_err();
        assert_eq!(err.code(), protocol::ErrorCode::InvalidArguments);
    }
}
