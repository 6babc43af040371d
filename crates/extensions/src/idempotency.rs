//! At-most-once execution per `(key, function, version, arguments)`.
//!
//! ## Protocol
//!
//! On `executing_function`:
//!
//! 1. Look up the cache key. A hit replays the stored response (same
//!    arguments) or rejects with `IDEMPOTENCY_CONFLICT` (different arguments).
//! 2. On a miss, try the companion lock `<cache key>:lock` without waiting. A
//!    busy lock rejects with `IDEMPOTENCY_PROCESSING` and a one-second
//!    `retry_after` hint.
//! 3. With the lock held, look up the cache key again. Another holder may have
//!    stored a response between step 1 and step 2.
//! 4. Otherwise record the invocation in the request state and let the
//!    function run.
//!
//! On `function_executed` the successful response is persisted for the TTL
//! and annotated with `status: "processed"`. Error responses are never
//! persisted.
//!
//! Both steps run once per request, on the first dispatch of each event,
//! whichever invocation triggered it. Options come from the first
//! `urn:forrst:ext:idempotency` entry; repeated entries add nothing.
//!
//! The lock release is registered as a request finalizer the moment the lock
//! is taken, so it runs on every exit path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::{EventKind, Extension, Finalizer, LifecycleEvent, Subscription};
use protocol::{
    CacheLock, CacheStore, DurationParseError, DurationValue, ErrorCode, ExtensionObject,
    ForrstError, IdempotencyKey, RequestObject, ResponseObject, StoreError, TimeUnit, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::digest::{hash_value, sha256_hex};
use crate::option_pointer;

pub const IDEMPOTENCY_URN: &str = "urn:forrst:ext:idempotency";

/// Runs after deadline checks.
pub const IDEMPOTENCY_PRIORITY: i32 = 25;

const LOCK_TTL: Duration = Duration::from_secs(30);
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const TTL_UNITS: &[TimeUnit] = &[TimeUnit::Second, TimeUnit::Minute, TimeUnit::Hour, TimeUnit::Day];
const LATEST_VERSION: &str = "latest";

/// What is stored under a cache key after a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub response: ResponseObject,
    pub original_request_id: String,
    pub arguments_hash: String,
    pub cached_at: Timestamp,
    pub expires_at: Timestamp,
}

/// State carried from `executing_function` to `function_executed`.
struct Claim {
    key: IdempotencyKey,
    cache_key: String,
    arguments_hash: String,
    ttl: Duration,
    lock: Arc<dyn CacheLock>,
}

struct ReleaseLock(Arc<dyn CacheLock>);

#[async_trait]
impl Finalizer for ReleaseLock {
    fn describe(&self) -> String {
        format!("release idempotency lock {}", self.0.key())
    }

    async fn finalize(self: Box<Self>) {
        if let Err(err) = self.0.release().await {
            tracing::warn!(lock = %self.0.key(), error = %err, "failed to release idempotency lock");
        }
    }
}

/// The idempotency extension.
pub struct IdempotencyExtension {
    store: Arc<dyn CacheStore>,
}

impl IdempotencyExtension {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Cache key for `key` on the called function and version.
    pub fn cache_key(key: &IdempotencyKey, request: &RequestObject) -> String {
        let version = request.call.version.as_deref().unwrap_or(LATEST_VERSION);
        let fingerprint = sha256_hex(format!("{}|{}|{version}", key.as_str(), request.call.function));
        format!("forrst:idempotency:{fingerprint}")
    }

    /// Fingerprint of the call arguments. Absent and empty arguments match.
    pub fn arguments_hash(request: &RequestObject) -> String {
        let arguments = request.call.arguments.clone().unwrap_or_default();
        hash_value(&Value::Object(arguments))
    }

    async fn lookup(&self, cache_key: &str) -> Result<Option<IdempotencyRecord>, ForrstError> {
        let Some(stored) = self.store.get(cache_key).await? else {
            return Ok(None);
        };
        let record = serde_json::from_value(stored)
            .map_err(|err| StoreError::Corrupt(format!("idempotency record {cache_key}: {err}")))?;
        Ok(Some(record))
    }

    /// Answers from a stored record: replay on matching arguments, conflict
    /// otherwise.
    fn replay(
        &self,
        event: &mut LifecycleEvent<'_>,
        key: &IdempotencyKey,
        arguments_hash: &str,
        record: IdempotencyRecord,
    ) {
        if record.arguments_hash != arguments_hash {
            tracing::info!(key = %key.as_str(), "idempotency key reused with different arguments");
            let mut details = Map::new();
            details.insert("key".into(), json!(key.as_str()));
            details.insert("original_request_id".into(), json!(record.original_request_id));
            event.reject(
                &ForrstError::new(
                    ErrorCode::IdempotencyConflict,
                    "Idempotency key was already used with different arguments",
                )
                .with_details(details),
            );
            return;
        }

        tracing::debug!(key = %key.as_str(), original = %record.original_request_id, "replaying cached response");
        let mut response = record.response;
        response.id = event.request().id.clone();
        response.push_extension(annotation(key, "cached", &record.original_request_id, record.expires_at));
        event.respond(response);
    }

    async fn claim(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        let request = event.request();
        let key = parse_key(request)?;
        let ttl = parse_ttl(request)?;
        let cache_key = Self::cache_key(&key, request);
        let arguments_hash = Self::arguments_hash(request);

        if let Some(record) = self.lookup(&cache_key).await? {
            self.replay(event, &key, &arguments_hash, record);
            return Ok(());
        }

        let lock = self.store.lock(&format!("{cache_key}:lock"), LOCK_TTL);
        if !lock.try_acquire().await? {
            tracing::debug!(key = %key.as_str(), "idempotency key is being processed elsewhere");
            let mut details = Map::new();
            details.insert("key".into(), json!(key.as_str()));
            details.insert("retry_after".into(), DurationValue::new(1, TimeUnit::Second).to_json());
            event.reject(
                &ForrstError::new(
                    ErrorCode::IdempotencyProcessing,
                    "A request with this idempotency key is already being processed",
                )
                .with_details(details),
            );
            return Ok(());
        }
        event.state_mut().defer(ReleaseLock(Arc::clone(&lock)));

        if let Some(record) = self.lookup(&cache_key).await? {
            lock.release().await?;
            self.replay(event, &key, &arguments_hash, record);
            return Ok(());
        }

        event.state_mut().insert(
            IDEMPOTENCY_URN,
            Claim {
                key,
                cache_key,
                arguments_hash,
                ttl,
                lock,
            },
        );
        Ok(())
    }

    async fn settle(&self, event: &mut LifecycleEvent<'_>, claim: Claim) -> Result<(), ForrstError> {
        let Some(response) = event.response() else {
            claim.lock.release().await?;
            return Ok(());
        };
        if response.is_error() {
            tracing::debug!(key = %claim.key.as_str(), "not persisting an error response");
            claim.lock.release().await?;
            return Ok(());
        }

        let cached_at = Timestamp::now();
        let expires_at = cached_at
            .checked_add(claim.ttl)
            .ok_or_else(|| ForrstError::internal("idempotency expiry is out of range"))?;
        let original_request_id = event.request().id.clone();
        // Annotations describe this request; a replay carries its own.
        let mut stored = response.clone();
        stored.extensions = None;
        let record = IdempotencyRecord {
            response: stored,
            original_request_id: original_request_id.clone(),
            arguments_hash: claim.arguments_hash,
            cached_at,
            expires_at,
        };
        self.store
            .put(&claim.cache_key, serde_json::to_value(&record)?, claim.ttl)
            .await?;
        claim.lock.release().await?;
        tracing::debug!(key = %claim.key.as_str(), ttl_secs = claim.ttl.as_secs(), "stored idempotent response");

        let processed = annotation(&claim.key, "processed", &original_request_id, expires_at);
        event.map_response(|response| response.with_extension(processed));
        Ok(())
    }
}

#[async_trait]
impl Extension for IdempotencyExtension {
    fn urn(&self) -> &str {
        IDEMPOTENCY_URN
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::new(EventKind::ExecutingFunction, IDEMPOTENCY_PRIORITY),
            Subscription::new(EventKind::FunctionExecuted, IDEMPOTENCY_PRIORITY),
        ]
    }

    async fn on_executing_function(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        if !event.request().declares_extension(IDEMPOTENCY_URN)
            || event.state().contains(IDEMPOTENCY_URN)
            || !event.first_visit(IDEMPOTENCY_URN)
        {
            return Ok(());
        }
        self.claim(event).await
    }

    async fn on_function_executed(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        match event.state_mut().remove::<Claim>(IDEMPOTENCY_URN) {
            Some(claim) => self.settle(event, claim).await,
            None => Ok(()),
        }
    }
}

fn annotation(
    key: &IdempotencyKey,
    status: &str,
    original_request_id: &str,
    expires_at: Timestamp,
) -> ExtensionObject {
    let mut data = Map::new();
    data.insert("key".into(), json!(key.as_str()));
    data.insert("status".into(), json!(status));
    data.insert("original_request_id".into(), json!(original_request_id));
    data.insert("expires_at".into(), json!(expires_at.to_string()));
    ExtensionObject::response(IDEMPOTENCY_URN, data)
}

fn parse_key(request: &RequestObject) -> Result<IdempotencyKey, ForrstError> {
    let pointer = option_pointer(request, IDEMPOTENCY_URN, "key");
    let raw = request
        .extension(IDEMPOTENCY_URN)
        .and_then(|ext| ext.option("key"))
        .ok_or_else(|| ForrstError::invalid_arguments(&pointer, "Idempotency key is required"))?;
    raw.as_str().and_then(IdempotencyKey::parse).ok_or_else(|| {
        ForrstError::invalid_arguments(
            &pointer,
            "Idempotency key must be 1 to 255 characters of [A-Za-z0-9-_:.]",
        )
    })
}

/// Reads `ttl`, defaulting to 24 hours and clamping to 30 days.
fn parse_ttl(request: &RequestObject) -> Result<Duration, ForrstError> {
    let Some(raw) = request
        .extension(IDEMPOTENCY_URN)
        .and_then(|ext| ext.option("ttl"))
        .filter(|raw| !raw.is_null())
    else {
        return Ok(DEFAULT_TTL);
    };
    match DurationValue::from_json(raw, TTL_UNITS) {
        Ok(ttl) => Ok(ttl.as_std().min(MAX_TTL)),
        Err(DurationParseError::Overflow) => Ok(MAX_TTL),
        Err(err) => Err(ForrstError::invalid_arguments(
            option_pointer(request, IDEMPOTENCY_URN, "ttl"),
            format!("Invalid idempotency ttl: {err}"),
        )),
    }
}
