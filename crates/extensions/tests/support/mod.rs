//! Shared wiring for extension integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codec::JsonCodec;
use engine::{ExtensionPipeline, ExtensionRegistry, RequestHandler};
use extensions::{CachingExtension, DeadlineExtension, IdempotencyExtension};
use functions::{FunctionDescriptor, FunctionRegistry};
use protocol::{CacheStore, ErrorCode, ForrstError, Function, FunctionOutput, RequestObject};
use serde_json::{json, Value};
use store::MemoryStore;

pub const ECHO: &str = "urn:x:fn:echo";

/// Echoes its arguments after `delay`, counting every execution.
///
/// Fails (once per configured failure) with `UNAVAILABLE` before counting.
pub struct CountingEcho {
    pub calls: Arc<AtomicUsize>,
    delay: Duration,
    failures_left: AtomicUsize,
}

impl CountingEcho {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
            failures_left: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(self, failures: usize) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Function for CountingEcho {
    async fn call(&self, request: &RequestObject) -> Result<FunctionOutput, ForrstError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ForrstError::new(ErrorCode::Unavailable, "try again"));
        }
        let execution = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(FunctionOutput::Result(json!({
            "arguments": request.call.arguments.clone().unwrap_or_default(),
            "execution": execution,
        })))
    }
}

/// A pipeline with every built-in extension sharing `store`.
pub fn pipeline_with(store: &MemoryStore) -> Arc<ExtensionPipeline> {
    pipeline_over(Arc::new(store.clone()))
}

/// A pipeline with every built-in extension sharing `cache`.
pub fn pipeline_over(cache: Arc<dyn CacheStore>) -> Arc<ExtensionPipeline> {
    let registry = ExtensionRegistry::new()
        .with(Arc::new(DeadlineExtension::new()))
        .unwrap()
        .with(Arc::new(IdempotencyExtension::new(Arc::clone(&cache))))
        .unwrap()
        .with(Arc::new(CachingExtension::new(cache)))
        .unwrap();
    Arc::new(ExtensionPipeline::new(registry))
}

/// A handler serving `function` as [`ECHO`] behind [`pipeline_with`].
pub fn handler_with(store: &MemoryStore, function: Arc<dyn Function>) -> RequestHandler {
    handler_over(Arc::new(store.clone()), function)
}

/// A handler serving `function` as [`ECHO`] behind [`pipeline_over`].
pub fn handler_over(cache: Arc<dyn CacheStore>, function: Arc<dyn Function>) -> RequestHandler {
    let functions = FunctionRegistry::builder()
        .register(FunctionDescriptor::new(ECHO, "1.0.0").unwrap(), function)
        .unwrap()
        .build()
        .unwrap();
    RequestHandler::new(
        Arc::new(JsonCodec::new()),
        pipeline_over(cache),
        Arc::new(functions),
    )
}

/// A wire request calling `function` with `arguments` and `extensions`.
pub fn request(id: &str, function: &str, arguments: Value, extensions: Value) -> Value {
    json!({
        "protocol": {"name": "forrst", "version": "1.0"},
        "id": id,
        "call": {"function": function, "arguments": arguments},
        "extensions": extensions,
    })
}

/// Data of the annotation `urn` left on `response`.
pub fn annotation<'a>(response: &'a protocol::ResponseObject, urn: &str) -> &'a serde_json::Map<String, Value> {
    response
        .extension(urn)
        .and_then(|ext| ext.data.as_ref())
        .unwrap_or_else(|| panic!("missing {urn} annotation"))
}
