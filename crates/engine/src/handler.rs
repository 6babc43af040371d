//! The request handler: drives one request through the lifecycle.
//!
//! ```text
//! Received → Parsed → Validated → PerExtensionExecuting → Dispatched
//!          → PerExtensionExecuted → Sending → Responded
//! ```
//!
//! Any stage may fail; the failure becomes the response (see
//! [`ForrstError::to_error_objects`]). Whatever the exit path, pending
//! [`crate::state::Finalizer`]s run and `meta.duration` is attached before the
//! response is returned.

use std::sync::Arc;

use protocol::validation;
use protocol::{
    CodecError, ErrorCode, ForrstError, FunctionOutput, FunctionResolver, ProtocolCodec,
    RequestId, RequestObject, ResponseObject,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{field, Instrument};

use crate::event::LifecycleEvent;
use crate::pipeline::{ExtensionPipeline, ExtensionWarning};
use crate::state::RequestState;

/// Handler behaviour switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Embed `details.debug` (message, file, line, stack) in internal errors.
    pub debug: bool,

    /// Surface swallowed non-fatal extension failures as `meta.warnings`.
    pub expose_extension_warnings: bool,
}

/// Drives requests through parse, validation, extension dispatch and the
/// function call.
///
/// Cheap to share: every collaborator sits behind an `Arc`, and no state
/// survives between requests.
pub struct RequestHandler {
    codec: Arc<dyn ProtocolCodec>,
    pipeline: Arc<ExtensionPipeline>,
    resolver: Arc<dyn FunctionResolver>,
    config: HandlerConfig,
}

impl RequestHandler {
    pub fn new(
        codec: Arc<dyn ProtocolCodec>,
        pipeline: Arc<ExtensionPipeline>,
        resolver: Arc<dyn FunctionResolver>,
    ) -> Self {
        Self {
            codec,
            pipeline,
            resolver,
            config: HandlerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<ExtensionPipeline> {
        &self.pipeline
    }

    /// Handles a raw request string, decoding it with the configured codec.
    pub async fn handle_raw(&self, raw: &str) -> ResponseObject {
        let started = Instant::now();
        let value = match self.codec.decode(raw) {
            Ok(value) => value,
            Err(err) => {
                let id = recover_raw_id(raw).unwrap_or_else(|| RequestId::generate().into_string());
                let error = ForrstError::new(ErrorCode::ParseError, err.to_string());
                tracing::debug!(request_id = %id, error = %err, "request could not be decoded");
                return self.complete(self.error_response(id, &error), Vec::new(), started);
            }
        };
        self.process(value, Some(raw), started).await
    }

    /// Handles an already-decoded request structure.
    pub async fn handle_value(&self, value: Value) -> ResponseObject {
        self.process(value, None, Instant::now()).await
    }

    /// Handles a raw request and encodes the response with the same codec.
    pub async fn handle_raw_to_string(&self, raw: &str) -> Result<String, CodecError> {
        let response = self.handle_raw(raw).await;
        self.encode(&response)
    }

    pub fn encode(&self, response: &ResponseObject) -> Result<String, CodecError> {
        self.codec.encode(response)
    }

    async fn process(&self, value: Value, raw: Option<&str>, started: Instant) -> ResponseObject {
        let id = parsed_id(&value).or_else(|| raw.and_then(recover_raw_id));
        let span = tracing::info_span!(
            "forrst.request",
            request_id = field::Empty,
            function = field::Empty,
        );
        if let Some(id) = &id {
            span.record("request_id", id.as_str());
        }
        if let Some(function) = value.pointer("/call/function").and_then(Value::as_str) {
            span.record("function", function);
        }

        async move {
            let mut state = RequestState::new();
            let mut warnings = Vec::new();
            let outcome = self.run(value, &mut state, &mut warnings).await;
            state.finalize().await;

            let response = match outcome {
                Ok(response) => response,
                Err(error) => {
                    let id = id.unwrap_or_else(|| RequestId::generate().into_string());
                    self.error_response(id, &error)
                }
            };
            self.complete(response, warnings, started)
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        value: Value,
        state: &mut RequestState,
        warnings: &mut Vec<ExtensionWarning>,
    ) -> Result<ResponseObject, ForrstError> {
        validation::validate_envelope(&value)?;
        let request: RequestObject = serde_json::from_value(value)
            .map_err(|err| ForrstError::new(ErrorCode::InvalidRequest, err.to_string()))?;

        let mut validated = LifecycleEvent::request_validated(&request, state);
        self.dispatch(&mut validated, warnings).await?;
        if let Some(response) = validated.into_response() {
            tracing::debug!("request short-circuited after validation");
            return Ok(response);
        }

        for invocation in request.extensions() {
            let mut executing = LifecycleEvent::executing_function(&request, state, invocation.clone());
            self.dispatch(&mut executing, warnings).await?;
            if let Some(response) = executing.into_response() {
                tracing::debug!(extension = %invocation.urn, "function call pre-empted");
                return Ok(response);
            }
        }

        let function = self
            .resolver
            .resolve(&request.call.function, request.call.version.as_deref())?;
        let mut response = match function.call(&request).await? {
            FunctionOutput::Raw(result) => {
                return Ok(ResponseObject::success(request.id.clone(), result));
            }
            FunctionOutput::Result(result) => ResponseObject::success(request.id.clone(), result),
            FunctionOutput::Response(mut response) => {
                response.id = request.id.clone();
                response
            }
        };

        for invocation in request.extensions() {
            let mut executed =
                LifecycleEvent::function_executed(&request, state, invocation.clone(), response);
            self.dispatch(&mut executed, warnings).await?;
            response = take_response(executed)?;
        }

        let mut sending = LifecycleEvent::sending_response(&request, state, response);
        self.dispatch(&mut sending, warnings).await?;
        take_response(sending)
    }

    async fn dispatch(
        &self,
        event: &mut LifecycleEvent<'_>,
        warnings: &mut Vec<ExtensionWarning>,
    ) -> Result<(), ForrstError> {
        let report = self.pipeline.dispatch(event).await?;
        warnings.extend(report.warnings);
        Ok(())
    }

    fn error_response(&self, id: String, error: &ForrstError) -> ResponseObject {
        match error {
            ForrstError::Internal { .. } => {
                tracing::error!(request_id = %id, error = %error, "request failed with an internal error");
            }
            _ => {
                tracing::debug!(request_id = %id, code = %error.code(), error = %error, "request failed");
            }
        }
        ResponseObject::from_error(id, error, self.config.debug)
    }

    fn complete(
        &self,
        mut response: ResponseObject,
        warnings: Vec<ExtensionWarning>,
        started: Instant,
    ) -> ResponseObject {
        if self.config.expose_extension_warnings && !warnings.is_empty() {
            if let Ok(warnings) = serde_json::to_value(&warnings) {
                response.set_meta("warnings", warnings);
            }
        }
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        response.set_duration(elapsed);
        tracing::info!(
            request_id = %response.id,
            status = response.status(),
            duration_ms = elapsed,
            "request handled"
        );
        response
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("codec", &self.codec.format())
            .field("pipeline", &self.pipeline)
            .field("config", &self.config)
            .finish()
    }
}

fn take_response(event: LifecycleEvent<'_>) -> Result<ResponseObject, ForrstError> {
    let kind = event.kind();
    event
        .into_response()
        .ok_or_else(|| ForrstError::internal(format!("{kind} event lost its response")))
}

/// The `id` of a decoded request, if it carries a usable one.
fn parsed_id(value: &Value) -> Option<String> {
    value
        .get("id")
        .and_then(Value::as_str)
        .and_then(RequestId::parse)
        .map(RequestId::into_string)
}

/// Best-effort recovery of the `id` from text the codec could not decode.
///
/// Tries a tolerant JSON decode first, then scans for an `"id": "..."` member.
fn recover_raw_id(raw: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some(id) = parsed_id(&value) {
            return Some(id);
        }
    }

    let mut rest = raw;
    while let Some(position) = rest.find("\"id\"") {
        rest = &rest[position + 4..];
        let Some(value) = rest.trim_start().strip_prefix(':') else {
            continue;
        };
        let Some(body) = value.trim_start().strip_prefix('"') else {
            continue;
        };
        if let Some(end) = body.find('"') {
            if let Some(id) = RequestId::parse(&body[..end]) {
                return Some(id.into_string());
            }
        }
    }
    None
}
