use std::sync::Arc;

use async_trait::async_trait;
use codec::JsonCodec;
use engine::{
    EventKind, Extension, ExtensionPipeline, ExtensionRegistry, Finalizer, HandlerConfig,
    LifecycleEvent, RequestHandler, Subscription,
};
use functions::system::{Echo, DESCRIBE_URN, ECHO_URN};
use functions::{function_fn, FunctionDescriptor, FunctionRegistry};
use parking_lot::Mutex;
use protocol::{ErrorCode, ForrstError, FunctionOutput};
use serde_json::{json, Value};

type Journal = Arc<Mutex<Vec<String>>>;

/// Records every event it sees; optionally rejects or fails at one of them.
struct Recorder {
    urn: &'static str,
    global: bool,
    fatal: bool,
    journal: Journal,
    reject_at: Option<EventKind>,
    fail_at: Option<EventKind>,
}

impl Recorder {
    fn new(urn: &'static str, journal: &Journal) -> Self {
        Self {
            urn,
            global: false,
            fatal: true,
            journal: Arc::clone(journal),
            reject_at: None,
            fail_at: None,
        }
    }

    fn global(mut self) -> Self {
        self.global = true;
        self
    }

    fn rejecting_at(mut self, kind: EventKind) -> Self {
        self.reject_at = Some(kind);
        self
    }

    fn failing_at(mut self, kind: EventKind, fatal: bool) -> Self {
        self.fail_at = Some(kind);
        self.fatal = fatal;
        self
    }

    async fn record(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        let target = event.extension().map(|ext| ext.urn.clone()).unwrap_or_default();
        self.journal
            .lock()
            .push(format!("{}:{}:{}", self.urn, event.kind(), target));
        event.state_mut().defer(Note {
            text: format!("finalized:{}", self.urn),
            journal: Arc::clone(&self.journal),
        });
        if self.fail_at == Some(event.kind()) {
            return Err(ForrstError::internal("recorder exploded"));
        }
        if self.reject_at == Some(event.kind()) {
            event.reject(&ForrstError::Unauthenticated {
                reason: "missing token".into(),
            });
        }
        Ok(())
    }
}

struct Note {
    text: String,
    journal: Journal,
}

#[async_trait]
impl Finalizer for Note {
    fn describe(&self) -> String {
        self.text.clone()
    }

    async fn finalize(self: Box<Self>) {
        let Note { text, journal } = *self;
        journal.lock().push(text);
    }
}

#[async_trait]
impl Extension for Recorder {
    fn urn(&self) -> &str {
        self.urn
    }

    fn is_global(&self) -> bool {
        self.global
    }

    fn is_error_fatal(&self) -> bool {
        self.fatal
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        EventKind::ALL.iter().map(|kind| Subscription::new(*kind, 0)).collect()
    }

    async fn on_request_validated(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        self.record(event).await
    }

    async fn on_executing_function(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        self.record(event).await
    }

    async fn on_function_executed(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        self.record(event).await
    }

    async fn on_sending_response(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        self.record(event).await
    }
}

fn handler(extensions: Vec<Recorder>, config: HandlerConfig) -> RequestHandler {
    let mut registry = ExtensionRegistry::new();
    for extension in extensions {
        registry.register(Arc::new(extension)).unwrap();
    }
    let functions = FunctionRegistry::builder()
        .register(FunctionDescriptor::new(ECHO_URN, "1.0.0").unwrap(), Arc::new(Echo))
        .unwrap()
        .register(
            FunctionDescriptor::new(ECHO_URN, "2.0.0").unwrap(),
            function_fn(|request| Ok(FunctionOutput::Result(json!({"v2": request.call.arguments})))),
        )
        .unwrap()
        .register(
            FunctionDescriptor::new("urn:x:fn:broken", "1.0.0").unwrap(),
            function_fn(|_| Err(ForrstError::internal("database on fire"))),
        )
        .unwrap()
        .with_system_functions()
        .build()
        .unwrap();
    RequestHandler::new(
        Arc::new(JsonCodec::new()),
        Arc::new(ExtensionPipeline::new(registry)),
        Arc::new(functions),
    )
    .with_config(config)
}

fn call(id: &str, function: &str, extensions: Value) -> Value {
    json!({
        "protocol": {"name": "forrst", "version": "1.0"},
        "id": id,
        "call": {"function": function, "version": "1.0.0", "arguments": {"a": 1}},
        "extensions": extensions,
    })
}

#[tokio::test]
async fn echo_round_trip_through_the_codec() {
    let handler = handler(Vec::new(), HandlerConfig::default());
    let raw = call("r1", ECHO_URN, json!([])).to_string();

    let encoded = handler.handle_raw_to_string(&raw).await.unwrap();
    let response = JsonCodec::new().decode_response(&encoded).unwrap();

    assert_eq!(response.id, "r1");
    assert_eq!(response.result, Some(json!({"a": 1})));
    assert!(response.duration_millis().is_some());
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn latest_version_is_used_when_none_is_requested() {
    let handler = handler(Vec::new(), HandlerConfig::default());
    let mut request = call("r1", ECHO_URN, json!([]));
    request["call"].as_object_mut().unwrap().remove("version");

    let response = handler.handle_value(request).await;
    assert_eq!(response.result, Some(json!({"v2": {"a": 1}})));
}

#[tokio::test]
async fn batches_are_rejected_whatever_they_contain() {
    let handler = handler(Vec::new(), HandlerConfig::default());
    for batch in [json!([]), json!([call("r1", ECHO_URN, json!([]))]), json!([1, "x"])] {
        let response = handler.handle_value(batch).await;
        assert_eq!(response.error_code(), Some(ErrorCode::InvalidRequest));
        assert!(!response.id.is_empty());
        assert!(response.duration_millis().is_some());
    }
}

#[tokio::test]
async fn empty_request_is_structurally_invalid() {
    let handler = handler(Vec::new(), HandlerConfig::default());
    let response = handler.handle_raw("{}").await;
    assert_eq!(response.error_code(), Some(ErrorCode::InvalidRequest));
}

#[tokio::test]
async fn parse_failures_keep_the_correlation_id_when_recoverable() {
    let handler = handler(Vec::new(), HandlerConfig::default());

    let response = handler
        .handle_raw(r#"{"protocol": {"name": "forrst", "version": "1.0"}, "id": "r42", "call": {"#)
        .await;
    assert_eq!(response.error_code(), Some(ErrorCode::ParseError));
    assert_eq!(response.id, "r42");

    let response = handler.handle_raw("\u{0}garbage").await;
    assert_eq!(response.error_code(), Some(ErrorCode::ParseError));
    assert!(!response.id.is_empty(), "a fresh correlation id is generated");
}

#[tokio::test]
async fn validation_reports_every_violation() {
    let handler = handler(Vec::new(), HandlerConfig::default());
    let response = handler
        .handle_value(json!({
            "protocol": {"name": "jsonrpc", "version": "1.0"},
            "id": "r1",
            "call": {"function": ECHO_URN, "version": "one", "arguments": []},
        }))
        .await;

    assert_eq!(response.id, "r1");
    assert_eq!(response.status(), 400);
    let pointers: Vec<&str> = response
        .errors
        .as_ref()
        .unwrap()
        .iter()
        .map(|error| error.source.as_ref().unwrap().pointer.as_str())
        .collect();
    assert_eq!(pointers, ["/protocol/name", "/call/version", "/call/arguments"]);
}

#[tokio::test]
async fn executing_and_executed_fire_once_per_declared_invocation() {
    let journal = Journal::default();
    let handler = handler(
        vec![
            Recorder::new("urn:x:ext:a", &journal),
            Recorder::new("urn:x:ext:b", &journal),
            Recorder::new("urn:x:ext:undeclared", &journal),
        ],
        HandlerConfig::default(),
    );

    let response = handler
        .handle_value(call("r1", ECHO_URN, json!([{"urn": "urn:x:ext:a"}, {"urn": "urn:x:ext:b"}])))
        .await;
    assert!(!response.is_error(), "{response:?}");

    let journal = journal.lock().clone();
    let events: Vec<&str> = journal
        .iter()
        .map(String::as_str)
        .filter(|entry| !entry.starts_with("finalized"))
        .collect();
    assert_eq!(
        events,
        [
            "urn:x:ext:a:request_validated:",
            "urn:x:ext:b:request_validated:",
            "urn:x:ext:a:executing_function:urn:x:ext:a",
            "urn:x:ext:b:executing_function:urn:x:ext:a",
            "urn:x:ext:a:executing_function:urn:x:ext:b",
            "urn:x:ext:b:executing_function:urn:x:ext:b",
            "urn:x:ext:a:function_executed:urn:x:ext:a",
            "urn:x:ext:b:function_executed:urn:x:ext:a",
            "urn:x:ext:a:function_executed:urn:x:ext:b",
            "urn:x:ext:b:function_executed:urn:x:ext:b",
            "urn:x:ext:a:sending_response:",
            "urn:x:ext:b:sending_response:",
        ]
    );
}

#[tokio::test]
async fn validated_short_circuit_skips_the_function_and_runs_finalizers() {
    let journal = Journal::default();
    let handler = handler(
        vec![Recorder::new("urn:x:ext:auth", &journal)
            .global()
            .rejecting_at(EventKind::RequestValidated)],
        HandlerConfig::default(),
    );

    let response = handler.handle_value(call("r1", ECHO_URN, json!([]))).await;

    assert_eq!(response.id, "r1");
    assert_eq!(response.status(), 401);
    assert_eq!(response.errors.as_ref().unwrap()[0].message, "Unauthorized");
    assert!(response.duration_millis().is_some());
    assert_eq!(
        *journal.lock(),
        ["urn:x:ext:auth:request_validated:", "finalized:urn:x:ext:auth"]
    );
}

#[tokio::test]
async fn raw_results_bypass_post_execution_events() {
    let journal = Journal::default();
    let handler = handler(
        vec![Recorder::new("urn:x:ext:observer", &journal).global()],
        HandlerConfig::default(),
    );
    let mut request = call("r1", DESCRIBE_URN, json!([]));
    request["call"].as_object_mut().unwrap().remove("arguments");

    let response = handler.handle_value(request).await;

    assert!(response.result.as_ref().unwrap()["functions"].is_array());
    let journal = journal.lock();
    assert!(journal.iter().all(|entry| !entry.contains("function_executed")));
    assert!(journal.iter().all(|entry| !entry.contains("sending_response")));
}

#[tokio::test]
async fn non_fatal_failures_are_logged_and_optionally_exposed() {
    for expose in [false, true] {
        let journal = Journal::default();
        let handler = handler(
            vec![Recorder::new("urn:x:ext:flaky", &journal)
                .global()
                .failing_at(EventKind::SendingResponse, false)],
            HandlerConfig {
                expose_extension_warnings: expose,
                ..Default::default()
            },
        );

        let response = handler.handle_value(call("r1", ECHO_URN, json!([]))).await;

        assert!(!response.is_error(), "a non-fatal failure never aborts the request");
        let warnings = response.meta.as_ref().unwrap().get("warnings");
        if expose {
            let warnings = warnings.unwrap();
            assert_eq!(warnings[0]["extension"], json!("urn:x:ext:flaky"));
            assert_eq!(warnings[0]["event"], json!("sending_response"));
        } else {
            assert!(warnings.is_none());
        }
    }
}

#[tokio::test]
async fn fatal_failures_abort_with_a_generic_internal_error() {
    let journal = Journal::default();
    let handler = handler(
        vec![Recorder::new("urn:x:ext:strict", &journal)
            .global()
            .failing_at(EventKind::RequestValidated, true)],
        HandlerConfig::default(),
    );

    let response = handler.handle_value(call("r1", ECHO_URN, json!([]))).await;

    assert_eq!(response.id, "r1");
    assert_eq!(response.status(), 500);
    let error = &response.errors.as_ref().unwrap()[0];
    assert_eq!(error.message, "Internal server error");
    assert!(error.details.is_none(), "no internals leak without debug mode");
    assert!(journal.lock().contains(&"finalized:urn:x:ext:strict".to_owned()));
}

#[tokio::test]
async fn debug_mode_embeds_the_failure_site() {
    let handler = handler(
        Vec::new(),
        HandlerConfig {
            debug: true,
            ..Default::default()
        },
    );

    let response = handler.handle_value(call("r1", "urn:x:fn:broken", json!([]))).await;

    let error = &response.errors.as_ref().unwrap()[0];
    assert_eq!(error.code, ErrorCode::InternalError);
    let debug = &error.details.as_ref().unwrap()["debug"];
    assert_eq!(debug["message"], json!("database on fire"));
    assert!(debug["file"].as_str().unwrap().ends_with("lifecycle.rs"));
    assert!(debug["line"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn unknown_functions_and_versions_are_not_found() {
    let handler = handler(Vec::new(), HandlerConfig::default());

    let response = handler.handle_value(call("r1", "urn:x:fn:missing", json!([]))).await;
    assert_eq!(response.error_code(), Some(ErrorCode::FunctionNotFound));
    assert_eq!(response.status(), 404);

    let mut request = call("r2", ECHO_URN, json!([]));
    request["call"]["version"] = json!("9.9.9");
    let response = handler.handle_value(request).await;
    assert_eq!(response.error_code(), Some(ErrorCode::VersionNotFound));
}
