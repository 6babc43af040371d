//! The extension dispatch pipeline.
//!
//! Builds, from the registry, a listener map grouped by event kind and then by
//! priority, and dispatches lifecycle events through it.
//!
//! ## Ordering
//!
//! Within one event, listeners run in ascending priority; listeners that share
//! a priority run in registration order. The map is built once (lazily, or on
//! an explicit [`ExtensionPipeline::rebuild`]) and reused by every request.
//!
//! ## Failure isolation
//!
//! A failing listener of a fatal extension aborts the dispatch and the error
//! propagates to the request handler. A failing listener of a non-fatal
//! extension is logged, recorded as an [`ExtensionWarning`], and dispatch
//! continues.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use protocol::ForrstError;
use serde::Serialize;

use crate::event::{EventKind, LifecycleEvent};
use crate::extension::{self, Extension};
use crate::registry::{ExtensionRegistry, RegistrationError};

/// A registered handler for one event kind.
#[derive(Clone)]
pub struct Listener {
    extension: Arc<dyn Extension>,
    priority: i32,
}

impl Listener {
    pub fn urn(&self) -> &str {
        self.extension.urn()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    fn should_run(&self, event: &LifecycleEvent<'_>) -> bool {
        self.extension.is_global() || event.request().declares_extension(self.urn())
    }
}

/// Listeners grouped by event kind, then by ascending priority.
#[derive(Default)]
pub struct ListenerMap {
    by_event: HashMap<EventKind, BTreeMap<i32, Vec<Listener>>>,
}

impl ListenerMap {
    /// Builds the map from every subscription of every registered extension.
    pub fn build(registry: &ExtensionRegistry) -> Self {
        let mut by_event: HashMap<EventKind, BTreeMap<i32, Vec<Listener>>> = HashMap::new();
        for extension in registry.iter() {
            for subscription in extension.subscriptions() {
                by_event
                    .entry(subscription.event)
                    .or_default()
                    .entry(subscription.priority)
                    .or_default()
                    .push(Listener {
                        extension: Arc::clone(extension),
                        priority: subscription.priority,
                    });
            }
        }
        Self { by_event }
    }

    /// Listeners for `kind` in dispatch order.
    pub fn listeners(&self, kind: EventKind) -> impl Iterator<Item = &Listener> {
        self.by_event
            .get(&kind)
            .into_iter()
            .flat_map(|buckets| buckets.values().flatten())
    }

    /// `(urn, priority)` pairs for `kind` in dispatch order.
    pub fn describe(&self, kind: EventKind) -> Vec<(String, i32)> {
        self.listeners(kind)
            .map(|listener| (listener.urn().to_owned(), listener.priority))
            .collect()
    }
}

/// A swallowed failure of a non-fatal extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionWarning {
    pub extension: String,
    pub event: String,
    pub message: String,
}

/// What happened during one dispatch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that were invoked, in order.
    pub invoked: Vec<String>,
    pub warnings: Vec<ExtensionWarning>,
    /// Set when a listener stopped propagation.
    pub stopped_by: Option<String>,
}

/// Dispatches lifecycle events to registered extensions.
///
/// Owns the registry. The listener map is read-mostly: it is rebuilt only by
/// [`ExtensionPipeline::register`] or [`ExtensionPipeline::rebuild`], never
/// per request.
pub struct ExtensionPipeline {
    registry: RwLock<ExtensionRegistry>,
    listeners: RwLock<Option<Arc<ListenerMap>>>,
}

impl ExtensionPipeline {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self {
            registry: RwLock::new(registry),
            listeners: RwLock::new(None),
        }
    }

    /// Registers (or re-registers) an extension and invalidates the listener map.
    pub fn register(&self, extension: Arc<dyn Extension>) -> Result<(), RegistrationError> {
        self.registry.write().register(extension)?;
        *self.listeners.write() = None;
        Ok(())
    }

    /// Rebuilds the listener map from the current registry.
    ///
    /// The registry stays read-locked until the map is stored, so a concurrent
    /// [`ExtensionPipeline::register`] cannot have its invalidation overwritten
    /// by a map built before it.
    pub fn rebuild(&self) -> Arc<ListenerMap> {
        let registry = self.registry.read();
        let map = Arc::new(ListenerMap::build(&registry));
        *self.listeners.write() = Some(Arc::clone(&map));
        tracing::debug!(extensions = registry.len(), "extension listener map built");
        map
    }

    /// Whether the listener map is currently built.
    pub fn is_built(&self) -> bool {
        self.listeners.read().is_some()
    }

    /// The current listener map, building it on first use.
    pub fn listeners(&self) -> Arc<ListenerMap> {
        if let Some(map) = self.listeners.read().as_ref() {
            return Arc::clone(map);
        }
        self.rebuild()
    }

    /// URNs of every registered extension, in registration order.
    pub fn extension_urns(&self) -> Vec<String> {
        self.registry.read().urns().into_iter().map(str::to_owned).collect()
    }

    /// Dispatches `event` to every listener that should run for it.
    ///
    /// Returns the error of a failing fatal listener. Stops early, returning
    /// `Ok`, as soon as a listener stops propagation.
    pub async fn dispatch(&self, event: &mut LifecycleEvent<'_>) -> Result<DispatchReport, ForrstError> {
        let map = self.listeners();
        let kind = event.kind();
        let mut report = DispatchReport::default();

        for listener in map.listeners(kind) {
            if !listener.should_run(event) {
                continue;
            }
            let urn = listener.urn();
            report.invoked.push(urn.to_owned());

            if let Err(error) = extension::invoke(listener.extension.as_ref(), event).await {
                if listener.extension.is_error_fatal() {
                    tracing::error!(extension = %urn, event = %kind, error = %error, "fatal extension failure");
                    return Err(error);
                }
                tracing::warn!(extension = %urn, event = %kind, error = %error, "extension failed; continuing");
                report.warnings.push(ExtensionWarning {
                    extension: urn.to_owned(),
                    event: kind.as_str().to_owned(),
                    message: error.to_string(),
                });
            }

            if event.is_propagation_stopped() {
                tracing::debug!(extension = %urn, event = %kind, "propagation stopped");
                report.stopped_by = Some(urn.to_owned());
                break;
            }
        }

        Ok(report)
    }
}

impl std::fmt::Debug for ExtensionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionPipeline")
            .field("registry", &*self.registry.read())
            .field("built", &self.is_built())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use protocol::{ErrorCode, ExtensionObject, RequestObject, ResponseObject};
    use serde_json::json;

    use super::*;
    use crate::extension::Subscription;
    use crate::state::RequestState;

    type Journal = Arc<Mutex<Vec<String>>>;

    enum Behaviour {
        Record,
        Fail,
        Stop,
    }

    struct RecordingExtension {
        urn: String,
        priority: i32,
        global: bool,
        fatal: bool,
        behaviour: Behaviour,
        journal: Journal,
    }

    impl RecordingExtension {
        fn new(urn: impl Into<String>, priority: i32, journal: &Journal) -> Self {
            Self {
                urn: urn.into(),
                priority,
                global: true,
                fatal: true,
                behaviour: Behaviour::Record,
                journal: Arc::clone(journal),
            }
        }

        fn declared_only(mut self) -> Self {
            self.global = false;
            self
        }

        fn failing(mut self, fatal: bool) -> Self {
            self.behaviour = Behaviour::Fail;
            self.fatal = fatal;
            self
        }

        fn stopping(mut self) -> Self {
            self.behaviour = Behaviour::Stop;
            self
        }
    }

    #[async_trait]
    impl Extension for RecordingExtension {
        fn urn(&self) -> &str {
            &self.urn
        }

        fn is_global(&self) -> bool {
            self.global
        }

        fn is_error_fatal(&self) -> bool {
            self.fatal
        }

        fn subscriptions(&self) -> Vec<Subscription> {
            vec![
                Subscription::new(EventKind::RequestValidated, self.priority),
                Subscription::new(EventKind::SendingResponse, self.priority),
            ]
        }

        async fn on_request_validated(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
            self.journal.lock().push(self.urn.clone());
            match self.behaviour {
                Behaviour::Record => Ok(()),
                Behaviour::Fail => Err(ForrstError::new(ErrorCode::Unavailable, "injected failure")),
                Behaviour::Stop => {
                    event.respond(ResponseObject::success(event.request().id.clone(), json!("stopped")));
                    Ok(())
                }
            }
        }
    }

    fn pipeline(extensions: Vec<RecordingExtension>) -> ExtensionPipeline {
        let mut registry = ExtensionRegistry::new();
        for extension in extensions {
            registry.register(Arc::new(extension)).unwrap();
        }
        ExtensionPipeline::new(registry)
    }

    async fn dispatch_validated(
        pipeline: &ExtensionPipeline,
        request: &RequestObject,
    ) -> (Result<DispatchReport, ForrstError>, Option<ResponseObject>) {
        let mut state = RequestState::new();
        let mut event = LifecycleEvent::request_validated(request, &mut state);
        let result = pipeline.dispatch(&mut event).await;
        (result, event.into_response())
    }

    #[tokio::test]
    async fn runs_in_ascending_priority_then_registration_order() {
        let journal = Journal::default();
        let pipeline = pipeline(vec![
            RecordingExtension::new("urn:x:ext:late", 50, &journal),
            RecordingExtension::new("urn:x:ext:tie-first", 10, &journal),
            RecordingExtension::new("urn:x:ext:early", -5, &journal),
            RecordingExtension::new("urn:x:ext:tie-second", 10, &journal),
        ]);
        let request = RequestObject::new("r1", "urn:x:fn:echo");

        for _ in 0..3 {
            journal.lock().clear();
            let (result, _) = dispatch_validated(&pipeline, &request).await;
            result.unwrap();
            assert_eq!(
                *journal.lock(),
                [
                    "urn:x:ext:early",
                    "urn:x:ext:tie-first",
                    "urn:x:ext:tie-second",
                    "urn:x:ext:late"
                ]
            );
        }
    }

    #[tokio::test]
    async fn non_global_extensions_run_only_when_declared() {
        let journal = Journal::default();
        let pipeline = pipeline(vec![
            RecordingExtension::new("urn:x:ext:global", 1, &journal),
            RecordingExtension::new("urn:x:ext:opt-in", 2, &journal).declared_only(),
        ]);

        let plain = RequestObject::new("r1", "urn:x:fn:echo");
        dispatch_validated(&pipeline, &plain).await.0.unwrap();
        assert_eq!(*journal.lock(), ["urn:x:ext:global"]);

        journal.lock().clear();
        let declaring = RequestObject::new("r2", "urn:x:fn:echo")
            .with_extension(ExtensionObject::request("urn:x:ext:opt-in", None));
        dispatch_validated(&pipeline, &declaring).await.0.unwrap();
        assert_eq!(*journal.lock(), ["urn:x:ext:global", "urn:x:ext:opt-in"]);
    }

    #[tokio::test]
    async fn non_fatal_failures_are_recorded_and_dispatch_continues() {
        let journal = Journal::default();
        let pipeline = pipeline(vec![
            RecordingExtension::new("urn:x:ext:flaky", 1, &journal).failing(false),
            RecordingExtension::new("urn:x:ext:after", 2, &journal),
        ]);
        let request = RequestObject::new("r1", "urn:x:fn:echo");

        let report = dispatch_validated(&pipeline, &request).await.0.unwrap();

        assert_eq!(*journal.lock(), ["urn:x:ext:flaky", "urn:x:ext:after"]);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].extension, "urn:x:ext:flaky");
        assert_eq!(report.warnings[0].event, "request_validated");
    }

    #[tokio::test]
    async fn fatal_failures_abort_dispatch() {
        let journal = Journal::default();
        let pipeline = pipeline(vec![
            RecordingExtension::new("urn:x:ext:broken", 1, &journal).failing(true),
            RecordingExtension::new("urn:x:ext:after", 2, &journal),
        ]);
        let request = RequestObject::new("r1", "urn:x:fn:echo");

        let err = dispatch_validated(&pipeline, &request).await.0.unwrap_err();

        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert_eq!(*journal.lock(), ["urn:x:ext:broken"]);
    }

    #[tokio::test]
    async fn stop_propagation_ends_only_the_current_dispatch() {
        let journal = Journal::default();
        let pipeline = pipeline(vec![
            RecordingExtension::new("urn:x:ext:gate", 1, &journal).stopping(),
            RecordingExtension::new("urn:x:ext:after", 2, &journal),
        ]);
        let request = RequestObject::new("r1", "urn:x:fn:echo");

        let (result, response) = dispatch_validated(&pipeline, &request).await;
        let report = result.unwrap();

        assert_eq!(report.stopped_by.as_deref(), Some("urn:x:ext:gate"));
        assert_eq!(report.invoked, ["urn:x:ext:gate"]);
        assert_eq!(response.unwrap().result, Some(json!("stopped")));

        // A later event is dispatched independently.
        let mut state = RequestState::new();
        let mut sending = LifecycleEvent::sending_response(
            &request,
            &mut state,
            ResponseObject::success("r1", json!(1)),
        );
        let report = pipeline.dispatch(&mut sending).await.unwrap();
        assert_eq!(report.invoked, ["urn:x:ext:gate", "urn:x:ext:after"]);
    }

    #[tokio::test]
    async fn listener_map_is_cached_until_registration_invalidates_it() {
        let journal = Journal::default();
        let pipeline = pipeline(vec![RecordingExtension::new("urn:x:ext:a", 5, &journal)]);
        assert!(!pipeline.is_built());

        let first = pipeline.listeners();
        let second = pipeline.listeners();
        assert!(Arc::ptr_eq(&first, &second));

        pipeline
            .register(Arc::new(RecordingExtension::new("urn:x:ext:b", 1, &journal)))
            .unwrap();
        assert!(!pipeline.is_built());
        assert_eq!(
            pipeline.listeners().describe(EventKind::RequestValidated),
            [("urn:x:ext:b".to_owned(), 1), ("urn:x:ext:a".to_owned(), 5)]
        );
        assert!(pipeline.listeners().describe(EventKind::FunctionExecuted).is_empty());
    }

    #[test]
    fn concurrent_rebuilds_never_keep_a_map_older_than_the_last_registration() {
        let journal = Journal::default();
        let pipeline = Arc::new(pipeline(Vec::new()));
        let done = Arc::new(AtomicBool::new(false));

        let rebuilders: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        pipeline.rebuild();
                    }
                })
            })
            .collect();

        for n in 0..200 {
            pipeline
                .register(Arc::new(RecordingExtension::new(format!("urn:x:ext:{n}"), n, &journal)))
                .unwrap();
        }
        done.store(true, Ordering::Release);
        for rebuilder in rebuilders {
            rebuilder.join().unwrap();
        }

        assert_eq!(pipeline.listeners().describe(EventKind::RequestValidated).len(), 200);
    }
}
