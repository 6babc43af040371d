//! Lifecycle events dispatched to extensions.

use std::fmt;

use protocol::{ExtensionObject, ForrstError, RequestObject, ResponseObject};
use serde_json::{Map, Value};

use crate::state::RequestState;

/// The four fixed dispatch points of the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// The envelope passed validation. Dispatched once.
    RequestValidated,
    /// About to call the function. Dispatched once per declared extension.
    ExecutingFunction,
    /// The function returned. Dispatched once per declared extension.
    FunctionExecuted,
    /// The response is about to leave the handler. Dispatched once.
    SendingResponse,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        Self::RequestValidated,
        Self::ExecutingFunction,
        Self::FunctionExecuted,
        Self::SendingResponse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestValidated => "request_validated",
            Self::ExecutingFunction => "executing_function",
            Self::FunctionExecuted => "function_executed",
            Self::SendingResponse => "sending_response",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutable lifecycle event.
///
/// Created by the request handler immediately before dispatch and consumed
/// immediately after. Listeners may replace the response and stop propagation
/// for the current dispatch; they can never remove the response of a
/// post-execution event.
pub struct LifecycleEvent<'a> {
    kind: EventKind,
    request: &'a RequestObject,
    state: &'a mut RequestState,
    extension: Option<ExtensionObject>,
    response: Option<ResponseObject>,
    propagation_stopped: bool,
}

impl<'a> LifecycleEvent<'a> {
    pub fn request_validated(request: &'a RequestObject, state: &'a mut RequestState) -> Self {
        Self::new(EventKind::RequestValidated, request, state, None, None)
    }

    pub fn executing_function(
        request: &'a RequestObject,
        state: &'a mut RequestState,
        extension: ExtensionObject,
    ) -> Self {
        Self::new(EventKind::ExecutingFunction, request, state, Some(extension), None)
    }

    pub fn function_executed(
        request: &'a RequestObject,
        state: &'a mut RequestState,
        extension: ExtensionObject,
        response: ResponseObject,
    ) -> Self {
        Self::new(
            EventKind::FunctionExecuted,
            request,
            state,
            Some(extension),
            Some(response),
        )
    }

    pub fn sending_response(
        request: &'a RequestObject,
        state: &'a mut RequestState,
        response: ResponseObject,
    ) -> Self {
        Self::new(EventKind::SendingResponse, request, state, None, Some(response))
    }

    fn new(
        kind: EventKind,
        request: &'a RequestObject,
        state: &'a mut RequestState,
        extension: Option<ExtensionObject>,
        response: Option<ResponseObject>,
    ) -> Self {
        Self {
            kind,
            request,
            state,
            extension,
            response,
            propagation_stopped: false,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn request(&self) -> &'a RequestObject {
        self.request
    }

    /// The extension invocation this event was dispatched for.
    ///
    /// Only set for [`EventKind::ExecutingFunction`] and
    /// [`EventKind::FunctionExecuted`].
    pub fn extension(&self) -> Option<&ExtensionObject> {
        self.extension.as_ref()
    }

    /// Returns the invocation if this event was dispatched for `urn`.
    pub fn invocation_for(&self, urn: &str) -> Option<&ExtensionObject> {
        self.extension.as_ref().filter(|ext| ext.urn == urn)
    }

    /// Options of the invocation this event was dispatched for.
    pub fn options(&self) -> Option<&Map<String, Value>> {
        self.extension.as_ref().and_then(|ext| ext.options.as_ref())
    }

    pub fn state(&self) -> &RequestState {
        &*self.state
    }

    /// Whether this is the first event of its kind to reach `urn` in the
    /// request. Extensions that act once per request, whichever of their
    /// invocations triggered the dispatch, guard on this.
    pub fn first_visit(&mut self, urn: &str) -> bool {
        self.state.first_visit(urn, self.kind)
    }

    pub fn state_mut(&mut self) -> &mut RequestState {
        &mut *self.state
    }

    /// The current response: the override before execution, the function's
    /// (possibly rewritten) response after it.
    pub fn response(&self) -> Option<&ResponseObject> {
        self.response.as_ref()
    }

    /// Sets or replaces the response.
    pub fn set_response(&mut self, response: ResponseObject) {
        self.response = Some(response);
    }

    /// Applies `f` to the current response, if there is one.
    pub fn map_response(&mut self, f: impl FnOnce(ResponseObject) -> ResponseObject) {
        if let Some(response) = self.response.take() {
            self.response = Some(f(response));
        }
    }

    /// Sets `response` and stops propagation: the short-circuit.
    pub fn respond(&mut self, response: ResponseObject) {
        self.set_response(response);
        self.stop_propagation();
    }

    /// Short-circuits with an error response for `error`.
    pub fn reject(&mut self, error: &ForrstError) {
        let response = ResponseObject::from_error(self.request.id.clone(), error, false);
        self.respond(response);
    }

    /// Stops dispatch of this event to later listeners. Later lifecycle events
    /// still fire.
    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }

    /// Consumes the event, yielding its response.
    pub fn into_response(self) -> Option<ResponseObject> {
        self.response
    }
}

impl fmt::Debug for LifecycleEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleEvent")
            .field("kind", &self.kind)
            .field("request_id", &self.request.id)
            .field("extension", &self.extension.as_ref().map(|ext| ext.urn.as_str()))
            .field("has_response", &self.response.is_some())
            .field("propagation_stopped", &self.propagation_stopped)
            .finish()
    }
}
