//! The extension contract.
//!
//! An extension declares the events it subscribes to and at which priority;
//! each event kind is bound at compile time to one trait method, so a
//! subscription can never name a handler that does not exist.

use async_trait::async_trait;
use protocol::ForrstError;

use crate::event::{EventKind, LifecycleEvent};

/// One event subscription of an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub event: EventKind,
    /// Lower values run earlier.
    pub priority: i32,
}

impl Subscription {
    pub fn new(event: EventKind, priority: i32) -> Self {
        Self { event, priority }
    }
}

/// A pluggable unit observing and rewriting the request lifecycle.
///
/// Handlers for events the extension does not subscribe to are never called,
/// so extensions only override the methods they subscribe with.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Stable identifier, e.g. `urn:forrst:ext:deadline`.
    fn urn(&self) -> &str;

    /// Global extensions run on every request; others only when the request
    /// names their URN in `extensions[]`.
    fn is_global(&self) -> bool {
        false
    }

    /// When `true`, a handler failure aborts the request. When `false`, it is
    /// logged and dispatch continues.
    fn is_error_fatal(&self) -> bool {
        true
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        Vec::new()
    }

    async fn on_request_validated(&self, _event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        Ok(())
    }

    async fn on_executing_function(
        &self,
        _event: &mut LifecycleEvent<'_>,
    ) -> Result<(), ForrstError> {
        Ok(())
    }

    async fn on_function_executed(&self, _event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        Ok(())
    }

    async fn on_sending_response(&self, _event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        Ok(())
    }
}

/// Routes an event to the handler method bound to its kind.
pub(crate) async fn invoke(
    extension: &dyn Extension,
    event: &mut LifecycleEvent<'_>,
) -> Result<(), ForrstError> {
    match event.kind() {
        EventKind::RequestValidated => extension.on_request_validated(event).await,
        EventKind::ExecutingFunction => extension.on_executing_function(event).await,
        EventKind::FunctionExecuted => extension.on_function_executed(event).await,
        EventKind::SendingResponse => extension.on_sending_response(event).await,
    }
}
