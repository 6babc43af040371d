//! Function resolution contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::envelope::{RequestObject, ResponseObject};
use crate::errors::ForrstError;

/// What a function hands back to the request handler.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionOutput {
    /// A typed result. Wrapped in a response that flows through the
    /// function-executed and sending-response stages.
    Result(Value),

    /// A complete typed response, e.g. one already carrying extension
    /// annotations. Its `id` is replaced with the request's; otherwise it
    /// flows like [`FunctionOutput::Result`].
    Response(ResponseObject),

    /// A raw structured value, reserved for introspection and system
    /// functions. Wrapped and returned directly, bypassing the
    /// function-executed and sending-response stages.
    Raw(Value),
}

/// A callable protocol function.
#[async_trait]
pub trait Function: Send + Sync {
    /// Invokes the function for a validated request.
    async fn call(&self, request: &RequestObject) -> Result<FunctionOutput, ForrstError>;
}

/// Resolves a function URN (and optional version) to a callable.
pub trait FunctionResolver: Send + Sync {
    /// Returns the callable for `urn`. With `version == None` the resolver
    /// picks its preferred (latest) version.
    ///
    /// Unknown functions and versions are reported as
    /// [`crate::ErrorCode::FunctionNotFound`] / [`crate::ErrorCode::VersionNotFound`].
    fn resolve(&self, urn: &str, version: Option<&str>) -> Result<Arc<dyn Function>, ForrstError>;
}
