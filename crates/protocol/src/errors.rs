//! Error codes, retry semantics, and the domain error type.
//!
//! [`ErrorCode`] is the fixed enumeration carried on the wire; each code maps
//! deterministically to an HTTP-style status and a [`RetryPolicy`].
//! [`ForrstError`] is what functions, extensions and adapters return; the
//! request handler turns it into response [`ErrorObject`]s.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::Location;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::envelope::{ErrorObject, ErrorSource};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The call may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The call must not be retried unchanged.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// The fixed set of error codes a response may carry.
///
/// Not extensible at runtime: a code that is not listed here cannot appear in
/// a well-formed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The payload could not be decoded.
    ParseError,
    /// The decoded payload is not a single request object (empty, a list, a scalar).
    InvalidRequest,
    /// The request object violates the envelope schema.
    SchemaValidationFailed,
    /// The call or extension options carry invalid values.
    InvalidArguments,
    Unauthorized,
    Forbidden,
    NotFound,
    FunctionNotFound,
    VersionNotFound,
    /// The caller's deadline passed before the function could run.
    DeadlineExceeded,
    /// The idempotency key was reused with different arguments.
    IdempotencyConflict,
    /// Another request holding the same idempotency key is still executing.
    IdempotencyProcessing,
    RateLimited,
    InternalError,
    Unavailable,
}

impl ErrorCode {
    /// Every code, in declaration order.
    pub const ALL: [ErrorCode; 15] = [
        Self::ParseError,
        Self::InvalidRequest,
        Self::SchemaValidationFailed,
        Self::InvalidArguments,
        Self::Unauthorized,
        Self::Forbidden,
        Self::NotFound,
        Self::FunctionNotFound,
        Self::VersionNotFound,
        Self::DeadlineExceeded,
        Self::IdempotencyConflict,
        Self::IdempotencyProcessing,
        Self::RateLimited,
        Self::InternalError,
        Self::Unavailable,
    ];

    /// Returns the wire name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::SchemaValidationFailed => "SCHEMA_VALIDATION_FAILED",
            Self::InvalidArguments => "INVALID_ARGUMENTS",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::FunctionNotFound => "FUNCTION_NOT_FOUND",
            Self::VersionNotFound => "VERSION_NOT_FOUND",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::IdempotencyProcessing => "IDEMPOTENCY_PROCESSING",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Unavailable => "UNAVAILABLE",
        }
    }

    /// HTTP-style status associated with the code.
    pub fn status(self) -> u16 {
        match self {
            Self::ParseError
            | Self::InvalidRequest
            | Self::SchemaValidationFailed
            | Self::InvalidArguments => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound | Self::FunctionNotFound | Self::VersionNotFound => 404,
            Self::DeadlineExceeded => 408,
            Self::IdempotencyConflict | Self::IdempotencyProcessing => 409,
            Self::RateLimited => 429,
            Self::InternalError => 500,
            Self::Unavailable => 503,
        }
    }

    /// Retry guidance associated with the code.
    pub fn retry_policy(self) -> RetryPolicy {
        match self {
            Self::IdempotencyProcessing => RetryPolicy::Retryable {
                after: Some(Duration::from_secs(1)),
            },
            Self::DeadlineExceeded | Self::RateLimited | Self::Unavailable => {
                RetryPolicy::Retryable { after: None }
            }
            _ => RetryPolicy::NonRetryable,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UnknownErrorCode(s.to_owned()))
    }
}

/// Returned when parsing a string that is not a known [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown error code '{0}'")]
pub struct UnknownErrorCode(pub String);

// ---------------------------------------------------------------------------
// Validation violations
// ---------------------------------------------------------------------------

/// A single envelope schema violation, located by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub pointer: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain error
// ---------------------------------------------------------------------------

/// Errors raised anywhere in the request lifecycle.
///
/// Every variant becomes a response; none of them escape the request handler.
#[derive(Debug, Error)]
pub enum ForrstError {
    /// A recognised domain failure with its own code and payload, returned to
    /// the caller as-is.
    #[error("{code}: {message}")]
    Protocol {
        code: ErrorCode,
        message: String,
        pointer: Option<String>,
        details: Option<Map<String, Value>>,
    },

    /// The request object violated the envelope schema. Lists every violation.
    #[error("Request validation failed with {} violation(s)", .violations.len())]
    Validation { violations: Vec<FieldViolation> },

    /// The caller could not be authenticated.
    #[error("Authentication failed: {reason}")]
    Unauthenticated { reason: String },

    /// The caller is authenticated but not permitted to perform the call.
    #[error("Authorization failed: {reason}")]
    AccessDenied { reason: String },

    /// Anything unrecognised. Surfaced as a generic internal error; the cause
    /// and construction site only appear in debug mode.
    #[error("Internal error: {source}")]
    Internal {
        source: Box<dyn std::error::Error + Send + Sync>,
        location: &'static Location<'static>,
        trace: Arc<Backtrace>,
    },
}

impl ForrstError {
    /// Creates a domain error with the given code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            pointer: None,
            details: None,
        }
    }

    /// Shorthand for [`ErrorCode::InvalidArguments`] located at `pointer`.
    pub fn invalid_arguments(pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArguments, message).with_pointer(pointer)
    }

    /// Wraps an unrecognised failure, recording where it was raised.
    #[track_caller]
    pub fn internal(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Internal {
            source: source.into(),
            location: Location::caller(),
            trace: Arc::new(Backtrace::capture()),
        }
    }

    /// Attaches a JSON pointer to a [`ForrstError::Protocol`] error.
    pub fn with_pointer(mut self, new_pointer: impl Into<String>) -> Self {
        if let Self::Protocol { pointer, .. } = &mut self {
            *pointer = Some(new_pointer.into());
        }
        self
    }

    /// Attaches structured details to a [`ForrstError::Protocol`] error.
    pub fn with_details(mut self, new_details: Map<String, Value>) -> Self {
        if let Self::Protocol { details, .. } = &mut self {
            *details = Some(new_details);
        }
        self
    }

    /// The wire code this error surfaces as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::Validation { .. } => ErrorCode::SchemaValidationFailed,
            Self::Unauthenticated { .. } => ErrorCode::Unauthorized,
            Self::AccessDenied { .. } => ErrorCode::Forbidden,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// HTTP-style status of the error.
    pub fn status(&self) -> u16 {
        self.code().status()
    }

    /// Retry guidance for the error.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.code().retry_policy()
    }

    /// Renders the error as response error objects.
    ///
    /// Authentication and authorization failures use fixed messages so the
    /// reason never leaks. Internal errors embed `details.debug` (message, file,
    /// line, backtrace) only when `debug` is set.
    pub fn to_error_objects(&self, debug: bool) -> Vec<ErrorObject> {
        match self {
            Self::Protocol {
                code,
                message,
                pointer,
                details,
            } => vec![ErrorObject {
                code: *code,
                message: message.clone(),
                source: pointer.clone().map(ErrorSource::new),
                details: details.clone(),
            }],
            Self::Validation { violations } => violations
                .iter()
                .map(|violation| ErrorObject {
                    code: ErrorCode::SchemaValidationFailed,
                    message: violation.message.clone(),
                    source: Some(ErrorSource::new(violation.pointer.clone())),
                    details: None,
                })
                .collect(),
            Self::Unauthenticated { .. } => {
                vec![ErrorObject::new(ErrorCode::Unauthorized, "Unauthorized")]
            }
            Self::AccessDenied { .. } => vec![ErrorObject::new(ErrorCode::Forbidden, "Forbidden")],
            Self::Internal {
                source,
                location,
                trace,
            } => {
                let mut error = ErrorObject::new(ErrorCode::InternalError, "Internal server error");
                if debug {
                    let mut debug_details = Map::new();
                    debug_details.insert("message".into(), json!(source.to_string()));
                    debug_details.insert("file".into(), json!(location.file()));
                    debug_details.insert("line".into(), json!(location.line()));
                    if trace.status() == BacktraceStatus::Captured {
                        let frames: Vec<String> =
                            trace.to_string().lines().map(str::to_owned).collect();
                        debug_details.insert("stack".into(), json!(frames));
                    }
                    let mut details = Map::new();
                    details.insert("debug".into(), Value::Object(debug_details));
                    error.details = Some(details);
                }
                vec![error]
            }
        }
    }
}

impl From<serde_json::Error> for ForrstError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::internal(err)
    }
}
