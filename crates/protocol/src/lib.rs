//! Core protocol domain for Forrst.
//!
//! This crate contains every envelope type, newtype identifier, shared value
//! type, error code and port trait used throughout the engine. Infrastructure
//! crates implement the traits defined here; they never add protocol rules.
//!
//! ## Architectural Layer
//!
//! **Domain + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; adapter crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`envelope`] | Request / response envelopes, extension invocations, wire errors |
//! | [`validation`] | Envelope schema validation |
//! | [`errors`] | Error codes, retry policy, [`ForrstError`] |
//! | [`identifiers`] | Newtype identifiers (`RequestId`, `IdempotencyKey`, etc.) |
//! | [`types`] | Shared value types (`DurationValue`, `Timestamp`) |
//! | [`ports`] | Codec, function resolver, cache/lock store, operation repository |

pub mod envelope;
pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod types;
pub mod validation;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use envelope::{
    CallObject, ErrorObject, ErrorSource, ExtensionObject, ProtocolInfo, RequestObject,
    ResponseObject, PROTOCOL_NAME, PROTOCOL_VERSION,
};
pub use errors::{ErrorCode, FieldViolation, ForrstError, RetryPolicy, UnknownErrorCode};
pub use identifiers::{CallerId, Cursor, IdempotencyKey, OperationId, RequestId};
pub use ports::{
    CacheLock, CacheStore, CodecError, Function, FunctionOutput, FunctionResolver, Operation,
    OperationPage, OperationQuery, OperationRepository, OperationStatus, ProtocolCodec, StoreError,
};
pub use types::{DurationParseError, DurationValue, TimeUnit, Timestamp};
