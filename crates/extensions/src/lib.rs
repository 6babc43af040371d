//! Forrst lifecycle extensions.
//!
//! | Module | Extension | Priority |
//! |--------|-----------|----------|
//! | [`deadline`] | `urn:forrst:ext:deadline` | 10 |
//! | [`idempotency`] | `urn:forrst:ext:idempotency` | 25 |
//! | [`caching`] | `urn:forrst:ext:caching` | not subscribed; a toolkit functions call |
//!
//! None of these extensions is global: each acts only on requests that declare
//! its URN, and only on the invocation dispatched for it.
//!
//! ## Architectural Layer
//!
//! **Plug-ins.** Extensions depend on the [`engine`] contract and on
//! [`protocol`] ports; storage is injected as a [`protocol::CacheStore`].

pub mod caching;
pub mod deadline;
mod digest;
pub mod idempotency;

pub use caching::{CachingExtension, ConditionalOptions, CACHING_URN};
pub use deadline::{DeadlineContext, DeadlineExtension, DEADLINE_PRIORITY, DEADLINE_URN};
pub use idempotency::{
    IdempotencyExtension, IdempotencyRecord, IDEMPOTENCY_PRIORITY, IDEMPOTENCY_URN,
};

/// JSON pointer to option `name` of the first invocation of `urn` on `request`.
pub(crate) fn option_pointer(request: &protocol::RequestObject, urn: &str, name: &str) -> String {
    match request.extensions().iter().position(|ext| ext.urn == urn) {
        Some(index) => format!("/extensions/{index}/options/{name}"),
        None => format!("/extensions/options/{name}"),
    }
}
