//! Forrst request lifecycle.
//!
//! This crate owns the extension contract, the extension registry, the
//! priority-ordered dispatch pipeline and the request handler that drives a
//! request from raw input to encoded response.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The handler sequences calls between the protocol
//! rules in the [`protocol`] crate and the ports (codec, function resolver)
//! supplied by infrastructure crates. It contains no protocol rules of its own.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`event`] | Lifecycle event kinds and the mutable event passed to listeners |
//! | [`state`] | Per-request extension context and finalizers |
//! | [`extension`] | The [`Extension`] trait and subscriptions |
//! | [`registry`] | [`ExtensionRegistry`] |
//! | [`pipeline`] | [`ExtensionPipeline`]: listener map and dispatch |
//! | [`handler`] | [`RequestHandler`] and [`HandlerConfig`] |

pub mod event;
pub mod extension;
pub mod handler;
pub mod pipeline;
pub mod registry;
pub mod state;

pub use event::{EventKind, LifecycleEvent};
pub use extension::{Extension, Subscription};
pub use handler::{HandlerConfig, RequestHandler};
pub use pipeline::{DispatchReport, ExtensionPipeline, ExtensionWarning, Listener, ListenerMap};
pub use registry::{ExtensionRegistry, RegistrationError};
pub use state::{Finalizer, RequestState};
