//! Forrst function registry and built-in system functions.
//!
//! Implements [`protocol::FunctionResolver`] over functions registered through
//! an explicit builder. Descriptors are plain data assembled once at build
//! time; nothing is discovered lazily.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Applications register their functions here and hand the
//! built [`FunctionRegistry`] to the request handler as its resolver.

mod registry;
pub mod system;

pub use registry::{
    function_fn, FnFunction, FunctionDescriptor, FunctionRegistry, FunctionRegistryBuilder,
    RegistryError,
};
