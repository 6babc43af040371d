//! Port traits implemented by infrastructure crates.
//!
//! The engine only ever sees these traits; the JSON codec, the in-memory
//! stores and the function registry are supplied by adapter crates at the
//! composition root.

pub mod cache;
pub mod codec;
pub mod operations;
pub mod resolver;

pub use cache::{CacheLock, CacheStore, StoreError};
pub use codec::{CodecError, ProtocolCodec};
pub use operations::{Operation, OperationPage, OperationQuery, OperationRepository, OperationStatus};
pub use resolver::{Function, FunctionOutput, FunctionResolver};
