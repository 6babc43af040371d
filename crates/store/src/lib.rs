//! Forrst in-memory infrastructure adapters.
//!
//! Implements [`protocol::CacheStore`] / [`protocol::CacheLock`] and
//! [`protocol::OperationRepository`] for single-process deployments and tests.
//! Networked stores are added as further implementations of the same ports.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** All shared mutable state lives behind `parking_lot`
//! locks inside these types, and no guard is ever held across an `.await`.
//! Expiry uses the tokio clock, so paused-clock tests can drive TTLs.

mod memory;
mod operations;

pub use memory::{MemoryLock, MemoryStore};
pub use operations::MemoryOperationRepository;
