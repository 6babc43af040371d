//! Forrst JSON wire codec.
//!
//! Implements [`protocol::ProtocolCodec`] over `serde_json`. Other wire
//! formats are added as further implementations in this crate without any
//! change to the `protocol` or `engine` crates.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Byte-level encoding and decoding live here. The engine
//! sees only [`protocol::ProtocolCodec`].

mod json;

pub use json::JsonCodec;
