//! Wire codec contract.

use serde_json::Value;
use thiserror::Error;

use crate::envelope::ResponseObject;

/// Failures raised by a [`ProtocolCodec`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload could not be decoded into a structure.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// The envelope could not be encoded.
    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

/// Decodes wire payloads into a generic structure and encodes responses.
///
/// Decoding deliberately stops at [`Value`]: shape checks (no batches, no
/// empty objects) and schema validation belong to the request handler so that
/// every codec reports them identically.
pub trait ProtocolCodec: Send + Sync {
    /// Short name of the wire format (e.g. `"json"`), used in logs.
    fn format(&self) -> &'static str;

    /// Decodes a raw payload.
    fn decode(&self, raw: &str) -> Result<Value, CodecError>;

    /// Encodes a response envelope.
    fn encode(&self, response: &ResponseObject) -> Result<String, CodecError>;
}
