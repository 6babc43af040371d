//! JSON wire codec.

use protocol::{CodecError, ProtocolCodec, ResponseObject};
use serde::Serialize;
use serde_json::Value;

/// JSON codec.
///
/// Compact output by default; [`JsonCodec::pretty`] indents for humans.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    pretty: bool,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    /// Encodes any serialisable envelope, e.g. a request for a client.
    pub fn encode_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CodecError> {
        let encoded = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        encoded.map_err(|err| CodecError::Encode(err.to_string()))
    }

    /// Decodes a raw response, e.g. on the client side of a call.
    pub fn decode_response(&self, raw: &str) -> Result<ResponseObject, CodecError> {
        serde_json::from_str(raw).map_err(|err| CodecError::Malformed(err.to_string()))
    }
}

impl ProtocolCodec for JsonCodec {
    fn format(&self) -> &'static str {
        "json"
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        serde_json::from_str(raw).map_err(|err| {
            tracing::debug!(error = %err, line = err.line(), column = err.column(), "malformed JSON payload");
            CodecError::Malformed(err.to_string())
        })
    }

    fn encode(&self, response: &ResponseObject) -> Result<String, CodecError> {
        self.encode_value(response)
    }
}
