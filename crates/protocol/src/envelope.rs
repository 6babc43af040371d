//! Request and response envelopes.
//!
//! A request is always a single object; there is no batch form. A response
//! carries either `result` or `errors`, never both, plus any extension
//! annotations and handler metadata.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::{ErrorCode, ForrstError};
use crate::types::DurationValue;

/// Protocol name every envelope must declare.
pub const PROTOCOL_NAME: &str = "forrst";

/// Protocol version every envelope must declare.
pub const PROTOCOL_VERSION: &str = "1.0";

/// The `protocol` member of every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub name: String,
    pub version: String,
}

impl ProtocolInfo {
    /// The protocol this deployment speaks.
    pub fn current() -> Self {
        Self {
            name: PROTOCOL_NAME.to_owned(),
            version: PROTOCOL_VERSION.to_owned(),
        }
    }
}

impl Default for ProtocolInfo {
    fn default() -> Self {
        Self::current()
    }
}

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

/// An extension invocation.
///
/// On a request it names an extension and carries the caller's `options`; on a
/// response it carries the `data` an extension chose to annotate it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionObject {
    pub urn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl ExtensionObject {
    /// A request-side invocation.
    pub fn request(urn: impl Into<String>, options: Option<Map<String, Value>>) -> Self {
        Self {
            urn: urn.into(),
            options,
            data: None,
        }
    }

    /// A response-side annotation.
    pub fn response(urn: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            urn: urn.into(),
            options: None,
            data: Some(data),
        }
    }

    /// Looks up a single option.
    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.as_ref().and_then(|options| options.get(key))
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// The `call` member of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallObject {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

/// A validated request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestObject {
    pub protocol: ProtocolInfo,
    pub id: String,
    pub call: CallObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<ExtensionObject>>,
}

impl RequestObject {
    /// Creates a request for `function` with no arguments.
    pub fn new(id: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            protocol: ProtocolInfo::current(),
            id: id.into(),
            call: CallObject {
                function: function.into(),
                version: None,
                arguments: None,
            },
            context: None,
            extensions: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.call.version = Some(version.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.call.arguments = Some(arguments);
        self
    }

    pub fn with_extension(mut self, extension: ExtensionObject) -> Self {
        self.extensions.get_or_insert_with(Vec::new).push(extension);
        self
    }

    /// Extension invocations declared on the request, in declaration order.
    pub fn extensions(&self) -> &[ExtensionObject] {
        self.extensions.as_deref().unwrap_or_default()
    }

    /// The first invocation of the extension identified by `urn`, if declared.
    pub fn extension(&self, urn: &str) -> Option<&ExtensionObject> {
        self.extensions().iter().find(|ext| ext.urn == urn)
    }

    /// Whether the request names the extension identified by `urn`.
    pub fn declares_extension(&self, urn: &str) -> bool {
        self.extension(urn).is_some()
    }

    /// Looks up a single call argument.
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.call.arguments.as_ref().and_then(|args| args.get(name))
    }
}

// ---------------------------------------------------------------------------
// Errors on the wire
// ---------------------------------------------------------------------------

/// Location of the offending input, as a JSON pointer into the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSource {
    pub pointer: String,
}

impl ErrorSource {
    pub fn new(pointer: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
        }
    }
}

/// A single error in a response's `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            details: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseObject {
    pub protocol: ProtocolInfo,
    pub id: String,
    /// `Some(Value::Null)` is a legitimate result and is kept distinct from an
    /// absent result across encode/decode.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<ExtensionObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ResponseObject {
    /// A successful response carrying `result`.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            protocol: ProtocolInfo::current(),
            id: id.into(),
            result: Some(result),
            errors: None,
            extensions: None,
            meta: None,
        }
    }

    /// An error response. `errors` should not be empty.
    pub fn failure(id: impl Into<String>, errors: Vec<ErrorObject>) -> Self {
        Self {
            protocol: ProtocolInfo::current(),
            id: id.into(),
            result: None,
            errors: Some(errors),
            extensions: None,
            meta: None,
        }
    }

    /// Renders `error` as an error response.
    pub fn from_error(id: impl Into<String>, error: &ForrstError, debug: bool) -> Self {
        Self::failure(id, error.to_error_objects(debug))
    }

    /// Whether the response carries at least one error.
    pub fn is_error(&self) -> bool {
        self.errors.as_ref().is_some_and(|errors| !errors.is_empty())
    }

    /// The code of the first error, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.errors
            .as_ref()
            .and_then(|errors| errors.first())
            .map(|error| error.code)
    }

    /// HTTP-style status: 200 on success, otherwise the status of the first error.
    pub fn status(&self) -> u16 {
        self.error_code().map_or(200, ErrorCode::status)
    }

    /// Response annotations, in the order they were added.
    pub fn extensions(&self) -> &[ExtensionObject] {
        self.extensions.as_deref().unwrap_or_default()
    }

    /// The annotation added by the extension identified by `urn`, if any.
    ///
    /// When an extension annotated more than once, the latest annotation wins.
    pub fn extension(&self, urn: &str) -> Option<&ExtensionObject> {
        self.extensions().iter().rev().find(|ext| ext.urn == urn)
    }

    /// Appends an annotation, preserving every prior one.
    pub fn with_extension(mut self, extension: ExtensionObject) -> Self {
        self.push_extension(extension);
        self
    }

    /// Appends an annotation in place, preserving every prior one.
    pub fn push_extension(&mut self, extension: ExtensionObject) {
        self.extensions.get_or_insert_with(Vec::new).push(extension);
    }

    /// Sets a single `meta` entry.
    pub fn set_meta(&mut self, key: impl Into<String>, value: Value) {
        self.meta.get_or_insert_with(Map::new).insert(key.into(), value);
    }

    /// Sets `meta.duration` to `{value: millis, unit: "millisecond"}`.
    pub fn set_duration(&mut self, millis: u64) {
        self.set_meta("duration", DurationValue::milliseconds(millis).to_json());
    }

    /// The recorded `meta.duration` in milliseconds, if present.
    pub fn duration_millis(&self) -> Option<u64> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.get("duration"))
            .filter(|duration| duration.get("unit") == Some(&json!("millisecond")))
            .and_then(|duration| duration.get("value"))
            .and_then(Value::as_u64)
    }
}
