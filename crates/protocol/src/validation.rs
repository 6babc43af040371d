//! Envelope validation.
//!
//! Runs against the decoded structure before it is turned into a
//! [`crate::RequestObject`], so every violation can be reported at once with a
//! JSON pointer instead of stopping at the first deserialisation failure.

use serde_json::{Map, Value};

use crate::envelope::{PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::errors::{ErrorCode, FieldViolation, ForrstError};
use crate::identifiers::RequestId;

/// Rejects anything that is not a single, non-empty request object.
///
/// Lists are always rejected regardless of their content: the protocol has no
/// batch form.
pub fn ensure_single_request(value: &Value) -> Result<&Map<String, Value>, ForrstError> {
    match value {
        Value::Array(_) => Err(ForrstError::new(
            ErrorCode::InvalidRequest,
            "Batch requests are not supported; send one request per call",
        )),
        Value::Object(object) if object.is_empty() => Err(ForrstError::new(
            ErrorCode::InvalidRequest,
            "Request must not be empty",
        )),
        Value::Object(object) => Ok(object),
        _ => Err(ForrstError::new(
            ErrorCode::InvalidRequest,
            "Request must be an object",
        )),
    }
}

/// Validates a decoded request envelope against the protocol schema.
///
/// Returns [`ForrstError::Validation`] listing every violated field.
pub fn validate_envelope(value: &Value) -> Result<(), ForrstError> {
    let object = ensure_single_request(value)?;
    let mut violations = Vec::new();

    check_protocol(object.get("protocol"), &mut violations);
    check_id(object.get("id"), &mut violations);
    check_call(object.get("call"), &mut violations);

    if let Some(context) = object.get("context") {
        if !is_optional_object(context) {
            violations.push(FieldViolation::new("/context", "context must be an object"));
        }
    }
    check_extensions(object.get("extensions"), &mut violations);

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ForrstError::Validation { violations })
    }
}

fn check_protocol(protocol: Option<&Value>, violations: &mut Vec<FieldViolation>) {
    let Some(protocol) = protocol.and_then(Value::as_object) else {
        violations.push(FieldViolation::new("/protocol", "protocol must be an object"));
        return;
    };
    if protocol.get("name").and_then(Value::as_str) != Some(PROTOCOL_NAME) {
        violations.push(FieldViolation::new(
            "/protocol/name",
            format!("protocol name must be '{PROTOCOL_NAME}'"),
        ));
    }
    if protocol.get("version").and_then(Value::as_str) != Some(PROTOCOL_VERSION) {
        violations.push(FieldViolation::new(
            "/protocol/version",
            format!("protocol version must be '{PROTOCOL_VERSION}'"),
        ));
    }
}

fn check_id(id: Option<&Value>, violations: &mut Vec<FieldViolation>) {
    match id.and_then(Value::as_str) {
        None => violations.push(FieldViolation::new("/id", "id is required and must be a string")),
        Some(id) if RequestId::parse(id).is_none() => violations.push(FieldViolation::new(
            "/id",
            "id must be 1-255 characters of letters, digits, '.', '_', ':' or '-'",
        )),
        Some(_) => {}
    }
}

fn check_call(call: Option<&Value>, violations: &mut Vec<FieldViolation>) {
    let Some(call) = call.and_then(Value::as_object) else {
        violations.push(FieldViolation::new("/call", "call is required and must be an object"));
        return;
    };

    match call.get("function").and_then(Value::as_str) {
        Some(function) if !function.trim().is_empty() => {}
        _ => violations.push(FieldViolation::new(
            "/call/function",
            "call.function is required and must be a non-empty string",
        )),
    }

    if let Some(version) = call.get("version").filter(|v| !v.is_null()) {
        let valid = version
            .as_str()
            .is_some_and(|v| semver::Version::parse(v).is_ok());
        if !valid {
            violations.push(FieldViolation::new(
                "/call/version",
                "call.version must be a semantic version (e.g. 1.0.0)",
            ));
        }
    }

    if let Some(arguments) = call.get("arguments") {
        if !is_optional_object(arguments) {
            violations.push(FieldViolation::new(
                "/call/arguments",
                "call.arguments must be an object",
            ));
        }
    }
}

fn check_extensions(extensions: Option<&Value>, violations: &mut Vec<FieldViolation>) {
    let Some(extensions) = extensions.filter(|v| !v.is_null()) else {
        return;
    };
    let Some(items) = extensions.as_array() else {
        violations.push(FieldViolation::new("/extensions", "extensions must be an array"));
        return;
    };
    for (index, item) in items.iter().enumerate() {
        let Some(item) = item.as_object() else {
            violations.push(FieldViolation::new(
                format!("/extensions/{index}"),
                "extension must be an object",
            ));
            continue;
        };
        match item.get("urn").and_then(Value::as_str) {
            Some(urn) if !urn.is_empty() => {}
            _ => violations.push(FieldViolation::new(
                format!("/extensions/{index}/urn"),
                "extension urn is required and must be a non-empty string",
            )),
        }
        if let Some(options) = item.get("options") {
            if !is_optional_object(options) {
                violations.push(FieldViolation::new(
                    format!("/extensions/{index}/options"),
                    "extension options must be an object",
                ));
            }
        }
    }
}

fn is_optional_object(value: &Value) -> bool {
    value.is_null() || value.is_object()
}
