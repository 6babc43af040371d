//! Newtype domain identifiers.
//!
//! Every protocol concept that has an identity is represented as a distinct
//! newtype wrapping a primitive, so an operation id can never be passed where a
//! caller id is expected even though both are strings on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a request correlation id and of an idempotency key.
pub const MAX_IDENTIFIER_LEN: usize = 255;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id! {
    /// Identifies the authenticated party on whose behalf an operation runs.
    ///
    /// Operation repositories scope reads and writes to the caller when one is
    /// supplied.
    CallerId
}

string_id! {
    /// A pagination cursor returned by [`crate::OperationRepository::list`].
    Cursor
}

// ---------------------------------------------------------------------------
// Request correlation id
// ---------------------------------------------------------------------------

/// Caller-supplied correlation token echoed on the response.
///
/// Grammar: 1 to [`MAX_IDENTIFIER_LEN`] characters drawn from
/// `[A-Za-z0-9._:-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Parses a request id, returning `None` if it violates the grammar.
    pub fn parse(value: &str) -> Option<Self> {
        if is_identifier(value, |c| matches!(c, '.' | '_' | ':' | '-')) {
            Some(Self(value.to_owned()))
        } else {
            None
        }
    }

    /// Generates a fresh correlation id for responses whose request id could
    /// not be recovered.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Idempotency key
// ---------------------------------------------------------------------------

/// Caller-supplied token scoping at-most-once execution.
///
/// Non-empty, at most [`MAX_IDENTIFIER_LEN`] characters, charset
/// `[A-Za-z0-9-_:.]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Parses a key, returning `None` if it is empty, too long, or contains a
    /// character outside the permitted set.
    pub fn parse(value: &str) -> Option<Self> {
        if is_identifier(value, |c| matches!(c, '-' | '_' | ':' | '.')) {
            Some(Self(value.to_owned()))
        } else {
            None
        }
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_identifier(value: &str, extra: impl Fn(char) -> bool) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value.chars().all(|c| c.is_ascii_alphanumeric() || extra(c))
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed, internally generated
// ---------------------------------------------------------------------------

/// Identifies a long-running operation tracked by an operation repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generates a new random operation identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an [`OperationId`] from an existing UUID (e.g. deserialised from storage).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
