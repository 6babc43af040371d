//! Shared value types for the protocol domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (durations are positive integers in a
//! known unit, timestamps are UTC) and participate in extension computations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Durations on the wire
// ---------------------------------------------------------------------------

/// Unit of a wire duration `{value, unit}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Number of milliseconds in one unit.
    pub fn millis(self) -> u64 {
        match self {
            Self::Millisecond => 1,
            Self::Second => 1_000,
            Self::Minute => 60_000,
            Self::Hour => 3_600_000,
            Self::Day => 86_400_000,
        }
    }

    /// Returns the wire name of the unit.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Millisecond => "millisecond",
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "millisecond" => Some(Self::Millisecond),
            "second" => Some(Self::Second),
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }
}

/// Reasons a `{value, unit}` object could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("duration must be an object with `value` and `unit`")]
    NotAnObject,
    #[error("duration `value` must be a positive integer")]
    InvalidValue,
    #[error("duration `unit` '{0}' is not supported")]
    UnsupportedUnit(String),
    #[error("duration is too large")]
    Overflow,
}

/// A positive duration expressed as `{value, unit}` on the wire.
///
/// The unit is preserved as given so extensions can echo a caller's
/// duration back unconverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DurationValue {
    pub value: u64,
    pub unit: TimeUnit,
}

impl DurationValue {
    /// Creates a duration of `value` units.
    pub fn new(value: u64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }

    /// Creates a duration in milliseconds, the unit used for every measured value.
    pub fn milliseconds(value: u64) -> Self {
        Self::new(value, TimeUnit::Millisecond)
    }

    /// Reads a `{value, unit}` object, accepting only the given units.
    ///
    /// `value` must be a strictly positive integer; floats, zero, negatives and
    /// strings are rejected.
    pub fn from_json(value: &Value, allowed: &[TimeUnit]) -> Result<Self, DurationParseError> {
        let object = value.as_object().ok_or(DurationParseError::NotAnObject)?;
        let amount = object
            .get("value")
            .and_then(Value::as_u64)
            .filter(|v| *v > 0)
            .ok_or(DurationParseError::InvalidValue)?;
        let unit_name = object
            .get("unit")
            .and_then(Value::as_str)
            .ok_or(DurationParseError::NotAnObject)?;
        let unit = TimeUnit::parse(unit_name)
            .filter(|unit| allowed.contains(unit))
            .ok_or_else(|| DurationParseError::UnsupportedUnit(unit_name.to_owned()))?;
        let parsed = Self::new(amount, unit);
        parsed.checked_millis().ok_or(DurationParseError::Overflow)?;
        Ok(parsed)
    }

    /// Total length in milliseconds, or `None` on overflow.
    pub fn checked_millis(self) -> Option<u64> {
        self.value.checked_mul(self.unit.millis())
    }

    /// Total length in milliseconds, saturating on overflow.
    pub fn as_millis(self) -> u64 {
        self.value.saturating_mul(self.unit.millis())
    }

    /// Total length in whole seconds (truncating sub-second remainders).
    pub fn as_secs(self) -> u64 {
        self.as_millis() / 1_000
    }

    /// Converts to a [`std::time::Duration`].
    pub fn as_std(self) -> Duration {
        Duration::from_millis(self.as_millis())
    }

    /// Wire representation `{"value": .., "unit": ..}`.
    pub fn to_json(self) -> Value {
        json!({ "value": self.value, "unit": self.unit.as_str() })
    }
}

impl std::fmt::Display for DurationValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.value, self.unit.as_str())
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; serialises as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Parses an RFC 3339 timestamp in any offset, normalising to UTC.
    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Returns this timestamp shifted forward by `duration`, or `None` if the
    /// result is out of range.
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        let delta = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_add_signed(delta).map(Self)
    }

    /// Time from `self` until `later`, or `None` if `later` is not after `self`.
    pub fn until(self, later: Timestamp) -> Option<Duration> {
        (later.0 - self.0).to_std().ok().filter(|d| !d.is_zero())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
