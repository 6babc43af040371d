//! Absolute and relative deadlines.
//!
//! Options: `deadline` (RFC 3339 timestamp) and `timeout` (`{value, unit}`).
//! The absolute deadline wins when both are given.
//!
//! The extension refuses entry once the deadline has passed and reports
//! timing afterwards. It never cancels a running function.

use std::time::Duration;

use async_trait::async_trait;
use engine::{EventKind, Extension, LifecycleEvent, Subscription};
use protocol::{
    DurationValue, ErrorCode, ExtensionObject, ForrstError, RequestObject, ResponseObject,
    TimeUnit, Timestamp,
};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::option_pointer;

pub const DEADLINE_URN: &str = "urn:forrst:ext:deadline";

/// Lower than idempotency: an expired request is refused before any lock is
/// taken, whatever order the request declares the two extensions in.
pub const DEADLINE_PRIORITY: i32 = 10;

const TIMEOUT_UNITS: &[TimeUnit] = &[
    TimeUnit::Millisecond,
    TimeUnit::Second,
    TimeUnit::Minute,
    TimeUnit::Hour,
    TimeUnit::Day,
];

/// The deadline of one request, anchored on the monotonic clock when the
/// function was about to run.
#[derive(Debug, Clone)]
pub struct DeadlineContext {
    started: Instant,
    deadline: Instant,
    deadline_at: Timestamp,
    specified: Option<DurationValue>,
}

impl DeadlineContext {
    /// A deadline `timeout` from now.
    pub fn relative(timeout: DurationValue) -> Option<Self> {
        let started = Instant::now();
        Some(Self {
            started,
            deadline: started.checked_add(timeout.as_std())?,
            deadline_at: Timestamp::now().checked_add(timeout.as_std())?,
            specified: Some(timeout),
        })
    }

    /// A deadline at wall-clock time `at`, or `None` if `at` has passed.
    pub fn absolute(at: Timestamp) -> Option<Self> {
        let remaining = Timestamp::now().until(at)?;
        let started = Instant::now();
        Some(Self {
            started,
            deadline: started.checked_add(remaining)?,
            deadline_at: at,
            specified: None,
        })
    }

    /// Attaches the relative timeout the caller also specified.
    pub fn with_specified(mut self, specified: Option<DurationValue>) -> Self {
        self.specified = specified;
        self
    }

    pub fn deadline_at(&self) -> Timestamp {
        self.deadline_at
    }

    pub fn specified(&self) -> Option<DurationValue> {
        self.specified
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_exceeded(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// The deadline extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineExtension;

impl DeadlineExtension {
    pub fn new() -> Self {
        Self
    }

    fn exceeded(request: &RequestObject, deadline: &Value) -> ResponseObject {
        let mut details = Map::new();
        details.insert("deadline".into(), deadline.clone());
        let error = ForrstError::new(ErrorCode::DeadlineExceeded, "Deadline exceeded").with_details(details);

        let mut data = Map::new();
        data.insert("exceeded".into(), json!(true));
        data.insert("deadline".into(), deadline.clone());
        ResponseObject::from_error(request.id.clone(), &error, false)
            .with_extension(ExtensionObject::response(DEADLINE_URN, data))
    }
}

#[async_trait]
impl Extension for DeadlineExtension {
    fn urn(&self) -> &str {
        DEADLINE_URN
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::new(EventKind::ExecutingFunction, DEADLINE_PRIORITY),
            Subscription::new(EventKind::FunctionExecuted, DEADLINE_PRIORITY),
        ]
    }

    async fn on_executing_function(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        let request = event.request();
        let Some(invocation) = request.extension(DEADLINE_URN) else {
            return Ok(());
        };
        if !event.first_visit(DEADLINE_URN) {
            return Ok(());
        }
        let timeout = parse_timeout(request, invocation)?;

        let context = match invocation.option("deadline").filter(|raw| !raw.is_null()) {
            Some(raw) => {
                let at = raw.as_str().and_then(Timestamp::parse_rfc3339).ok_or_else(|| {
                    ForrstError::invalid_arguments(
                        option_pointer(request, DEADLINE_URN, "deadline"),
                        "Deadline must be an RFC 3339 timestamp",
                    )
                })?;
                match DeadlineContext::absolute(at) {
                    Some(context) => context.with_specified(timeout),
                    None => {
                        tracing::debug!(deadline = %at, "deadline already passed; refusing execution");
                        event.respond(Self::exceeded(request, &json!(at.to_string())));
                        return Ok(());
                    }
                }
            }
            None => match timeout {
                Some(timeout) => DeadlineContext::relative(timeout).ok_or_else(|| {
                    ForrstError::invalid_arguments(
                        option_pointer(request, DEADLINE_URN, "timeout"),
                        "Timeout is too large",
                    )
                })?,
                None => return Ok(()),
            },
        };

        if context.is_exceeded() {
            event.respond(Self::exceeded(request, &json!(context.deadline_at().to_string())));
            return Ok(());
        }
        event.state_mut().insert(DEADLINE_URN, context);
        Ok(())
    }

    async fn on_function_executed(&self, event: &mut LifecycleEvent<'_>) -> Result<(), ForrstError> {
        let request = event.request();
        let Some(invocation) = request.extension(DEADLINE_URN) else {
            return Ok(());
        };
        if !event.first_visit(DEADLINE_URN) {
            return Ok(());
        }

        let mut data = Map::new();
        match event.state().get::<DeadlineContext>(DEADLINE_URN) {
            Some(context) => {
                let elapsed = context.elapsed();
                data.insert("remaining".into(), millis(context.remaining()).to_json());
                data.insert("elapsed".into(), millis(elapsed).to_json());
                if let Some(specified) = context.specified() {
                    data.insert("specified".into(), specified.to_json());
                    data.insert("utilization".into(), json!(utilization(elapsed, specified)));
                }
            }
            // No context: report what the options say, nothing measured.
            None => {
                if let Ok(Some(specified)) = parse_timeout(request, invocation) {
                    data.insert("specified".into(), specified.to_json());
                }
            }
        }

        if !data.is_empty() {
            event.map_response(|response| {
                response.with_extension(ExtensionObject::response(DEADLINE_URN, data))
            });
        }
        Ok(())
    }
}

fn parse_timeout(
    request: &RequestObject,
    invocation: &ExtensionObject,
) -> Result<Option<DurationValue>, ForrstError> {
    match invocation.option("timeout").filter(|raw| !raw.is_null()) {
        None => Ok(None),
        Some(raw) => DurationValue::from_json(raw, TIMEOUT_UNITS)
            .map(Some)
            .map_err(|err| {
                ForrstError::invalid_arguments(
                    option_pointer(request, DEADLINE_URN, "timeout"),
                    format!("Invalid timeout: {err}"),
                )
            }),
    }
}

fn millis(duration: Duration) -> DurationValue {
    DurationValue::milliseconds(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

fn utilization(elapsed: Duration, specified: DurationValue) -> f64 {
    elapsed.as_millis() as f64 / specified.as_millis() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_never_increases_and_clamps_at_zero() {
        let context = DeadlineContext::relative(DurationValue::milliseconds(250)).unwrap();
        let mut previous = context.remaining();
        assert_eq!(previous, Duration::from_millis(250));

        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(40)).await;
            let current = context.remaining();
            assert!(current <= previous);
            previous = current;
        }
        assert_eq!(context.remaining(), Duration::ZERO);
        assert!(context.is_exceeded());
        assert_eq!(context.elapsed(), Duration::from_millis(400));
    }

    #[test]
    fn absolute_deadlines_in_the_past_are_rejected() {
        let past = Timestamp::parse_rfc3339("2000-01-01T00:00:00Z").unwrap();
        assert!(DeadlineContext::absolute(past).is_none());

        let future = Timestamp::now().checked_add(Duration::from_secs(60)).unwrap();
        let context = DeadlineContext::absolute(future).unwrap();
        assert!(context.remaining() > Duration::from_secs(50));
        assert_eq!(context.specified(), None);
    }

    #[test]
    fn utilization_is_unit_normalized() {
        let specified = DurationValue::new(2, TimeUnit::Second);
        assert_eq!(utilization(Duration::from_millis(500), specified), 0.25);
    }
}
