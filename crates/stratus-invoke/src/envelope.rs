//! Call/return envelope shared by every backend.
//!
//! This module provides:
//!
//! - [`Call`]: The request sent to a backend for one invocation
//! - [`Return`]: The result produced by the remote side (or synthesized
//!   locally when dispatch fails)
//! - [`Response`]: The caller-facing view derived from a `Return`
//! - [`RemoteError`]: An error rebuilt from its name, message and stack
//!
//! ## Wire format
//!
//! The serialized shapes are stable across backends:
//!
//! ```text
//! Call   = { name, args, callId, start }
//! Return = { type: "value" | "error", value, callId, executionStart?, executionEnd? }
//! ```
//!
//! When `type` is `"error"`, `value` is `{ name, message, stack }`. All
//! timestamps are milliseconds since the Unix epoch.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stratus_core::CallId;

/// Returns the current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A single invocation request.
///
/// Created by the facade at invocation time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// Name of the function to invoke.
    pub name: String,
    /// Positional, already-encoded arguments.
    pub args: Vec<Value>,
    /// Correlation key for the matching [`Return`].
    pub call_id: CallId,
    /// Submission time in epoch milliseconds.
    pub start: i64,
}

impl Call {
    /// Creates a call with a fresh call ID, stamped with the current time.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
            call_id: CallId::generate(),
            start: now_ms(),
        }
    }

    /// Overrides the submission timestamp.
    #[must_use]
    pub const fn with_start(mut self, start: i64) -> Self {
        self.start = start;
        self
    }
}

/// An error reconstructed from the remote side of a call.
///
/// Name, message and stack are preserved verbatim, so a caller can only
/// tell a rebuilt error from a local one by its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error name, e.g. `ValidationError`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stack or backtrace text captured where the error was raised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    /// Creates an error with no stack.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attaches stack text.
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<&stratus_core::Error> for RemoteError {
    fn from(error: &stratus_core::Error) -> Self {
        Self::new(error.name(), error.to_string())
    }
}

impl From<stratus_core::Error> for RemoteError {
    fn from(error: stratus_core::Error) -> Self {
        Self::from(&error)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// What a remote invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The function returned a value.
    Value(Value),
    /// The function (or its dispatch) failed.
    Error(RemoteError),
}

impl Outcome {
    /// Returns true for the error variant.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// The result of one call, as delivered by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireReturn", into = "WireReturn")]
pub struct Return {
    /// Must equal the originating [`Call::call_id`].
    pub call_id: CallId,
    /// Value or error.
    pub outcome: Outcome,
    /// When the remote side began executing, in epoch milliseconds.
    pub execution_start: Option<i64>,
    /// When the remote side finished executing, in epoch milliseconds.
    pub execution_end: Option<i64>,
    /// Raw transport response, kept for callers that need it. Never
    /// serialized.
    pub raw: Option<Value>,
}

impl Return {
    /// Creates a successful return.
    #[must_use]
    pub const fn value(call_id: CallId, value: Value) -> Self {
        Self {
            call_id,
            outcome: Outcome::Value(value),
            execution_start: None,
            execution_end: None,
            raw: None,
        }
    }

    /// Creates an error return.
    #[must_use]
    pub const fn error(call_id: CallId, error: RemoteError) -> Self {
        Self {
            call_id,
            outcome: Outcome::Error(error),
            execution_start: None,
            execution_end: None,
            raw: None,
        }
    }

    /// Synthesizes an error return for a dispatch that failed before any
    /// result existed.
    ///
    /// The attempt's start and failure times stand in for the execution
    /// window so the failure still contributes latency data.
    #[must_use]
    pub fn transport_failure(
        call_id: CallId,
        error: &stratus_core::Error,
        attempt_start: i64,
        failed_at: i64,
    ) -> Self {
        Self::error(call_id, RemoteError::from(error)).with_execution(attempt_start, failed_at)
    }

    /// Sets the execution window.
    #[must_use]
    pub const fn with_execution(mut self, start: i64, end: i64) -> Self {
        self.execution_start = Some(start);
        self.execution_end = Some(end);
        self
    }

    /// Attaches the raw transport response.
    #[must_use]
    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Returns true if the outcome is an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.outcome.is_error()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReturnType {
    Value,
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReturn {
    #[serde(rename = "type")]
    kind: ReturnType,
    #[serde(default)]
    value: Value,
    call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution_start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution_end: Option<i64>,
}

impl TryFrom<WireReturn> for Return {
    type Error = serde_json::Error;

    fn try_from(wire: WireReturn) -> Result<Self, Self::Error> {
        let outcome = match wire.kind {
            ReturnType::Value => Outcome::Value(wire.value),
            ReturnType::Error => Outcome::Error(serde_json::from_value(wire.value)?),
        };
        Ok(Self {
            call_id: wire.call_id,
            outcome,
            execution_start: wire.execution_start,
            execution_end: wire.execution_end,
            raw: None,
        })
    }
}

impl From<Return> for WireReturn {
    fn from(ret: Return) -> Self {
        let (kind, value) = match ret.outcome {
            Outcome::Value(value) => (ReturnType::Value, value),
            Outcome::Error(error) => (
                ReturnType::Error,
                serde_json::to_value(error).unwrap_or(Value::Null),
            ),
        };
        Self {
            kind,
            value,
            call_id: ret.call_id,
            execution_start: ret.execution_start,
            execution_end: ret.execution_end,
        }
    }
}

/// Caller-facing result of one invocation.
///
/// Latencies are in milliseconds and are present only when the `Return`
/// carried both execution timestamps. They are kept separate because each
/// points at a different bottleneck:
///
/// | Field | Measures |
/// |-------|----------|
/// | `start_latency` | dispatch and queueing delay |
/// | `execution_latency` | compute time |
/// | `return_latency` | result transit delay |
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The returned value, if the call succeeded.
    pub value: Option<Value>,
    /// The reconstructed error, if the call failed.
    pub error: Option<RemoteError>,
    /// Raw transport response, if the backend provided one.
    pub raw: Option<Value>,
    /// `execution_start - call.start`.
    pub start_latency: Option<i64>,
    /// `execution_end - execution_start`.
    pub execution_latency: Option<i64>,
    /// `now - execution_end`.
    pub return_latency: Option<i64>,
}

impl Response {
    /// Builds the response for `ret`, measuring return latency against
    /// `now` (epoch milliseconds).
    #[must_use]
    pub fn from_return(call: &Call, ret: Return, now: i64) -> Self {
        let (start_latency, execution_latency, return_latency) =
            match (ret.execution_start, ret.execution_end) {
                // Timestamps arrive off the wire; clamp instead of overflowing.
                (Some(started), Some(ended)) => (
                    Some(started.saturating_sub(call.start)),
                    Some(ended.saturating_sub(started)),
                    Some(now.saturating_sub(ended)),
                ),
                _ => (None, None, None),
            };

        let (value, error) = match ret.outcome {
            Outcome::Value(value) => (Some(value), None),
            Outcome::Error(error) => (None, Some(error)),
        };

        Self {
            value,
            error,
            raw: ret.raw,
            start_latency,
            execution_latency,
            return_latency,
        }
    }

    /// Returns true if the call failed.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Unwraps into the conventional value-or-error form.
    ///
    /// # Errors
    ///
    /// Returns the reconstructed remote error if the call failed.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.value.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn latencies_are_derived_separately() {
        let call = Call::new("work", vec![]).with_start(1000);
        let ret = Return::value(call.call_id, json!(1)).with_execution(1050, 1200);

        let response = Response::from_return(&call, ret, 1250);
        assert_eq!(response.start_latency, Some(50));
        assert_eq!(response.execution_latency, Some(150));
        assert_eq!(response.return_latency, Some(50));
        assert_eq!(response.value, Some(json!(1)));
    }

    #[test]
    fn latencies_need_both_timestamps() {
        let call = Call::new("work", vec![]).with_start(1000);
        let mut ret = Return::value(call.call_id, json!(1));
        ret.execution_start = Some(1050);

        let response = Response::from_return(&call, ret, 1250);
        assert_eq!(response.start_latency, None);
        assert_eq!(response.execution_latency, None);
        assert_eq!(response.return_latency, None);
    }

    #[test]
    fn extreme_timestamps_saturate() {
        let call = Call::new("work", vec![]).with_start(1000);
        let ret = Return::value(call.call_id, json!(1)).with_execution(i64::MIN, i64::MAX);

        let response = Response::from_return(&call, ret, i64::MIN);
        assert_eq!(response.start_latency, Some(i64::MIN));
        assert_eq!(response.execution_latency, Some(i64::MAX));
        assert_eq!(response.return_latency, Some(i64::MIN));
        assert_eq!(response.value, Some(json!(1)));
    }

    #[test]
    fn remote_error_identity_is_preserved() {
        let call = Call::new("validate", vec![json!("x")]);
        let error = RemoteError::new("ValidationError", "bad input").with_stack("at validate");
        let response = Response::from_return(&call, Return::error(call.call_id, error), now_ms());

        let err = response.into_result().unwrap_err();
        assert_eq!(err.name, "ValidationError");
        assert_eq!(err.message, "bad input");
        assert_eq!(err.stack.as_deref(), Some("at validate"));
        assert_eq!(err.to_string(), "ValidationError: bad input");
    }

    #[test]
    fn call_wire_format() {
        let call = Call::new("add", vec![json!(1), json!(2)]).with_start(42);
        let wire = serde_json::to_value(&call).unwrap();
        assert_eq!(wire["name"], "add");
        assert_eq!(wire["args"], json!([1, 2]));
        assert_eq!(wire["callId"], call.call_id.to_string());
        assert_eq!(wire["start"], 42);
    }

    #[test]
    fn error_return_wire_format() {
        let call_id = CallId::generate();
        let ret = Return::error(call_id, RemoteError::new("TypeError", "nope").with_stack("s"))
            .with_execution(10, 20);
        let wire = serde_json::to_value(&ret).unwrap();

        assert_eq!(wire["type"], "error");
        assert_eq!(wire["value"]["name"], "TypeError");
        assert_eq!(wire["value"]["message"], "nope");
        assert_eq!(wire["value"]["stack"], "s");
        assert_eq!(wire["executionStart"], 10);
        assert_eq!(wire["executionEnd"], 20);
    }

    #[test]
    fn value_return_parses_without_timestamps() {
        let call_id = CallId::generate();
        let ret: Return = serde_json::from_value(json!({
            "type": "value",
            "value": {"ok": true},
            "callId": call_id.to_string(),
        }))
        .unwrap();

        assert_eq!(ret.call_id, call_id);
        assert_eq!(ret.outcome, Outcome::Value(json!({"ok": true})));
        assert_eq!(ret.execution_start, None);
    }

    #[test]
    fn malformed_error_payload_is_rejected() {
        let parsed = serde_json::from_value::<Return>(json!({
            "type": "error",
            "value": 17,
            "callId": CallId::generate().to_string(),
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn transport_failure_carries_attempt_window() {
        let call_id = CallId::generate();
        let error = stratus_core::Error::transport("connection refused");
        let ret = Return::transport_failure(call_id, &error, 100, 180);

        assert!(ret.is_error());
        assert_eq!(ret.execution_start, Some(100));
        assert_eq!(ret.execution_end, Some(180));
        match ret.outcome {
            Outcome::Error(e) => assert_eq!(e.name, "TransportError"),
            Outcome::Value(_) => panic!("expected error outcome"),
        }
    }
}
