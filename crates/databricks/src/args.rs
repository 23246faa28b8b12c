//! Reading validated tool arguments.
//!
//! The dispatcher has already checked presence and types against each tool's
//! schema, so a missing required value here means the schema and the handler
//! disagree.

use runtime::{Arguments, BackendError};
use serde_json::Value;

pub(crate) fn required_str<'a>(args: &'a Arguments, name: &str) -> Result<&'a str, BackendError> {
    optional_str(args, name)
        .ok_or_else(|| BackendError::InvalidRequest(format!("'{name}' is required")))
}

pub(crate) fn optional_str<'a>(args: &'a Arguments, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

pub(crate) fn optional_bool(args: &Arguments, name: &str) -> Option<bool> {
    args.get(name).and_then(Value::as_bool)
}

pub(crate) fn optional_i64(args: &Arguments, name: &str) -> Option<i64> {
    args.get(name).and_then(Value::as_i64)
}

/// Any non-null value, passed through as is.
pub(crate) fn optional_value(args: &Arguments, name: &str) -> Option<Value> {
    args.get(name).filter(|v| !v.is_null()).cloned()
}

/// Job, run and repair ids: numeric strings go to the API as integers,
/// anything else verbatim so the API's own not-found error names it.
pub(crate) fn numeric_id(raw: &str) -> Value {
    raw.trim()
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Render an id value for a query string or message.
pub(crate) fn id_text(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
