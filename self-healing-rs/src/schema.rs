//! Best-effort structural normalization for responses whose shape drifted.

use serde_json::Value;

use crate::classifier::ExpectedShape;

/// Keys integrations commonly nest their payload under
const ENVELOPE_KEYS: &[&str] = &[
    "data", "result", "results", "items", "records", "value", "payload", "response",
];

/// Reshapes `value` into `shape`, or returns `None` if no known
/// normalization applies.
///
/// Tried in order: unchanged, unwrap an envelope key, wrap a lone object
/// into an array, take the first element of an array.
pub fn adapt_to_shape(value: &Value, shape: ExpectedShape) -> Option<Value> {
    if shape.matches(value) {
        return Some(value.clone());
    }

    if let Some(unwrapped) = unwrap_envelope(value, shape) {
        return Some(unwrapped);
    }

    match (shape, value) {
        (ExpectedShape::Array, Value::Object(_)) => Some(Value::Array(vec![value.clone()])),
        (ExpectedShape::Object, Value::Array(items)) => {
            items.first().filter(|first| first.is_object()).cloned()
        }
        _ => None,
    }
}

fn unwrap_envelope(value: &Value, shape: ExpectedShape) -> Option<Value> {
    let object = value.as_object()?;
    for key in ENVELOPE_KEYS {
        let Some(inner) = object.get(*key) else {
            continue;
        };
        if shape.matches(inner) {
            return Some(inner.clone());
        }
        if shape == ExpectedShape::Array && inner.is_object() {
            if let Some(nested) = unwrap_envelope(inner, shape) {
                return Some(nested);
            }
        }
    }
    None
}
