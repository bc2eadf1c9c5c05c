//! # Error Classifier
//!
//! Normalizes the failure shapes integrations produce (status codes,
//! error bodies, transport errors, bare messages) into an
//! [`ErrorClassification`]. This is the only place that looks at raw
//! failure shapes; everything downstream matches on
//! [`ConnectionErrorType`].

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ConnectionErrorType, ErrorClassification};

/// A failure as reported by an integration, before classification
#[derive(Debug, Clone, PartialEq)]
pub enum RawError {
    /// Already normalized; passed through unchanged
    Classified(ErrorClassification),
    /// A bare error message
    Message(String),
    /// A structured error body (e.g. a JSON API error response)
    Payload(Value),
    /// The transport gave up waiting
    Timeout(String),
    /// The transport could not connect or lost the connection
    Connection(String),
}

impl RawError {
    /// Human-readable detail for logs and technical details
    pub fn detail(&self) -> String {
        match self {
            RawError::Classified(c) => c.technical_details.clone(),
            RawError::Message(m) | RawError::Timeout(m) | RawError::Connection(m) => m.clone(),
            RawError::Payload(v) => payload_message(v).unwrap_or_else(|| v.to_string()),
        }
    }
}

impl std::fmt::Display for RawError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.detail())
    }
}

impl From<&str> for RawError {
    fn from(message: &str) -> Self {
        RawError::Message(message.to_string())
    }
}

impl From<String> for RawError {
    fn from(message: String) -> Self {
        RawError::Message(message)
    }
}

impl From<Value> for RawError {
    fn from(payload: Value) -> Self {
        RawError::Payload(payload)
    }
}

impl From<ErrorClassification> for RawError {
    fn from(classification: ErrorClassification) -> Self {
        RawError::Classified(classification)
    }
}

/// Extra signals that refine a generic status into a specific category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationContext {
    /// Throttling hint from a `Retry-After` header or equivalent
    pub retry_after: Option<Duration>,
    /// Provider-specific auth error subcode (e.g. `token_expired`, `463`)
    pub auth_subcode: Option<String>,
    /// Tool the failure came from, for log correlation only
    pub tool_id: Option<String>,
}

impl ClassificationContext {
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_auth_subcode<S: Into<String>>(mut self, subcode: S) -> Self {
        self.auth_subcode = Some(subcode.into());
        self
    }
}

/// The shape a caller expects a successful result to have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedShape {
    Array,
    Object,
    String,
    Number,
    Boolean,
    Any,
}

impl ExpectedShape {
    /// Returns true if `value` has this shape
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ExpectedShape::Array => value.is_array(),
            ExpectedShape::Object => value.is_object(),
            ExpectedShape::String => value.is_string(),
            ExpectedShape::Number => value.is_number(),
            ExpectedShape::Boolean => value.is_boolean(),
            ExpectedShape::Any => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExpectedShape::Array => "array",
            ExpectedShape::Object => "object",
            ExpectedShape::String => "string",
            ExpectedShape::Number => "number",
            ExpectedShape::Boolean => "boolean",
            ExpectedShape::Any => "any",
        }
    }

    pub(crate) fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

static RETRY_AFTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)retry[\s_-]*after[^0-9]{0,16}(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|sec|seconds?)?")
        .expect("retry-after pattern is a valid regex")
});

/// Ordered message heuristics; the first match wins
static MESSAGE_RULES: Lazy<Vec<(Regex, ConnectionErrorType)>> = Lazy::new(|| {
    let rules: [(&str, ConnectionErrorType); 10] = [
        (
            r"(?i)rate[\s_-]?limit|too many requests|quota exceeded|throttl",
            ConnectionErrorType::RateLimited,
        ),
        (
            r"(?i)(token|session|credential)s?[\s_-]*(has\s+|is\s+)?expired|expired[\s_-]*(access[\s_-]*)?token",
            ConnectionErrorType::AuthExpired,
        ),
        (
            r"(?i)unauthori[sz]ed|invalid[\s_-]*(api[\s_-]*key|token|credentials?|grant)|authentication failed|revoked",
            ConnectionErrorType::AuthInvalid,
        ),
        (
            r"(?i)forbidden|permission|insufficient[\s_-]*scope|access denied|not allowed",
            ConnectionErrorType::PermissionDenied,
        ),
        (
            r"(?i)timed?[\s_-]?out|etimedout|deadline exceeded",
            ConnectionErrorType::Timeout,
        ),
        (
            r"(?i)econnrefused|econnreset|enotfound|eai_again|socket hang up|network|connection (refused|reset|closed|error)|dns",
            ConnectionErrorType::NetworkError,
        ),
        (
            r"(?i)service unavailable|bad gateway|maintenance|temporarily unavailable|overloaded",
            ConnectionErrorType::ServiceDown,
        ),
        (
            r"(?i)schema|unexpected (field|type|format|response)|missing field|expected (an? )?(array|object|string|list)",
            ConnectionErrorType::SchemaMismatch,
        ),
        (
            r"(?i)not[\s_-]?found|does not exist|no such",
            ConnectionErrorType::NotFound,
        ),
        (
            r"(?i)invalid[\s_-]*(config|configuration|parameter|argument)|misconfigur|missing required",
            ConnectionErrorType::InvalidConfig,
        ),
    ];

    rules
        .into_iter()
        .map(|(pattern, error_type)| (Regex::new(pattern).expect("message rule is a valid regex"), error_type))
        .collect()
});

/// Subcodes that mark a 401 as an expired (refreshable) credential
const EXPIRED_SUBCODES: [&str; 6] = [
    "token_expired",
    "expired_token",
    "invalid_token_expired",
    "session_expired",
    "463",
    "expired",
];

/// Inspects an integration result and reports a failure if it is not a
/// well-formed success.
///
/// Flags `null`, an explicit `error` field, `success: false`, an HTTP-style
/// `status`/`statusCode` of 400 or above, and results whose shape differs
/// from `expected`.
pub fn detect_error(result: &Value, expected: Option<ExpectedShape>) -> Option<ErrorClassification> {
    if result.is_null() {
        return Some(
            ErrorClassification::new(ConnectionErrorType::InternalError, "Integration returned an empty result"),
        );
    }

    if let Value::Object(map) = result {
        let status = status_of(result);

        if let Some(error) = map.get("error").filter(|e| !e.is_null() && *e != &Value::Bool(false)) {
            let context = context_from_payload(result);
            return Some(classify_error(&RawError::Payload(error_payload(error, result)), status, Some(&context)));
        }

        if map.get("success") == Some(&Value::Bool(false)) {
            let context = context_from_payload(result);
            return Some(classify_error(&RawError::Payload(result.clone()), status, Some(&context)));
        }

        if let Some(status) = status.filter(|s| *s >= 400) {
            let context = context_from_payload(result);
            return Some(classify_error(&RawError::Payload(result.clone()), Some(status), Some(&context)));
        }
    }

    match expected {
        Some(shape) if !shape.matches(result) => Some(ErrorClassification::new(
            ConnectionErrorType::SchemaMismatch,
            format!(
                "expected {} but received {}",
                shape.as_str(),
                ExpectedShape::describe(result)
            ),
        )),
        _ => None,
    }
}

/// Classifies a raw failure.
///
/// Already-classified errors pass through unchanged. Otherwise the HTTP
/// status (explicit or found in the payload) decides the category, with
/// context clues and message heuristics refining generic statuses.
pub fn classify_error(
    raw: &RawError,
    http_status: Option<u16>,
    context: Option<&ClassificationContext>,
) -> ErrorClassification {
    if let RawError::Classified(classification) = raw {
        return classification.clone();
    }

    let detail = raw.detail();
    let status = http_status.or_else(|| match raw {
        RawError::Payload(v) => status_of(v),
        _ => None,
    });

    let payload_context = match raw {
        RawError::Payload(v) => Some(context_from_payload(v)),
        _ => None,
    };
    let retry_after = context
        .and_then(|c| c.retry_after)
        .or_else(|| payload_context.as_ref().and_then(|c| c.retry_after))
        .or_else(|| parse_retry_after(&detail));
    let subcode = context
        .and_then(|c| c.auth_subcode.clone())
        .or_else(|| payload_context.and_then(|c| c.auth_subcode));

    let error_type = match raw {
        RawError::Timeout(_) => ConnectionErrorType::Timeout,
        RawError::Connection(_) => ConnectionErrorType::NetworkError,
        _ => match status {
            Some(status) => classify_status(status, &detail, retry_after.is_some(), subcode.as_deref()),
            None => classify_message(&detail, retry_after.is_some(), subcode.as_deref()),
        },
    };

    let mut classification = ErrorClassification::new(error_type, detail);
    if let Some(status) = status {
        classification = classification.http_status(status);
    }
    if let Some(delay) = retry_after {
        classification = classification.retry_after(delay);
    }

    tracing::debug!(
        error_type = %classification.error_type,
        http_status = ?classification.http_status,
        tool_id = ?context.and_then(|c| c.tool_id.as_deref()),
        "Classified integration failure"
    );

    classification
}

fn classify_status(status: u16, detail: &str, has_retry_after: bool, subcode: Option<&str>) -> ConnectionErrorType {
    match status {
        401 => {
            if is_expired_subcode(subcode) || message_type(detail) == Some(ConnectionErrorType::AuthExpired) {
                ConnectionErrorType::AuthExpired
            } else {
                ConnectionErrorType::AuthInvalid
            }
        }
        403 => {
            if has_retry_after || message_type(detail) == Some(ConnectionErrorType::RateLimited) {
                ConnectionErrorType::RateLimited
            } else {
                ConnectionErrorType::PermissionDenied
            }
        }
        404 | 410 => ConnectionErrorType::NotFound,
        408 | 504 => ConnectionErrorType::Timeout,
        429 => ConnectionErrorType::RateLimited,
        422 => ConnectionErrorType::SchemaMismatch,
        400 => match message_type(detail) {
            Some(ConnectionErrorType::SchemaMismatch) => ConnectionErrorType::SchemaMismatch,
            Some(ConnectionErrorType::AuthExpired) => ConnectionErrorType::AuthExpired,
            _ => ConnectionErrorType::InvalidConfig,
        },
        502 | 503 => {
            if has_retry_after && status == 503 && message_type(detail) == Some(ConnectionErrorType::RateLimited) {
                ConnectionErrorType::RateLimited
            } else {
                ConnectionErrorType::ServiceDown
            }
        }
        500 => match message_type(detail) {
            Some(t) if t.is_transient() => t,
            _ => ConnectionErrorType::InternalError,
        },
        s if s >= 500 => ConnectionErrorType::ServiceDown,
        _ => classify_message(detail, has_retry_after, subcode),
    }
}

fn classify_message(detail: &str, has_retry_after: bool, subcode: Option<&str>) -> ConnectionErrorType {
    if is_expired_subcode(subcode) {
        return ConnectionErrorType::AuthExpired;
    }
    match message_type(detail) {
        Some(t) => t,
        None if has_retry_after => ConnectionErrorType::RateLimited,
        None => ConnectionErrorType::InternalError,
    }
}

fn message_type(detail: &str) -> Option<ConnectionErrorType> {
    MESSAGE_RULES
        .iter()
        .find(|(re, _)| re.is_match(detail))
        .map(|(_, error_type)| *error_type)
}

fn is_expired_subcode(subcode: Option<&str>) -> bool {
    subcode
        .map(|s| s.trim().to_ascii_lowercase())
        .map_or(false, |s| EXPIRED_SUBCODES.iter().any(|known| s == *known))
}

/// Extracts a "retry after N [unit]" hint from free text; seconds by default
pub fn parse_retry_after(text: &str) -> Option<Duration> {
    let captures = RETRY_AFTER_RE.captures(text)?;
    let amount: f64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = captures.get(2).map(|m| m.as_str().to_ascii_lowercase());
    let millis = match unit.as_deref() {
        Some(u) if u.starts_with("ms") || u.starts_with("milli") => amount,
        _ => amount * 1000.0,
    };
    Some(Duration::from_millis(millis.max(0.0) as u64))
}

fn status_of(value: &Value) -> Option<u16> {
    ["status", "statusCode", "status_code", "httpStatus"]
        .iter()
        .find_map(|key| value.get(*key))
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .and_then(|n| u16::try_from(n).ok())
}

fn payload_message(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => ["message", "error_description", "error", "detail", "reason"]
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(payload_message),
        _ => None,
    }
}

fn error_payload(error: &Value, result: &Value) -> Value {
    match error {
        Value::Object(_) => error.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("message".to_string(), other.clone());
            if let Some(status) = status_of(result) {
                map.insert("status".to_string(), Value::from(status));
            }
            Value::Object(map)
        }
    }
}

fn context_from_payload(value: &Value) -> ClassificationContext {
    let lookup = |keys: &[&str]| -> Option<&Value> {
        keys.iter().find_map(|key| {
            value
                .get(*key)
                .or_else(|| value.get("error").and_then(|e| e.get(*key)))
        })
    };

    let retry_after = lookup(&["retryAfter", "retry_after", "retryAfterMs", "retry_after_ms"]).and_then(|v| {
        let is_millis = value.get("retryAfterMs").is_some() || value.get("retry_after_ms").is_some();
        let amount = match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }?;
        let millis = if is_millis { amount } else { amount * 1000.0 };
        Some(Duration::from_millis(millis.max(0.0) as u64))
    });

    let auth_subcode = lookup(&["subcode", "error_subcode", "subCode", "code"]).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    ClassificationContext {
        retry_after,
        auth_subcode,
        tool_id: None,
    }
}
