//! # Classification and Healing Types
//!
//! The closed set of integration failure categories and the vocabulary
//! shared by the classifier, the healing engine and its callers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Categorizes integration failures.
///
/// Every raw failure shape is normalized into exactly one of these
/// variants by the classifier; downstream logic matches on the tag only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionErrorType {
    /// The call did not complete in time
    Timeout,
    /// The connection could not be established or was dropped
    NetworkError,
    /// The integration throttled the caller
    RateLimited,
    /// Credentials are valid but expired and can be refreshed
    AuthExpired,
    /// Credentials are invalid or revoked
    AuthInvalid,
    /// The credentials lack the required scope
    PermissionDenied,
    /// The addressed resource does not exist
    NotFound,
    /// The response shape differs from what the caller expects
    SchemaMismatch,
    /// The integration is unavailable or in maintenance
    ServiceDown,
    /// The call is misconfigured on the caller side
    InvalidConfig,
    /// Anything that could not be attributed to a more specific category
    InternalError,
}

impl ConnectionErrorType {
    /// All categories, in declaration order.
    pub const ALL: [ConnectionErrorType; 11] = [
        ConnectionErrorType::Timeout,
        ConnectionErrorType::NetworkError,
        ConnectionErrorType::RateLimited,
        ConnectionErrorType::AuthExpired,
        ConnectionErrorType::AuthInvalid,
        ConnectionErrorType::PermissionDenied,
        ConnectionErrorType::NotFound,
        ConnectionErrorType::SchemaMismatch,
        ConnectionErrorType::ServiceDown,
        ConnectionErrorType::InvalidConfig,
        ConnectionErrorType::InternalError,
    ];

    /// Returns true if the failure is expected to clear up on its own
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ConnectionErrorType::Timeout
                | ConnectionErrorType::RateLimited
                | ConnectionErrorType::ServiceDown
                | ConnectionErrorType::NetworkError
        )
    }

    /// Returns true if repeating the call (possibly after a repair step) can help
    pub fn is_retryable(self) -> bool {
        !self.is_permanent()
    }

    /// The four categories that need a human and never auto-resolve
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ConnectionErrorType::AuthInvalid
                | ConnectionErrorType::PermissionDenied
                | ConnectionErrorType::NotFound
                | ConnectionErrorType::InvalidConfig
        )
    }

    /// Stable identifier, also used as a metrics label
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionErrorType::Timeout => "TIMEOUT",
            ConnectionErrorType::NetworkError => "NETWORK_ERROR",
            ConnectionErrorType::RateLimited => "RATE_LIMITED",
            ConnectionErrorType::AuthExpired => "AUTH_EXPIRED",
            ConnectionErrorType::AuthInvalid => "AUTH_INVALID",
            ConnectionErrorType::PermissionDenied => "PERMISSION_DENIED",
            ConnectionErrorType::NotFound => "NOT_FOUND",
            ConnectionErrorType::SchemaMismatch => "SCHEMA_MISMATCH",
            ConnectionErrorType::ServiceDown => "SERVICE_DOWN",
            ConnectionErrorType::InvalidConfig => "INVALID_CONFIG",
            ConnectionErrorType::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ConnectionErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized, immutable description of an integration failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorClassification {
    pub error_type: ConnectionErrorType,
    pub is_transient: bool,
    pub is_retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Sanitized message suitable for end users
    pub user_message: String,
    /// Raw detail retained for postmortems
    pub technical_details: String,
    pub suggested_action: String,
    /// Throttling hint, when the integration supplied one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorClassification {
    /// Builds a classification with the flags and messages implied by `error_type`
    pub fn new<S: Into<String>>(error_type: ConnectionErrorType, technical_details: S) -> Self {
        Self {
            error_type,
            is_transient: error_type.is_transient(),
            is_retryable: error_type.is_retryable(),
            http_status: None,
            user_message: default_user_message(error_type).to_string(),
            technical_details: technical_details.into(),
            suggested_action: default_suggested_action(error_type).to_string(),
            retry_after_ms: None,
        }
    }

    /// Sets the HTTP status the failure was observed with
    pub fn http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Sets the throttling hint
    pub fn retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Overrides the user-facing message
    pub fn user_message<S: Into<String>>(mut self, message: S) -> Self {
        self.user_message = message.into();
        self
    }

    /// Returns true if the engine can resolve this failure without a human
    pub fn can_auto_resolve(&self) -> bool {
        self.is_transient
    }

    /// The throttling hint as a duration
    pub fn retry_after_duration(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.technical_details)?;
        if let Some(status) = self.http_status {
            write!(f, " (HTTP {})", status)?;
        }
        Ok(())
    }
}

fn default_user_message(error_type: ConnectionErrorType) -> &'static str {
    match error_type {
        ConnectionErrorType::Timeout => "The service took too long to respond.",
        ConnectionErrorType::NetworkError => "Could not reach the service.",
        ConnectionErrorType::RateLimited => "The service is temporarily limiting requests.",
        ConnectionErrorType::AuthExpired => "Your connection has expired and needs to be refreshed.",
        ConnectionErrorType::AuthInvalid => "Your connection credentials are no longer valid.",
        ConnectionErrorType::PermissionDenied => "The connected account does not have permission for this action.",
        ConnectionErrorType::NotFound => "The requested resource could not be found.",
        ConnectionErrorType::SchemaMismatch => "The service returned data in an unexpected format.",
        ConnectionErrorType::ServiceDown => "The service is currently unavailable.",
        ConnectionErrorType::InvalidConfig => "This step is not configured correctly.",
        ConnectionErrorType::InternalError => "Something went wrong while talking to the service.",
    }
}

fn default_suggested_action(error_type: ConnectionErrorType) -> &'static str {
    match error_type {
        ConnectionErrorType::Timeout
        | ConnectionErrorType::NetworkError
        | ConnectionErrorType::ServiceDown => "Retry with exponential backoff",
        ConnectionErrorType::RateLimited => "Wait for the rate limit window, then retry",
        ConnectionErrorType::AuthExpired => "Refresh the connection credentials",
        ConnectionErrorType::AuthInvalid => "Reconnect the integration",
        ConnectionErrorType::PermissionDenied => "Grant the required permissions or use another account",
        ConnectionErrorType::NotFound => "Check that the referenced resource exists",
        ConnectionErrorType::SchemaMismatch => "Adapt to the new response format",
        ConnectionErrorType::InvalidConfig => "Review the step configuration",
        ConnectionErrorType::InternalError => "Retry, and contact support if the problem persists",
    }
}

/// The recovery strategies the engine can apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStrategy {
    Retry,
    RefreshAuth,
    RateLimitWait,
    SchemaAdapt,
    Escalate,
}

impl HealingStrategy {
    /// Selects the strategy for a classification
    pub fn for_error(error_type: ConnectionErrorType) -> Self {
        match error_type {
            ConnectionErrorType::Timeout
            | ConnectionErrorType::NetworkError
            | ConnectionErrorType::ServiceDown
            | ConnectionErrorType::InternalError => HealingStrategy::Retry,
            ConnectionErrorType::AuthExpired => HealingStrategy::RefreshAuth,
            ConnectionErrorType::RateLimited => HealingStrategy::RateLimitWait,
            ConnectionErrorType::SchemaMismatch => HealingStrategy::SchemaAdapt,
            ConnectionErrorType::AuthInvalid
            | ConnectionErrorType::PermissionDenied
            | ConnectionErrorType::NotFound
            | ConnectionErrorType::InvalidConfig => HealingStrategy::Escalate,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealingStrategy::Retry => "retry",
            HealingStrategy::RefreshAuth => "refresh_auth",
            HealingStrategy::RateLimitWait => "rate_limit_wait",
            HealingStrategy::SchemaAdapt => "schema_adapt",
            HealingStrategy::Escalate => "escalate",
        }
    }
}

impl fmt::Display for HealingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response options offered to a human when healing escalates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOption {
    Retry,
    Cancel,
    Reconfigure,
    Reconnect,
    Skip,
}

impl UserOption {
    /// The option set for an escalated classification; always contains
    /// retry, cancel and reconfigure
    pub fn for_error(error_type: Option<ConnectionErrorType>) -> Vec<UserOption> {
        let mut options = vec![UserOption::Retry, UserOption::Cancel, UserOption::Reconfigure];
        match error_type {
            Some(ConnectionErrorType::AuthExpired)
            | Some(ConnectionErrorType::AuthInvalid)
            | Some(ConnectionErrorType::PermissionDenied) => options.push(UserOption::Reconnect),
            Some(ConnectionErrorType::NotFound) | Some(ConnectionErrorType::SchemaMismatch) => {
                options.push(UserOption::Skip)
            }
            _ => {}
        }
        options
    }
}

/// A decision on an escalation, supplied by an automated handler or a human
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationDecision {
    Retry,
    Cancel,
    Reconfigure,
    Reconnect,
    Skip,
}

impl From<EscalationDecision> for UserOption {
    fn from(decision: EscalationDecision) -> Self {
        match decision {
            EscalationDecision::Retry => UserOption::Retry,
            EscalationDecision::Cancel => UserOption::Cancel,
            EscalationDecision::Reconfigure => UserOption::Reconfigure,
            EscalationDecision::Reconnect => UserOption::Reconnect,
            EscalationDecision::Skip => UserOption::Skip,
        }
    }
}
