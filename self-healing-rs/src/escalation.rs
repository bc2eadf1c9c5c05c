//! Extension points the healing engine calls out to.
//!
//! Both traits are async and may take arbitrarily long; the engine bounds
//! every call with `HealingConfig::callback_timeout` and treats a timeout
//! as a failed refresh or an absent decision. Implementations should be
//! idempotent: the engine may call them once per healing session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ErrorClassification, EscalationDecision, UserOption};

/// Connection the failing call was made with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl ConnectionInfo {
    pub fn new<S: Into<String>>(connection_id: S) -> Self {
        Self {
            connection_id: connection_id.into(),
            ..Self::default()
        }
    }
}

/// Refreshes expired credentials for an integration.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Returns `Err` with a human-readable reason when the refresh failed.
    async fn refresh(
        &self,
        tool_id: &str,
        connection: Option<&ConnectionInfo>,
    ) -> Result<(), String>;
}

/// What the escalation handler is asked to decide on
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationContext {
    pub session_id: String,
    pub tool_id: String,
    pub tool_name: String,
    pub operation_id: String,
    pub classification: ErrorClassification,
    pub reason: String,
    pub user_options: Vec<UserOption>,
    pub attempts: u32,
}

/// Makes (or defers) a decision on an escalated error.
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    /// `None` leaves the decision to a human; the escalation is returned to
    /// the caller as pending.
    async fn decide(&self, context: &EscalationContext) -> Option<EscalationDecision>;
}

/// Handler that always answers with the same decision
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub EscalationDecision);

#[async_trait]
impl EscalationHandler for FixedDecision {
    async fn decide(&self, _context: &EscalationContext) -> Option<EscalationDecision> {
        Some(self.0)
    }
}
