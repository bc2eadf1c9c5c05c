//! # Healing Engine
//!
//! Picks a recovery strategy for a classified integration failure and
//! drives it to a result:
//!
//! | classification                         | strategy          |
//! |----------------------------------------|-------------------|
//! | timeout, network, service down, internal | retry with backoff |
//! | auth expired                           | refresh credentials, retry once |
//! | rate limited                           | wait for the hint, then retry |
//! | schema mismatch                        | one adaptation attempt |
//! | auth invalid, permission, not found, config | escalate |
//!
//! The circuit breaker is consulted before anything runs, and every
//! outcome feeds the breaker and the pattern learner. Retries within a
//! session are strictly sequential.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::classifier::{classify_error, detect_error, ClassificationContext, ExpectedShape, RawError};
use crate::escalation::{ConnectionInfo, CredentialRefresher, EscalationContext, EscalationHandler};
use crate::pattern_learner::{PatternLearner, PatternLearnerConfig};
use crate::retry::{self, BackoffPolicy};
use crate::schema::adapt_to_shape;
use crate::stats::{HealingMetrics, MetricsRecorder};
use crate::types::{
    ConnectionErrorType, ErrorClassification, EscalationDecision, HealingStrategy, UserOption,
};

/// Healing engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Operation calls per retry-based session
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// Upper bound on a single rate-limit wait
    pub max_rate_limit_wait: Duration,
    /// Wall-clock budget for one healing session
    pub max_duration: Duration,
    /// Bound on refresh and escalation callbacks
    pub callback_timeout: Duration,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.3,
            max_rate_limit_wait: Duration::from_secs(60),
            max_duration: Duration::from_secs(120),
            callback_timeout: Duration::from_secs(30),
        }
    }
}

impl HealingConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay, self.max_delay, self.jitter_factor)
    }
}

/// Process-wide state shared by every engine handle and execution
#[derive(Debug, Clone)]
pub struct ResilienceStores {
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub patterns: Arc<PatternLearner>,
}

impl ResilienceStores {
    pub fn new(breakers: CircuitBreakerConfig, patterns: PatternLearnerConfig) -> Self {
        Self {
            breakers: Arc::new(CircuitBreakerRegistry::new(breakers)),
            patterns: Arc::new(PatternLearner::new(patterns)),
        }
    }

    /// Clears both stores
    pub fn reset(&self) {
        self.breakers.reset_all();
        self.patterns.clear();
    }
}

impl Default for ResilienceStores {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), PatternLearnerConfig::default())
    }
}

/// Passed to the operation on every call
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptContext {
    pub session_id: String,
    /// One-based call number within the session
    pub attempt: u32,
    pub strategy: HealingStrategy,
}

/// The integration call being healed.
///
/// Returning `Ok` with an error-shaped payload (`success: false`, an
/// `error` field, a 4xx/5xx `status`) counts as a failure.
#[async_trait]
pub trait RetryableOperation: Send + Sync {
    async fn call(&self, context: &AttemptContext) -> Result<Value, RawError>;
}

#[async_trait]
impl<F, Fut> RetryableOperation for F
where
    F: Fn(AttemptContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, RawError>> + Send,
{
    async fn call(&self, context: &AttemptContext) -> Result<Value, RawError> {
        (self)(context.clone()).await
    }
}

/// A failed integration call to heal
pub struct HealingRequest {
    pub tool_id: String,
    pub tool_name: String,
    pub error: RawError,
    pub http_status: Option<u16>,
    pub context: Option<ClassificationContext>,
    pub operation_id: String,
    pub retry_operation: Arc<dyn RetryableOperation>,
    pub connection: Option<ConnectionInfo>,
    pub max_attempts: Option<u32>,
    pub max_duration: Option<Duration>,
    pub expected_shape: Option<ExpectedShape>,
    pub cancellation: Option<CancellationToken>,
}

impl HealingRequest {
    pub fn new<S, E>(tool_id: S, error: E, retry_operation: Arc<dyn RetryableOperation>) -> Self
    where
        S: Into<String>,
        E: Into<RawError>,
    {
        let tool_id = tool_id.into();
        Self {
            tool_name: tool_id.clone(),
            tool_id,
            error: error.into(),
            http_status: None,
            context: None,
            operation_id: Uuid::new_v4().to_string(),
            retry_operation,
            connection: None,
            max_attempts: None,
            max_duration: None,
            expected_shape: None,
            cancellation: None,
        }
    }

    pub fn tool_name<S: Into<String>>(mut self, name: S) -> Self {
        self.tool_name = name.into();
        self
    }

    pub fn operation_id<S: Into<String>>(mut self, id: S) -> Self {
        self.operation_id = id.into();
        self
    }

    pub fn http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn context(mut self, context: ClassificationContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    pub fn expected_shape(mut self, shape: ExpectedShape) -> Self {
        self.expected_shape = Some(shape);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl fmt::Debug for HealingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealingRequest")
            .field("tool_id", &self.tool_id)
            .field("operation_id", &self.operation_id)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// One operation call made during a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingAttempt {
    pub attempt_number: u32,
    pub strategy: HealingStrategy,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorClassification>,
    pub delay_ms: u64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a healing session.
///
/// `escalated` implies `user_options` is non-empty; `success` implies
/// `resolved_by` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingResult {
    pub session_id: String,
    pub success: bool,
    pub resolved_by: Option<HealingStrategy>,
    pub escalated: bool,
    pub escalation_reason: Option<String>,
    pub user_options: Vec<UserOption>,
    pub attempts: Vec<HealingAttempt>,
    pub total_attempts: u32,
    pub original_error: ErrorClassification,
    /// Last error observed, if any call was made
    pub final_error: Option<ErrorClassification>,
    /// Decision supplied by an escalation handler
    pub decision: Option<EscalationDecision>,
    /// Operation output when healed
    pub output: Option<Value>,
    /// Session abandoned because the caller cancelled
    pub cancelled: bool,
}

impl HealingResult {
    /// The error a caller should report when healing did not succeed
    pub fn effective_error(&self) -> &ErrorClassification {
        self.final_error.as_ref().unwrap_or(&self.original_error)
    }
}

/// A healing session in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub tool_id: String,
    pub operation_id: String,
    pub error_type: ConnectionErrorType,
    pub strategy: HealingStrategy,
    pub started_at: DateTime<Utc>,
    pub attempts: u32,
}

enum Step {
    Succeeded(Value),
    Failed(ErrorClassification),
    CircuitOpen,
    OutOfTime,
    Cancelled,
}

enum Outcome {
    Healed(Value),
    Escalate(String),
    Cancelled,
}

struct Run<'a> {
    request: &'a HealingRequest,
    session_id: String,
    deadline: Instant,
    max_attempts: u32,
    attempts: Vec<HealingAttempt>,
    last_error: Option<ErrorClassification>,
}

/// Removes the session entry however the session future ends
struct SessionGuard<'a> {
    sessions: &'a RwLock<HashMap<String, ActiveSession>>,
    session_id: String,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

/// Self-healing engine. Cheap to share behind an `Arc`.
pub struct HealingEngine {
    config: HealingConfig,
    stores: ResilienceStores,
    refresher: RwLock<Option<Arc<dyn CredentialRefresher>>>,
    escalation_handler: RwLock<Option<Arc<dyn EscalationHandler>>>,
    session_handlers: RwLock<HashMap<String, Arc<dyn EscalationHandler>>>,
    sessions: RwLock<HashMap<String, ActiveSession>>,
    metrics: MetricsRecorder,
}

impl fmt::Debug for HealingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealingEngine")
            .field("config", &self.config)
            .field("active_sessions", &self.active_sessions().len())
            .finish_non_exhaustive()
    }
}

impl HealingEngine {
    pub fn new(config: HealingConfig, stores: ResilienceStores) -> Self {
        Self {
            config,
            stores,
            refresher: RwLock::new(None),
            escalation_handler: RwLock::new(None),
            session_handlers: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            metrics: MetricsRecorder::default(),
        }
    }

    pub fn config(&self) -> &HealingConfig {
        &self.config
    }

    pub fn stores(&self) -> &ResilienceStores {
        &self.stores
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.stores.breakers
    }

    pub fn patterns(&self) -> &PatternLearner {
        &self.stores.patterns
    }

    pub fn set_credential_refresher(&self, refresher: Arc<dyn CredentialRefresher>) {
        *self.refresher.write().unwrap_or_else(PoisonError::into_inner) = Some(refresher);
    }

    pub fn set_escalation_handler(&self, handler: Arc<dyn EscalationHandler>) {
        *self
            .escalation_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Registers a handler used only for requests with this operation id
    pub fn register_session_handler<S: Into<String>>(
        &self,
        operation_id: S,
        handler: Arc<dyn EscalationHandler>,
    ) {
        self.session_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation_id.into(), handler);
    }

    pub fn remove_session_handler(&self, operation_id: &str) {
        self.session_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(operation_id);
    }

    pub fn active_sessions(&self) -> Vec<ActiveSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn metrics(&self) -> HealingMetrics {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Attempts to recover from a failed integration call.
    #[instrument(
        skip_all,
        fields(tool_id = %request.tool_id, operation_id = %request.operation_id)
    )]
    pub async fn attempt_healing(&self, request: HealingRequest) -> HealingResult {
        let started = Instant::now();
        let original = classify_error(
            &request.error,
            request.http_status,
            request.context.as_ref(),
        );
        let session_id = Uuid::new_v4().to_string();

        if self.stores.breakers.is_open(&request.tool_id) {
            warn!(
                error_type = %original.error_type,
                "Circuit breaker open, escalating without healing"
            );
            self.metrics.circuit_rejected(&request.tool_id);
            self.metrics
                .outcome(original.error_type, None, false, true, started.elapsed());
            return HealingResult {
                session_id,
                success: false,
                resolved_by: None,
                escalated: true,
                escalation_reason: Some(circuit_reason(&request.tool_id)),
                user_options: UserOption::for_error(Some(original.error_type)),
                attempts: Vec::new(),
                total_attempts: 0,
                original_error: original,
                final_error: None,
                decision: None,
                output: None,
                cancelled: false,
            };
        }

        let strategy = HealingStrategy::for_error(original.error_type);
        info!(
            session_id = %session_id,
            error_type = %original.error_type,
            strategy = strategy.as_str(),
            "Starting healing session"
        );

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session_id.clone(),
                ActiveSession {
                    session_id: session_id.clone(),
                    tool_id: request.tool_id.clone(),
                    operation_id: request.operation_id.clone(),
                    error_type: original.error_type,
                    strategy,
                    started_at: Utc::now(),
                    attempts: 0,
                },
            );
        let _guard = SessionGuard {
            sessions: &self.sessions,
            session_id: session_id.clone(),
        };

        let mut run = Run {
            request: &request,
            session_id: session_id.clone(),
            deadline: started + request.max_duration.unwrap_or(self.config.max_duration),
            max_attempts: request.max_attempts.unwrap_or(self.config.max_attempts).max(1),
            attempts: Vec::new(),
            last_error: None,
        };

        let outcome = match strategy {
            HealingStrategy::Retry => self.retry_loop(&mut run, strategy, None).await,
            HealingStrategy::RefreshAuth => self.refresh_auth(&mut run).await,
            HealingStrategy::RateLimitWait => {
                let wait = original
                    .retry_after_duration()
                    .unwrap_or(self.config.base_delay)
                    .min(self.config.max_rate_limit_wait);
                debug!(wait_ms = wait.as_millis() as u64, "Waiting out rate limit");
                self.retry_loop(&mut run, strategy, Some(wait)).await
            }
            HealingStrategy::SchemaAdapt => self.schema_adapt(&mut run).await,
            HealingStrategy::Escalate => Outcome::Escalate(format!(
                "{} requires user action: {}",
                original.error_type, original.user_message
            )),
        };

        let mut result = HealingResult {
            session_id: session_id.clone(),
            success: false,
            resolved_by: None,
            escalated: false,
            escalation_reason: None,
            user_options: Vec::new(),
            attempts: Vec::new(),
            total_attempts: 0,
            original_error: original.clone(),
            final_error: None,
            decision: None,
            output: None,
            cancelled: false,
        };

        match outcome {
            Outcome::Healed(output) => {
                result.success = true;
                result.resolved_by = Some(strategy);
                result.output = Some(output);
            }
            Outcome::Cancelled => {
                info!(session_id = %session_id, "Healing session cancelled");
                result.cancelled = true;
            }
            Outcome::Escalate(reason) => {
                let error_type = run
                    .last_error
                    .as_ref()
                    .map_or(original.error_type, |e| e.error_type);
                result.escalated = true;
                result.user_options = UserOption::for_error(Some(error_type));
                result.escalation_reason = Some(reason);
                self.consult_handler(&mut run, &mut result).await;
            }
        }

        result.total_attempts = run.attempts.len() as u32;
        result.attempts = run.attempts;
        result.final_error = run.last_error;

        self.settle(&request, strategy, &result, started.elapsed());
        result
    }

    /// Escalation handler pass; an automated `retry` buys one more call
    async fn consult_handler(&self, run: &mut Run<'_>, result: &mut HealingResult) {
        let handler = {
            let per_session = self
                .session_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&run.request.operation_id)
                .cloned();
            per_session.or_else(|| {
                self.escalation_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
        };
        let Some(handler) = handler else {
            return;
        };

        let context = EscalationContext {
            session_id: run.session_id.clone(),
            tool_id: run.request.tool_id.clone(),
            tool_name: run.request.tool_name.clone(),
            operation_id: run.request.operation_id.clone(),
            classification: run
                .last_error
                .clone()
                .unwrap_or_else(|| result.original_error.clone()),
            reason: result.escalation_reason.clone().unwrap_or_default(),
            user_options: result.user_options.clone(),
            attempts: run.attempts.len() as u32,
        };

        let decision =
            match tokio::time::timeout(self.config.callback_timeout, handler.decide(&context)).await {
                Ok(decision) => decision,
                Err(_) => {
                    warn!(session_id = %run.session_id, "Escalation handler timed out");
                    None
                }
            };
        result.decision = decision;

        let Some(decision) = decision else {
            return;
        };
        info!(session_id = %run.session_id, ?decision, "Escalation handler decided");

        if decision == EscalationDecision::Retry {
            run.deadline = Instant::now() + run.request.max_duration.unwrap_or(self.config.max_duration);
            let delay = self.config.backoff().delay_for(0);
            let shape = run.request.expected_shape;
            match self.invoke(run, HealingStrategy::Retry, delay, shape).await
            {
                Step::Succeeded(output) => {
                    result.success = true;
                    result.escalated = false;
                    result.escalation_reason = None;
                    result.user_options.clear();
                    result.resolved_by = Some(HealingStrategy::Retry);
                    result.output = Some(output);
                }
                Step::Cancelled => result.cancelled = true,
                Step::Failed(_) | Step::CircuitOpen | Step::OutOfTime => {}
            }
        }
    }

    /// Feeds the breaker, the pattern learner and the stats
    fn settle(
        &self,
        request: &HealingRequest,
        strategy: HealingStrategy,
        result: &HealingResult,
        elapsed: Duration,
    ) {
        if result.cancelled && !result.success {
            return;
        }

        let error_type = result.effective_error().error_type;
        if result.success {
            self.stores.breakers.record_success(&request.tool_id);
        } else if !error_type.is_permanent() {
            self.stores.breakers.record_failure(&request.tool_id);
        }

        self.stores.patterns.record(
            &request.tool_id,
            result.original_error.error_type,
            strategy,
            result.success,
        );

        self.metrics.outcome(
            result.original_error.error_type,
            Some(strategy),
            result.success,
            result.escalated,
            elapsed,
        );

        if result.success {
            info!(
                session_id = %result.session_id,
                resolved_by = ?result.resolved_by,
                attempts = result.total_attempts,
                "Healing succeeded"
            );
        } else {
            warn!(
                session_id = %result.session_id,
                error_type = %error_type,
                attempts = result.total_attempts,
                reason = result.escalation_reason.as_deref().unwrap_or(""),
                "Healing escalated"
            );
        }
    }

    async fn retry_loop(
        &self,
        run: &mut Run<'_>,
        strategy: HealingStrategy,
        first_delay: Option<Duration>,
    ) -> Outcome {
        let backoff = self.config.backoff();
        let mut attempt = 0;
        let mut next_delay = first_delay.unwrap_or_else(|| backoff.delay_for(0));
        let shape = run.request.expected_shape;

        while attempt < run.max_attempts {
            match self.invoke(run, strategy, next_delay, shape).await {
                Step::Succeeded(output) => return Outcome::Healed(output),
                Step::Failed(error) => {
                    if !error.is_retryable {
                        return Outcome::Escalate(format!(
                            "{} is not retryable: {}",
                            error.error_type, error.technical_details
                        ));
                    }
                    attempt += 1;
                    next_delay = match error.retry_after_duration() {
                        Some(hint) => hint.min(self.config.max_rate_limit_wait),
                        None => backoff.delay_for(attempt),
                    };
                }
                Step::CircuitOpen => return Outcome::Escalate(circuit_reason(&run.request.tool_id)),
                Step::OutOfTime => {
                    return Outcome::Escalate(format!(
                        "healing time limit exceeded after {} attempts",
                        run.attempts.len()
                    ))
                }
                Step::Cancelled => return Outcome::Cancelled,
            }
        }

        let detail = run
            .last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        Outcome::Escalate(format!(
            "retries exhausted after {} attempts: {}",
            run.attempts.len(),
            detail
        ))
    }

    async fn refresh_auth(&self, run: &mut Run<'_>) -> Outcome {
        let refresher = self
            .refresher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(refresher) = refresher else {
            return Outcome::Escalate("no credential refresher registered".to_string());
        };

        let refreshed = tokio::time::timeout(
            self.config.callback_timeout,
            refresher.refresh(&run.request.tool_id, run.request.connection.as_ref()),
        )
        .await;

        match refreshed {
            Ok(Ok(())) => debug!(session_id = %run.session_id, "Credentials refreshed"),
            Ok(Err(reason)) => {
                return Outcome::Escalate(format!("credential refresh failed: {reason}"))
            }
            Err(_) => return Outcome::Escalate("credential refresh timed out".to_string()),
        }

        let shape = run.request.expected_shape;
        match self
            .invoke(run, HealingStrategy::RefreshAuth, Duration::ZERO, shape)
            .await
        {
            Step::Succeeded(output) => Outcome::Healed(output),
            Step::Failed(error) => Outcome::Escalate(format!(
                "operation still failing after credential refresh: {error}"
            )),
            Step::CircuitOpen => Outcome::Escalate(circuit_reason(&run.request.tool_id)),
            Step::OutOfTime => Outcome::Escalate("healing time limit exceeded".to_string()),
            Step::Cancelled => Outcome::Cancelled,
        }
    }

    async fn schema_adapt(&self, run: &mut Run<'_>) -> Outcome {
        let shape = run.request.expected_shape;
        match self
            .invoke(run, HealingStrategy::SchemaAdapt, Duration::ZERO, None)
            .await
        {
            Step::Succeeded(output) => match shape {
                None => Outcome::Healed(output),
                Some(shape) => match adapt_to_shape(&output, shape) {
                    Some(adapted) => Outcome::Healed(adapted),
                    None => {
                        let error = ErrorClassification::new(
                            ConnectionErrorType::SchemaMismatch,
                            format!(
                                "expected {} but received {}",
                                shape.as_str(),
                                ExpectedShape::describe(&output)
                            ),
                        );
                        if let Some(last) = run.attempts.last_mut() {
                            last.success = false;
                            last.error = Some(error.clone());
                        }
                        run.last_error = Some(error);
                        Outcome::Escalate("schema mismatch persists after adaptation".to_string())
                    }
                },
            },
            Step::Failed(error) => Outcome::Escalate(format!(
                "schema adaptation retry failed: {error}"
            )),
            Step::CircuitOpen => Outcome::Escalate(circuit_reason(&run.request.tool_id)),
            Step::OutOfTime => Outcome::Escalate("healing time limit exceeded".to_string()),
            Step::Cancelled => Outcome::Cancelled,
        }
    }

    /// Waits `delay`, then makes one operation call
    async fn invoke(
        &self,
        run: &mut Run<'_>,
        strategy: HealingStrategy,
        delay: Duration,
        shape: Option<ExpectedShape>,
    ) -> Step {
        let cancel = run.request.cancellation.as_ref();

        if !delay.is_zero() {
            if Instant::now() + delay >= run.deadline {
                return Step::OutOfTime;
            }
            if !retry::wait(delay, cancel).await {
                return Step::Cancelled;
            }
        }
        if cancel.map_or(false, CancellationToken::is_cancelled) {
            return Step::Cancelled;
        }
        if self.stores.breakers.is_open(&run.request.tool_id) {
            return Step::CircuitOpen;
        }
        let remaining = run.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Step::OutOfTime;
        }

        let attempt_number = run.attempts.len() as u32 + 1;
        let context = AttemptContext {
            session_id: run.session_id.clone(),
            attempt: attempt_number,
            strategy,
        };
        self.metrics.attempt(strategy);
        if let Some(session) = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&run.session_id)
        {
            session.attempts = attempt_number;
        }

        let call_started = Instant::now();
        let outcome =
            match tokio::time::timeout(remaining, run.request.retry_operation.call(&context)).await {
                Ok(Ok(value)) => match detect_error(&value, shape) {
                    None => Ok(value),
                    Some(error) => Err(error),
                },
                Ok(Err(raw)) => Err(classify_error(&raw, None, None)),
                Err(_) => Err(ErrorClassification::new(
                    ConnectionErrorType::Timeout,
                    "operation exceeded the healing time limit",
                )),
            };

        // A cancelled session discards whatever the call produced
        if cancel.map_or(false, CancellationToken::is_cancelled) {
            return Step::Cancelled;
        }

        let error = outcome.as_ref().err().cloned();
        debug!(
            session_id = %run.session_id,
            attempt = attempt_number,
            strategy = strategy.as_str(),
            success = error.is_none(),
            "Healing attempt finished"
        );
        run.attempts.push(HealingAttempt {
            attempt_number,
            strategy,
            success: error.is_none(),
            error: error.clone(),
            delay_ms: delay.as_millis() as u64,
            duration_ms: call_started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });

        match outcome {
            Ok(value) => Step::Succeeded(value),
            Err(error) => {
                run.last_error = Some(error.clone());
                Step::Failed(error)
            }
        }
    }
}

fn circuit_reason(tool_id: &str) -> String {
    format!("circuit breaker open for {tool_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RetryableOperation for Flaky {
        async fn call(&self, _context: &AttemptContext) -> Result<Value, RawError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(RawError::Timeout("request timed out".into()))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    fn engine() -> HealingEngine {
        HealingEngine::new(HealingConfig::default(), ResilienceStores::default())
    }

    #[tokio::test(start_paused = true)]
    async fn retry_heals_transient_failure() {
        let engine = engine();
        let op = Arc::new(Flaky { failures: 1, calls: AtomicU32::new(0) });
        let result = engine
            .attempt_healing(HealingRequest::new("slack", RawError::Timeout("timed out".into()), op.clone()))
            .await;

        assert!(result.success);
        assert_eq!(result.resolved_by, Some(HealingStrategy::Retry));
        assert_eq!(result.total_attempts, 2);
        assert!(!result.escalated);
        assert!(engine.active_sessions().is_empty());
        assert_eq!(engine.metrics().successful_healings, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_escalate_with_options() {
        let engine = engine();
        let op = Arc::new(Flaky { failures: u32::MAX, calls: AtomicU32::new(0) });
        let result = engine
            .attempt_healing(
                HealingRequest::new("slack", RawError::Timeout("timed out".into()), op.clone())
                    .max_attempts(3),
            )
            .await;

        assert!(!result.success);
        assert!(result.escalated);
        assert_eq!(result.total_attempts, 3);
        assert!(result.escalation_reason.unwrap().contains("retries exhausted"));
        assert!(!result.user_options.is_empty());
        assert_eq!(engine.circuit_breakers().snapshot("slack").consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_session() {
        let engine = engine();
        let token = CancellationToken::new();
        token.cancel();
        let op = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let result = engine
            .attempt_healing(
                HealingRequest::new("crm", RawError::Timeout("timed out".into()), op.clone())
                    .cancellation(token),
            )
            .await;

        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(op.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_limit_ends_retries_early() {
        let engine = engine();
        let op = Arc::new(Flaky { failures: u32::MAX, calls: AtomicU32::new(0) });
        let result = engine
            .attempt_healing(
                HealingRequest::new("crm", RawError::Timeout("timed out".into()), op.clone())
                    .max_attempts(10)
                    .max_duration(Duration::from_secs(5)),
            )
            .await;

        assert!(result.escalated);
        assert!(result.total_attempts < 10);
        assert!(result.escalation_reason.unwrap().contains("time limit"));
    }
}
