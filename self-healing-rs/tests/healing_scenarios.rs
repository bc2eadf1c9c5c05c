use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use self_healing::{
    AttemptContext, CircuitState, ClassificationContext, ConnectionErrorType, ConnectionInfo,
    CredentialRefresher, ErrorClassification, EscalationDecision, ExpectedShape, FixedDecision,
    HealingConfig, HealingEngine, HealingRequest, HealingStrategy, RawError, ResilienceStores,
    RetryableOperation, UserOption,
};

/// Replays a fixed script of responses, then repeats the last one
struct Scripted {
    responses: Vec<Result<Value, RawError>>,
    calls: AtomicU32,
}

impl Scripted {
    fn new(responses: Vec<Result<Value, RawError>>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            calls: AtomicU32::new(0),
        })
    }

    fn always(response: Result<Value, RawError>) -> Arc<Self> {
        Self::new(vec![response])
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetryableOperation for Scripted {
    async fn call(&self, _context: &AttemptContext) -> Result<Value, RawError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let index = n.min(self.responses.len() - 1);
        self.responses[index].clone()
    }
}

struct CountingRefresher {
    succeed: bool,
    calls: AtomicU32,
}

#[async_trait]
impl CredentialRefresher for CountingRefresher {
    async fn refresh(
        &self,
        _tool_id: &str,
        _connection: Option<&ConnectionInfo>,
    ) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(())
        } else {
            Err("refresh token revoked".to_string())
        }
    }
}

fn engine() -> HealingEngine {
    HealingEngine::new(HealingConfig::default(), ResilienceStores::default())
}

fn timeout() -> RawError {
    RawError::Timeout("request timed out after 30s".to_string())
}

#[tokio::test(start_paused = true)]
async fn five_timeouts_open_the_breaker_and_the_sixth_fast_fails() {
    let engine = engine();
    let op = Scripted::always(Err(timeout()));

    for call in 1..=5 {
        let result = engine
            .attempt_healing(HealingRequest::new("slack", timeout(), op.clone()))
            .await;
        assert!(result.escalated);

        let expected = if call < 5 { CircuitState::Closed } else { CircuitState::Open };
        assert_eq!(engine.circuit_breakers().state("slack"), expected, "after call {call}");
    }

    let calls_before = op.calls();
    let started = std::time::Instant::now();
    let result = engine
        .attempt_healing(HealingRequest::new("slack", timeout(), op.clone()))
        .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(result.escalated);
    assert!(result
        .escalation_reason
        .as_deref()
        .unwrap()
        .contains("circuit breaker"));
    assert_eq!(result.total_attempts, 0);
    assert_eq!(op.calls(), calls_before);
    assert!(result.user_options.contains(&UserOption::Retry));
}

#[tokio::test(start_paused = true)]
async fn expired_auth_is_refreshed_and_retried() {
    let engine = engine();
    let refresher = Arc::new(CountingRefresher {
        succeed: true,
        calls: AtomicU32::new(0),
    });
    engine.set_credential_refresher(refresher.clone());

    let op = Scripted::always(Ok(json!({"messages": []})));
    let request = HealingRequest::new("gmail", RawError::from("Unauthorized"), op.clone())
        .http_status(401)
        .context(ClassificationContext::default().with_auth_subcode("token_expired"))
        .connection(ConnectionInfo::new("conn-1"));

    let result = engine.attempt_healing(request).await;

    assert_eq!(result.original_error.error_type, ConnectionErrorType::AuthExpired);
    assert!(result.success);
    assert_eq!(result.resolved_by, Some(HealingStrategy::RefreshAuth));
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(op.calls(), 1);
    assert_eq!(result.output, Some(json!({"messages": []})));
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_escalates_without_retrying() {
    let engine = engine();
    engine.set_credential_refresher(Arc::new(CountingRefresher {
        succeed: false,
        calls: AtomicU32::new(0),
    }));

    let op = Scripted::always(Ok(json!({})));
    let classified = ErrorClassification::new(ConnectionErrorType::AuthExpired, "token expired");
    let result = engine
        .attempt_healing(HealingRequest::new("gmail", classified, op.clone()))
        .await;

    assert!(result.escalated);
    assert_eq!(op.calls(), 0);
    assert!(result
        .escalation_reason
        .unwrap()
        .contains("credential refresh failed"));
    assert!(result.user_options.contains(&UserOption::Reconnect));
}

#[test_log::test(tokio::test)]
async fn invalid_auth_escalates_on_first_attempt() {
    let engine = engine();
    let op = Scripted::always(Ok(json!({})));
    let request = HealingRequest::new("hubspot", RawError::from("invalid api key"), op.clone())
        .http_status(401);

    let result = engine.attempt_healing(request).await;

    assert_eq!(result.original_error.error_type, ConnectionErrorType::AuthInvalid);
    assert!(!result.original_error.can_auto_resolve());
    assert!(result.escalated);
    assert!(!result.success);
    assert_eq!(result.total_attempts, 0);
    assert_eq!(op.calls(), 0);
    for option in [UserOption::Retry, UserOption::Cancel, UserOption::Reconfigure] {
        assert!(result.user_options.contains(&option), "missing {option:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn permanent_errors_do_not_trip_the_breaker() {
    let engine = engine();
    let op = Scripted::always(Ok(json!({})));
    for _ in 0..8 {
        let denied = ErrorClassification::new(ConnectionErrorType::PermissionDenied, "403");
        engine
            .attempt_healing(HealingRequest::new("drive", denied, op.clone()))
            .await;
    }
    assert_eq!(engine.circuit_breakers().state("drive"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_waits_for_the_hint_before_retrying() {
    let engine = engine();
    let op = Scripted::always(Ok(json!([1, 2, 3])));
    let limited = ErrorClassification::new(ConnectionErrorType::RateLimited, "429")
        .retry_after(Duration::from_secs(5));

    let started = tokio::time::Instant::now();
    let result = engine
        .attempt_healing(HealingRequest::new("sheets", limited, op.clone()))
        .await;

    assert!(result.success);
    assert_eq!(result.resolved_by, Some(HealingStrategy::RateLimitWait));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(result.attempts[0].delay_ms, 5_000);
}

#[tokio::test(start_paused = true)]
async fn schema_mismatch_is_adapted_once() {
    let engine = engine();
    let op = Scripted::always(Ok(json!({"data": [{"id": 1}]})));
    let mismatch = RawError::from(json!({"id": 1}));
    let request = HealingRequest::new(
        "airtable",
        RawError::Classified(ErrorClassification::new(
            ConnectionErrorType::SchemaMismatch,
            format!("expected array but received object: {mismatch}"),
        )),
        op.clone(),
    )
    .expected_shape(ExpectedShape::Array);

    let result = engine.attempt_healing(request).await;

    assert!(result.success);
    assert_eq!(result.resolved_by, Some(HealingStrategy::SchemaAdapt));
    assert_eq!(result.output, Some(json!([{"id": 1}])));
    assert_eq!(op.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn persistent_schema_mismatch_escalates() {
    let engine = engine();
    let op = Scripted::always(Ok(json!("plain text")));
    let request = HealingRequest::new(
        "airtable",
        ErrorClassification::new(ConnectionErrorType::SchemaMismatch, "expected array"),
        op.clone(),
    )
    .expected_shape(ExpectedShape::Array);

    let result = engine.attempt_healing(request).await;

    assert!(result.escalated);
    assert_eq!(op.calls(), 1);
    assert!(result.user_options.contains(&UserOption::Skip));
    assert_eq!(
        result.final_error.unwrap().error_type,
        ConnectionErrorType::SchemaMismatch
    );
}

#[tokio::test(start_paused = true)]
async fn automated_retry_decision_buys_one_more_attempt() {
    let engine = engine();
    engine.set_escalation_handler(Arc::new(FixedDecision(EscalationDecision::Retry)));

    let op = Scripted::always(Ok(json!({"ok": true})));
    let missing = ErrorClassification::new(ConnectionErrorType::NotFound, "sheet not found");
    let result = engine
        .attempt_healing(HealingRequest::new("sheets", missing, op.clone()))
        .await;

    assert!(result.success);
    assert!(!result.escalated);
    assert_eq!(result.decision, Some(EscalationDecision::Retry));
    assert_eq!(result.resolved_by, Some(HealingStrategy::Retry));
    assert_eq!(op.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn session_handler_takes_precedence() {
    let engine = engine();
    engine.set_escalation_handler(Arc::new(FixedDecision(EscalationDecision::Cancel)));
    engine.register_session_handler("op-42", Arc::new(FixedDecision(EscalationDecision::Skip)));

    let op = Scripted::always(Ok(json!({})));
    let invalid = || ErrorClassification::new(ConnectionErrorType::InvalidConfig, "missing sheet id");

    let scoped = engine
        .attempt_healing(HealingRequest::new("sheets", invalid(), op.clone()).operation_id("op-42"))
        .await;
    let global = engine
        .attempt_healing(HealingRequest::new("sheets", invalid(), op.clone()).operation_id("op-7"))
        .await;

    assert_eq!(scoped.decision, Some(EscalationDecision::Skip));
    assert_eq!(global.decision, Some(EscalationDecision::Cancel));
    assert!(scoped.escalated && global.escalated);
}

#[tokio::test(start_paused = true)]
async fn error_shaped_success_payload_counts_as_failure() {
    let engine = engine();
    let op = Scripted::new(vec![
        Ok(json!({"success": false, "error": "service unavailable"})),
        Ok(json!({"success": true, "rows": 3})),
    ]);

    let result = engine
        .attempt_healing(HealingRequest::new("crm", timeout(), op.clone()))
        .await;

    assert!(result.success);
    assert_eq!(result.total_attempts, 2);
    assert!(!result.attempts[0].success);
    assert!(result.attempts[1].success);
}

#[tokio::test(start_paused = true)]
async fn transient_resolution_rate_is_tracked() {
    let engine = engine();
    let healed = Scripted::new(vec![Err(timeout()), Ok(json!({}))]);
    for _ in 0..3 {
        let op = Scripted::new(vec![Err(timeout()), Ok(json!({}))]);
        engine
            .attempt_healing(HealingRequest::new("notion", timeout(), op))
            .await;
    }
    engine
        .attempt_healing(HealingRequest::new("notion", timeout(), healed))
        .await;

    let metrics = engine.metrics();
    assert_eq!(metrics.total_requests, 4);
    assert_eq!(metrics.transient_errors, 4);
    assert!((metrics.transient_resolution_rate() - 1.0).abs() < f64::EPSILON);
    assert_eq!(metrics.by_strategy["retry"].successes, 4);

    let pattern = engine
        .patterns()
        .get("notion", ConnectionErrorType::Timeout, HealingStrategy::Retry)
        .unwrap();
    assert_eq!(pattern.sample_count, 4);
    assert!(pattern.confidence > 0.5);

    engine.reset_metrics();
    assert_eq!(engine.metrics().total_requests, 0);
}

#[test]
fn healing_runs_on_a_plain_runtime() {
    let engine = HealingEngine::new(
        HealingConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..HealingConfig::default()
        },
        ResilienceStores::default(),
    );
    let op = Scripted::new(vec![Err(timeout()), Ok(json!({"ok": true}))]);

    let result = tokio_test::block_on(
        engine.attempt_healing(HealingRequest::new("mailchimp", timeout(), op)),
    );
    assert!(result.success);
}
