use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autonomous_executor::{
    AutonomousExecutionController, ExecutionConfig, ExecutionError, ExecutionObserver,
    ExecutionOverrides, ExecutionPlan, ExecutionState, ExecutionStatus, ExecutionStore,
    FileExecutionStore, InMemoryExecutionStore, IntegrationClient, IntegrationRegistry,
    IntegrationRequest, PauseReason, ResumeDecision, StartRequest, Task, TaskStatus, TaskType,
};
use self_healing::{
    EscalationDecision, FixedDecision, HealingConfig, HealingEngine, RawError, ResilienceStores,
    UserOption,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

/// Replays a fixed script of responses, then repeats the last one
struct ScriptedClient {
    responses: Vec<Result<Value, RawError>>,
    calls: AtomicU32,
}

impl ScriptedClient {
    fn new(responses: Vec<Result<Value, RawError>>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationClient for ScriptedClient {
    async fn execute(&self, _request: &IntegrationRequest) -> Result<Value, RawError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.responses[n.min(self.responses.len() - 1)].clone()
    }
}

/// Signals when called, then hangs far longer than any test runs
struct SlowClient {
    started: Arc<Notify>,
}

#[async_trait]
impl IntegrationClient for SlowClient {
    async fn execute(&self, _request: &IntegrationRequest) -> Result<Value, RawError> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!({"late": true}))
    }
}

struct CompletionObserver(mpsc::UnboundedSender<ExecutionStatus>);

#[async_trait]
impl ExecutionObserver for CompletionObserver {
    async fn on_completion(&self, state: &ExecutionState) {
        let _ = self.0.send(state.status);
    }
}

fn controller_with(store: Arc<dyn ExecutionStore>) -> AutonomousExecutionController {
    let healing = Arc::new(HealingEngine::new(
        HealingConfig::default(),
        ResilienceStores::default(),
    ));
    AutonomousExecutionController::new(
        ExecutionConfig::default(),
        healing,
        Arc::new(IntegrationRegistry::new()),
        store,
    )
}

fn controller() -> AutonomousExecutionController {
    controller_with(Arc::new(InMemoryExecutionStore::new()))
}

fn request(plan: ExecutionPlan) -> StartRequest {
    StartRequest {
        workflow_id: "wf-weekly-report".to_string(),
        user_id: "user-1".to_string(),
        project_id: "project-1".to_string(),
        plan,
        overrides: ExecutionOverrides::default(),
    }
}

fn count_task(id: &str, cost: f64) -> Task {
    Task::new(id, TaskType::Transform)
        .config(json!({"operation": "aggregate", "input": [1, 2, 3]}))
        .cost(cost)
}

async fn start(controller: &AutonomousExecutionController, request: StartRequest) -> String {
    let response = controller.start_autonomous_execution(request).await;
    assert!(response.success, "start rejected: {:?}", response.validation_errors);
    response.execution_id.unwrap()
}

async fn wait_for(
    controller: &AutonomousExecutionController,
    execution_id: &str,
    status: ExecutionStatus,
) -> ExecutionState {
    let mut rx = controller.subscribe_status(execution_id).unwrap();
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == status))
        .await
        .expect("status not reached in time")
        .expect("status channel closed");
    controller.get_execution_state(execution_id).unwrap()
}

#[tokio::test]
async fn missing_workflow_id_is_rejected_without_allocating() {
    let controller = controller();
    let mut req = request(ExecutionPlan::default());
    req.workflow_id = String::new();

    let response = controller.start_autonomous_execution(req).await;

    assert!(!response.success);
    assert!(response.execution_id.is_none());
    assert!(response
        .validation_errors
        .iter()
        .any(|e| e.contains("workflowId is required")));
    assert!(controller.list_executions().is_empty());
}

#[tokio::test]
async fn invalid_overrides_are_rejected() {
    let controller = controller();
    let mut req = request(ExecutionPlan::default());
    req.overrides.max_budget = Some(-5.0);

    let response = controller.start_autonomous_execution(req).await;
    assert!(!response.success);
    assert!(response.validation_errors[0].contains("maxBudget"));
}

#[test_log::test(tokio::test)]
async fn plan_runs_to_completion() {
    let controller = controller();
    let crm = ScriptedClient::new(vec![Ok(json!([
        {"name": "Acme", "amount": 10},
        {"name": "Globex", "amount": 30}
    ]))]);
    controller.integrations().register("crm", crm.clone());

    let plan = ExecutionPlan::new(vec![
        Task::new("fetch", TaskType::Integration)
            .config(json!({"app": "crm", "operation": "list_deals"}))
            .cost(1.0),
        Task::new("large", TaskType::Transform)
            .depends_on("fetch")
            .config(json!({"operation": "filter", "field": "amount", "op": "gt", "value": 15})),
        Task::new("summary", TaskType::Transform)
            .depends_on("large")
            .config(json!({"operation": "format", "template": "{{name}}"})),
    ]);
    let id = start(&controller, request(plan)).await;

    let state = wait_for(&controller, &id, ExecutionStatus::Completed).await;
    assert_eq!(state.progress, 100);
    assert_eq!(state.tasks_completed, 3);
    assert_eq!(state.phases_completed.len(), 6);
    assert!(state.non_critical_errors.is_empty());
    assert_eq!(crm.calls(), 1);

    let checkpoints = controller.get_checkpoints(&id).await.unwrap();
    assert_eq!(checkpoints.len(), 3);
    assert_eq!(checkpoints.last().unwrap().output, Some(json!("Globex")));

    let log = controller.get_execution_log(&id).unwrap();
    assert!(log.iter().any(|e| e.message == "execution completed"));
}

#[tokio::test(start_paused = true)]
async fn crossing_the_budget_pauses_until_more_budget_is_granted() {
    let controller = controller();
    let mut req = request(ExecutionPlan::new(vec![
        count_task("a", 30.0),
        count_task("b", 30.0).depends_on("a"),
        count_task("c", 10.0).depends_on("b"),
    ]));
    req.overrides.max_budget = Some(50.0);
    let id = start(&controller, req).await;

    let state = wait_for(&controller, &id, ExecutionStatus::Paused).await;
    assert_eq!(state.tasks_completed, 2);
    assert!(matches!(
        state.pause_reason,
        Some(PauseReason::BudgetExceeded { max_budget, .. }) if max_budget == 50.0
    ));

    let err = controller
        .resume_execution(&id, ResumeDecision::new(EscalationDecision::Retry))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::BudgetExceeded { .. }));

    controller
        .resume_execution(
            &id,
            ResumeDecision::new(EscalationDecision::Retry).with_budget(50.0),
        )
        .await
        .unwrap();

    let state = wait_for(&controller, &id, ExecutionStatus::Completed).await;
    assert_eq!(state.tasks_completed, 3);
    assert!((state.current_cost - 70.0).abs() < f64::EPSILON);
    assert_eq!(state.config.max_budget, 100.0);
}

#[tokio::test(start_paused = true)]
async fn escalation_pauses_and_retry_decision_resumes() {
    let controller = controller();
    let sheets = ScriptedClient::new(vec![
        Err(RawError::Payload(json!({"status": 403, "message": "forbidden"}))),
        Ok(json!([{"row": 1}])),
    ]);
    controller.integrations().register("sheets", sheets.clone());

    let plan = ExecutionPlan::new(vec![
        Task::new("append", TaskType::Integration).tool("sheets"),
        count_task("after", 0.0).depends_on("append"),
    ]);
    let id = start(&controller, request(plan)).await;

    let state = wait_for(&controller, &id, ExecutionStatus::Paused).await;
    match state.pause_reason.as_ref().unwrap() {
        PauseReason::Escalation {
            task_id,
            user_options,
            ..
        } => {
            assert_eq!(task_id, "append");
            for option in [UserOption::Retry, UserOption::Cancel, UserOption::Reconfigure] {
                assert!(user_options.contains(&option));
            }
        }
        other => panic!("unexpected pause reason: {other:?}"),
    }
    assert_eq!(state.healing_attempts.len(), 1);
    assert!(state.healing_attempts[0].escalated);

    controller
        .resume_execution(&id, ResumeDecision::new(EscalationDecision::Retry))
        .await
        .unwrap();

    let state = wait_for(&controller, &id, ExecutionStatus::Completed).await;
    assert_eq!(state.tasks_completed, 2);
    assert_eq!(sheets.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_heal_without_pausing() {
    let controller = controller();
    let mail = ScriptedClient::new(vec![
        Err(RawError::Timeout("upstream timed out".to_string())),
        Ok(json!({"sent": true})),
    ]);
    controller.integrations().register("mail", mail.clone());

    let plan = ExecutionPlan::new(vec![Task::new("send", TaskType::Integration).tool("mail")]);
    let id = start(&controller, request(plan)).await;

    let state = wait_for(&controller, &id, ExecutionStatus::Completed).await;
    assert!(state.pause_reason.is_none());
    assert_eq!(state.healing_attempts.len(), 1);
    assert!(state.healing_attempts[0].success);
    assert_eq!(state.non_critical_errors.len(), 1);
    assert_eq!(mail.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn automated_skip_decision_skips_dependents() {
    let controller = controller();
    controller
        .healing()
        .set_escalation_handler(Arc::new(FixedDecision(EscalationDecision::Skip)));
    controller.integrations().register(
        "crm",
        ScriptedClient::new(vec![Err(RawError::Payload(json!({"status": 404})))]),
    );

    let plan = ExecutionPlan::new(vec![
        Task::new("lookup", TaskType::Integration).tool("crm"),
        count_task("report", 0.0).depends_on("lookup"),
    ]);
    let id = start(&controller, request(plan)).await;

    let state = wait_for(&controller, &id, ExecutionStatus::Completed).await;
    assert_eq!(state.tasks_skipped, 2);
    assert_eq!(state.tasks_completed, 0);
    assert_eq!(state.healing_attempts[0].decision, Some(EscalationDecision::Skip));
}

#[tokio::test]
async fn cancel_keeps_partial_results_and_rejects_a_second_cancel() {
    let controller = controller();
    let started = Arc::new(Notify::new());
    controller.integrations().register(
        "slow",
        Arc::new(SlowClient {
            started: started.clone(),
        }),
    );

    let plan = ExecutionPlan::new(vec![
        count_task("prepare", 1.0),
        Task::new("upload", TaskType::Integration)
            .tool("slow")
            .depends_on("prepare"),
    ]);
    let id = start(&controller, request(plan)).await;
    started.notified().await;

    let err = controller
        .resume_execution(&id, ResumeDecision::new(EscalationDecision::Retry))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot resume execution in running state"));

    let response = controller
        .cancel_execution(&id, "user requested", "user-1", true)
        .await;
    assert!(response.success);
    let partial = response.partial_results.unwrap();
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].task_id, "prepare");
    assert_eq!(partial[0].status, TaskStatus::Completed);

    let state = controller.get_execution_state(&id).unwrap();
    assert_eq!(state.status, ExecutionStatus::Cancelled);
    assert_eq!(state.cancellation.unwrap().cancelled_by, "user-1");

    let again = controller
        .cancel_execution(&id, "user requested", "user-1", true)
        .await;
    assert!(!again.success);
    assert!(again.error.unwrap().contains("cannot cancel"));
}

#[tokio::test]
async fn broken_dependency_graph_fails_the_execution() {
    let controller = controller();
    let plan = ExecutionPlan::new(vec![count_task("a", 0.0).depends_on("ghost")]);
    let id = start(&controller, request(plan)).await;

    let state = wait_for(&controller, &id, ExecutionStatus::Failed).await;
    assert!(state.error.unwrap().contains("unknown task ghost"));
    assert!(!state.phases_completed.contains(&autonomous_executor::ExecutionPhase::Planning));

    let err = controller
        .resume_execution("no-such-execution", ResumeDecision::new(EscalationDecision::Retry))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::NotFound(_)));
}

#[tokio::test]
async fn cleanup_only_removes_finished_executions() {
    let controller = controller();
    let started = Arc::new(Notify::new());
    controller.integrations().register(
        "slow",
        Arc::new(SlowClient {
            started: started.clone(),
        }),
    );

    let done = start(&controller, request(ExecutionPlan::new(vec![count_task("a", 0.0)]))).await;
    wait_for(&controller, &done, ExecutionStatus::Completed).await;

    let active = start(
        &controller,
        request(ExecutionPlan::new(vec![
            Task::new("upload", TaskType::Integration).tool("slow"),
        ])),
    )
    .await;
    started.notified().await;

    assert_eq!(controller.cleanup_old_executions(Duration::ZERO), 1);
    assert!(controller.get_execution_state(&done).is_none());
    assert_eq!(
        controller.get_execution_state(&active).unwrap().status,
        ExecutionStatus::Running
    );

    controller.cancel_execution(&active, "test over", "test", false).await;
}

#[tokio::test]
async fn observers_hear_about_completion() {
    let controller = controller();
    let (tx, mut rx) = mpsc::unbounded_channel();
    controller.register_observer(Arc::new(CompletionObserver(tx)));

    let id = start(&controller, request(ExecutionPlan::new(vec![count_task("a", 0.0)]))).await;
    wait_for(&controller, &id, ExecutionStatus::Completed).await;

    let status = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(status, Some(ExecutionStatus::Completed));
}

#[tokio::test]
async fn checkpoints_land_in_the_file_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileExecutionStore::new(dir.path().join("executions.ndjson"))?);
    let controller = controller_with(store.clone());

    let id = start(
        &controller,
        request(ExecutionPlan::new(vec![
            count_task("a", 2.0),
            count_task("b", 3.0).depends_on("a"),
        ])),
    )
    .await;
    wait_for(&controller, &id, ExecutionStatus::Completed).await;

    let checkpoints = controller.get_checkpoints(&id).await?;
    let ids: Vec<_> = checkpoints.iter().map(|c| c.task_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!((checkpoints[1].cumulative_cost - 5.0).abs() < f64::EPSILON);

    // the terminal status write happens right after the transition
    tokio::time::sleep(Duration::from_millis(100)).await;
    let history = store.status_history(&id).await?;
    assert_eq!(history.last().map(|r| r.status), Some(ExecutionStatus::Completed));
    Ok(())
}
