//! Autonomous execution controller.
//!
//! Each execution runs on its own spawned task and walks the phase state
//! machine. The run only suspends on a pause (escalation or budget) and then
//! waits on a decision channel or the cancellation token. Cancellation is
//! cooperative: the status flips immediately, in-flight results are
//! discarded when they land.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use self_healing::{classify_error, EscalationDecision, HealingEngine};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::AgentRunner;
use crate::config::{ExecutionConfig, ExecutionOverrides};
use crate::error::{ExecutionError, Result};
use crate::integration::IntegrationRegistry;
use crate::log::{ExecutionLog, LogEntry, LogLevel};
use crate::observer::{ExecutionObserver, ObserverEvent, ObserverRegistry};
use crate::plan::{DependencyGraph, ExecutionPlan, TaskType};
use crate::scheduler::{RunProgress, RunReporter, SchedulerOutcome, TaskScheduler};
use crate::state::{
    CancellationInfo, ExecutionPhase, ExecutionState, ExecutionStatus, HealingRecord,
    NonCriticalError, PauseReason, TaskResult, TaskStatus,
};
use crate::store::{Checkpoint, ExecutionStore, StatusRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub workflow_id: String,
    pub user_id: String,
    pub project_id: String,
    pub plan: ExecutionPlan,
    #[serde(default)]
    pub overrides: ExecutionOverrides,
}

impl StartRequest {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.workflow_id.trim().is_empty() {
            errors.push("workflowId is required".to_string());
        }
        if self.user_id.trim().is_empty() {
            errors.push("userId is required".to_string());
        }
        if self.project_id.trim().is_empty() {
            errors.push("projectId is required".to_string());
        }
        errors.extend(self.overrides.validate());
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub success: bool,
    pub execution_id: Option<String>,
    pub state: Option<ExecutionState>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub success: bool,
    pub error: Option<String>,
    /// Present when partial results were requested and the cancel succeeded
    pub partial_results: Option<Vec<TaskResult>>,
}

impl CancelResponse {
    fn rejected(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            partial_results: None,
        }
    }
}

/// Answer to a paused execution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeDecision {
    pub decision: EscalationDecision,
    /// Added to the execution's budget before resuming
    #[serde(default)]
    pub additional_budget: Option<f64>,
}

impl ResumeDecision {
    pub fn new(decision: EscalationDecision) -> Self {
        Self {
            decision,
            additional_budget: None,
        }
    }

    pub fn with_budget(mut self, additional: f64) -> Self {
        self.additional_budget = Some(additional);
        self
    }
}

/// Shared state of one execution; the run loop and the controller API both
/// go through it.
struct ExecutionHandle {
    state: Mutex<ExecutionState>,
    log: Mutex<ExecutionLog>,
    results: Mutex<Vec<TaskResult>>,
    cancel: CancellationToken,
    decisions: mpsc::UnboundedSender<ResumeDecision>,
    status_tx: watch::Sender<ExecutionStatus>,
    observers: Arc<ObserverRegistry>,
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionHandle {
    fn snapshot(&self) -> ExecutionState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update<F: FnOnce(&mut ExecutionState)>(&self, f: F) -> ExecutionState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        state.touch();
        state.clone()
    }

    /// Moves to `next` if the status machine allows it; returns the status
    /// that blocked the move otherwise.
    fn transition<F: FnOnce(&mut ExecutionState)>(
        &self,
        next: ExecutionStatus,
        f: F,
    ) -> std::result::Result<ExecutionState, ExecutionStatus> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.status.can_transition_to(next) {
            return Err(state.status);
        }
        state.status = next;
        f(&mut state);
        state.touch();
        if next.is_terminal() {
            state.completed_at = Some(Utc::now());
        }
        self.status_tx.send_replace(next);
        Ok(state.clone())
    }

    fn append_log(&self, entry: LogEntry) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(entry);
    }

    fn info<S: Into<String>>(&self, phase: ExecutionPhase, message: S) {
        self.append_log(LogEntry::new(LogLevel::Info, phase, message));
    }

    fn notify(&self, state: &ExecutionState, event: ObserverEvent) {
        self.observers
            .notify(state, event, state.config.observer_timeout);
    }

    async fn persist_status(&self, message: Option<String>) {
        let state = self.snapshot();
        let record = StatusRecord {
            execution_id: state.execution_id.clone(),
            workflow_id: state.workflow_id.clone(),
            status: state.status,
            phase: state.phase,
            progress: state.progress,
            current_cost: state.current_cost,
            message,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.store.save_status(&record).await {
            warn!(execution_id = %state.execution_id, error = %err, "Failed to persist execution status");
        }
    }

    /// Bookkeeping shared by every terminal transition
    async fn finish(&self, state: ExecutionState, message: Option<String>) {
        counter!("execution.completed", 1, "status" => state.status.as_str());
        info!(
            execution_id = %state.execution_id,
            status = %state.status,
            progress = state.progress,
            current_cost = state.current_cost,
            "Execution finished"
        );
        self.notify(&state, ObserverEvent::Completion);
        self.observers.unregister(&state.execution_id);
        self.persist_status(message).await;
    }
}

impl RunReporter for ExecutionHandle {
    fn task_settled(&self, result: &TaskResult, cumulative_cost: f64) {
        let state = self.update(|state| {
            match result.status {
                TaskStatus::Completed => state.tasks_completed += 1,
                TaskStatus::Failed => state.tasks_failed += 1,
                TaskStatus::Skipped => state.tasks_skipped += 1,
                TaskStatus::Escalated => {}
            }
            state.current_cost = cumulative_cost;
            let settled = state.tasks_completed + state.tasks_failed + state.tasks_skipped;
            let total = state.tasks_total.max(1);
            let share = ExecutionPhase::Execution.weight() as usize * settled.min(total) / total;
            state.advance_progress(ExecutionPhase::Execution.progress_floor() + share as u8);
        });

        if result.status != TaskStatus::Escalated {
            self.results
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(result.clone());
        }

        let level = match result.status {
            TaskStatus::Completed | TaskStatus::Skipped => LogLevel::Info,
            TaskStatus::Escalated => LogLevel::Warn,
            TaskStatus::Failed => LogLevel::Error,
        };
        let mut entry = LogEntry::new(
            level,
            ExecutionPhase::Execution,
            format!("task {:?}", result.status).to_lowercase(),
        )
        .task(result.task_id.clone())
        .data(json!({
            "cost": result.cost,
            "cumulativeCost": cumulative_cost,
            "healed": result.healed,
            "attempts": result.attempts,
        }));
        if let Some(error) = &result.error {
            entry.message = format!("{}: {}", entry.message, error);
        }
        self.append_log(entry);
        self.notify(&state, ObserverEvent::Progress);
    }

    fn healing_recorded(&self, record: HealingRecord) {
        self.update(|state| state.healing_attempts.push(record));
    }

    fn non_critical(&self, error: NonCriticalError) {
        self.append_log(
            LogEntry::new(LogLevel::Warn, error.phase, error.message.clone())
                .data(json!({ "toolId": error.tool_id, "errorType": error.error_type })),
        );
        self.update(|state| state.non_critical_errors.push(error));
    }

    fn log(&self, entry: LogEntry) {
        self.append_log(entry);
    }
}

/// What the spawned run loop needs from the controller
#[derive(Clone)]
struct Runner {
    scheduler: TaskScheduler,
    healing: Arc<HealingEngine>,
    integrations: Arc<IntegrationRegistry>,
}

pub struct AutonomousExecutionController {
    config: ExecutionConfig,
    healing: Arc<HealingEngine>,
    integrations: Arc<IntegrationRegistry>,
    store: Arc<dyn ExecutionStore>,
    agent: Option<Arc<dyn AgentRunner>>,
    observers: Arc<ObserverRegistry>,
    executions: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
}

impl std::fmt::Debug for AutonomousExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomousExecutionController")
            .field("config", &self.config)
            .field("integrations", &self.integrations)
            .field("executions", &self.executions_snapshot().len())
            .finish()
    }
}

impl AutonomousExecutionController {
    pub fn new(
        config: ExecutionConfig,
        healing: Arc<HealingEngine>,
        integrations: Arc<IntegrationRegistry>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            config,
            healing,
            integrations,
            store,
            agent: None,
            observers: Arc::new(ObserverRegistry::default()),
            executions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_agent_runner(mut self, runner: Arc<dyn AgentRunner>) -> Self {
        self.agent = Some(runner);
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn healing(&self) -> &Arc<HealingEngine> {
        &self.healing
    }

    pub fn integrations(&self) -> &Arc<IntegrationRegistry> {
        &self.integrations
    }

    /// Observer notified for every execution
    pub fn register_observer(&self, observer: Arc<dyn ExecutionObserver>) {
        self.observers.register_global(observer);
    }

    /// Observer scoped to one execution, dropped once it reaches a terminal status
    pub fn register_execution_observer(
        &self,
        execution_id: &str,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Result<()> {
        let handle = self.handle(execution_id)?;
        if handle.snapshot().status.is_terminal() {
            return Err(ExecutionError::InvalidState(format!(
                "execution {execution_id} already finished"
            )));
        }
        self.observers.register_for(execution_id, observer);
        Ok(())
    }

    fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>> {
        self.executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
            .ok_or_else(|| ExecutionError::NotFound(execution_id.to_string()))
    }

    fn executions_snapshot(&self) -> Vec<Arc<ExecutionHandle>> {
        self.executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Validates the request and spawns the run. Nothing is allocated when
    /// validation fails.
    #[instrument(skip_all, fields(workflow_id = %request.workflow_id))]
    pub async fn start_autonomous_execution(&self, request: StartRequest) -> StartResponse {
        let validation_errors = request.validate();
        if !validation_errors.is_empty() {
            warn!(errors = ?validation_errors, "Rejected execution start");
            return StartResponse {
                success: false,
                execution_id: None,
                state: None,
                validation_errors,
            };
        }

        let execution_id = Uuid::new_v4().to_string();
        let config = self.config.with_overrides(&request.overrides);
        let mut state = ExecutionState::new(
            execution_id.clone(),
            request.workflow_id,
            request.user_id,
            request.project_id,
            config,
        );
        state.tasks_total = request.plan.tasks.len();
        state.estimated_total_cost = request.plan.estimated_total_cost();

        let (decisions, decision_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ExecutionStatus::Running);
        let handle = Arc::new(ExecutionHandle {
            state: Mutex::new(state.clone()),
            log: Mutex::new(ExecutionLog::default()),
            results: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            decisions,
            status_tx,
            observers: self.observers.clone(),
            store: self.store.clone(),
        });
        handle.info(ExecutionPhase::Initialization, "execution started");

        self.executions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution_id.clone(), handle.clone());

        info!(
            execution_id = %execution_id,
            tasks = state.tasks_total,
            max_budget = state.config.max_budget,
            "Starting autonomous execution"
        );

        let runner = Runner {
            scheduler: TaskScheduler::new(
                self.healing.clone(),
                self.integrations.clone(),
                self.agent.clone(),
                self.store.clone(),
            ),
            healing: self.healing.clone(),
            integrations: self.integrations.clone(),
        };
        tokio::spawn(runner.drive(handle, request.plan, decision_rx));

        StartResponse {
            success: true,
            execution_id: Some(execution_id),
            state: Some(state),
            validation_errors: Vec::new(),
        }
    }

    /// Stops an active execution. The status flips to cancelled right away;
    /// in-flight work is abandoned at its next boundary.
    #[instrument(skip(self, reason))]
    pub async fn cancel_execution(
        &self,
        execution_id: &str,
        reason: &str,
        cancelled_by: &str,
        save_partial_results: bool,
    ) -> CancelResponse {
        let handle = match self.handle(execution_id) {
            Ok(handle) => handle,
            Err(err) => return CancelResponse::rejected(err.to_string()),
        };

        let info = CancellationInfo {
            reason: reason.to_string(),
            cancelled_by: cancelled_by.to_string(),
            timestamp: Utc::now(),
        };
        let state = match handle.transition(ExecutionStatus::Cancelled, |state| {
            state.pause_reason = None;
            state.cancellation = Some(info);
        }) {
            Ok(state) => state,
            Err(status) => {
                return CancelResponse::rejected(format!("cannot cancel execution in {status} state"))
            }
        };
        handle.cancel.cancel();
        handle.append_log(
            LogEntry::new(LogLevel::Warn, state.phase, format!("execution cancelled: {reason}"))
                .data(json!({ "cancelledBy": cancelled_by })),
        );

        let partial_results = save_partial_results.then(|| {
            handle
                .results
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|r| r.is_success())
                .cloned()
                .collect::<Vec<_>>()
        });
        handle.finish(state, Some(reason.to_string())).await;

        CancelResponse {
            success: true,
            error: None,
            partial_results,
        }
    }

    /// Continues a paused execution with an explicit decision
    #[instrument(skip(self))]
    pub async fn resume_execution(
        &self,
        execution_id: &str,
        decision: ResumeDecision,
    ) -> Result<ExecutionState> {
        let handle = self.handle(execution_id)?;
        let current = handle.snapshot();
        if current.status != ExecutionStatus::Paused {
            return Err(ExecutionError::InvalidState(format!(
                "cannot resume execution in {} state",
                current.status
            )));
        }

        if decision.decision == EscalationDecision::Cancel {
            let response = self
                .cancel_execution(execution_id, "cancelled by decision", "user", false)
                .await;
            return match response.error {
                None => Ok(handle.snapshot()),
                Some(error) => Err(ExecutionError::InvalidState(error)),
            };
        }

        let max_budget = current.config.max_budget + decision.additional_budget.unwrap_or(0.0).max(0.0);
        if current.current_cost > max_budget {
            return Err(ExecutionError::BudgetExceeded {
                current_cost: current.current_cost,
                max_budget,
            });
        }

        let state = handle
            .transition(ExecutionStatus::Running, |state| {
                state.config.max_budget = max_budget;
                state.pause_reason = None;
            })
            .map_err(|status| {
                ExecutionError::InvalidState(format!("cannot resume execution in {status} state"))
            })?;

        handle.append_log(
            LogEntry::new(LogLevel::Info, state.phase, "execution resumed").data(json!({
                "decision": decision.decision,
                "maxBudget": max_budget,
            })),
        );
        if handle.decisions.send(decision).is_err() {
            return Err(ExecutionError::InvalidState(format!(
                "execution {execution_id} is no longer running"
            )));
        }
        handle.persist_status(Some("resumed".to_string())).await;
        Ok(state)
    }

    /// Removes terminal executions that finished more than `max_age` ago.
    /// Active executions are never removed.
    pub fn cleanup_old_executions(&self, max_age: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let mut executions = self.executions.write().unwrap_or_else(PoisonError::into_inner);
        let before = executions.len();
        executions.retain(|_, handle| {
            let state = handle.snapshot();
            let expired = match (state.completed_at, cutoff) {
                (Some(completed_at), Some(cutoff)) => completed_at <= cutoff,
                _ => false,
            };
            !(state.status.is_terminal() && expired)
        });
        let removed = before - executions.len();
        if removed > 0 {
            debug!(removed, "Cleaned up finished executions");
        }
        removed
    }

    pub fn get_execution_state(&self, execution_id: &str) -> Option<ExecutionState> {
        self.handle(execution_id).ok().map(|h| h.snapshot())
    }

    pub fn get_execution_log(&self, execution_id: &str) -> Option<Vec<LogEntry>> {
        self.handle(execution_id).ok().map(|h| {
            h.log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries()
                .to_vec()
        })
    }

    /// Executions oldest first
    pub fn list_executions(&self) -> Vec<ExecutionState> {
        let mut states: Vec<_> = self
            .executions_snapshot()
            .iter()
            .map(|h| h.snapshot())
            .collect();
        states.sort_by_key(|s| s.started_at);
        states
    }

    pub async fn get_checkpoints(&self, execution_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.store.checkpoints(execution_id).await?)
    }

    /// Receiver that observes every status change of the execution
    pub fn subscribe_status(&self, execution_id: &str) -> Option<watch::Receiver<ExecutionStatus>> {
        self.handle(execution_id).ok().map(|h| h.status_tx.subscribe())
    }
}

impl Runner {
    async fn drive(
        self,
        handle: Arc<ExecutionHandle>,
        mut plan: ExecutionPlan,
        mut decisions: mpsc::UnboundedReceiver<ResumeDecision>,
    ) {
        let execution_id = handle.snapshot().execution_id;

        let state = handle.update(|s| s.complete_phase(ExecutionPhase::Initialization));
        handle.notify(&state, ObserverEvent::Progress);

        // planning
        self.enter_phase(&handle, ExecutionPhase::Planning);
        let graph = match DependencyGraph::build(&plan) {
            Ok(graph) => graph,
            Err(err) => return self.fail(&handle, err).await,
        };
        handle.info(
            ExecutionPhase::Planning,
            format!("plan validated with {} tasks", graph.len()),
        );
        self.complete_phase(&handle, ExecutionPhase::Planning);

        let config = handle.snapshot().config;
        if self.stopped(&handle) {
            return;
        }
        self.tool_research(&handle, &mut plan, config.enable_tool_research);
        if self.stopped(&handle) {
            return;
        }
        self.integration_setup(&handle, &plan, &config).await;
        if self.stopped(&handle) {
            return;
        }

        self.enter_phase(&handle, ExecutionPhase::Execution);
        let mut progress = RunProgress::default();
        let reporter: Arc<dyn RunReporter> = handle.clone();
        loop {
            let config = handle.snapshot().config;
            let outcome = self
                .scheduler
                .run(
                    &execution_id,
                    &plan,
                    &graph,
                    &config,
                    &mut progress,
                    reporter.clone(),
                    &handle.cancel,
                )
                .await;

            let reason = match outcome {
                SchedulerOutcome::Completed => break,
                SchedulerOutcome::Cancelled => {
                    debug!(execution_id = %execution_id, "Run loop observed cancellation");
                    return;
                }
                SchedulerOutcome::CancelledByDecision { task_id } => {
                    let info = CancellationInfo {
                        reason: format!("escalation decision for task {task_id}"),
                        cancelled_by: "escalation_handler".to_string(),
                        timestamp: Utc::now(),
                    };
                    if let Ok(state) = handle.transition(ExecutionStatus::Cancelled, |s| {
                        s.cancellation = Some(info);
                    }) {
                        handle.cancel.cancel();
                        handle.info(ExecutionPhase::Execution, "execution cancelled by escalation decision");
                        handle.finish(state, Some("cancelled by decision".to_string())).await;
                    }
                    return;
                }
                SchedulerOutcome::Failed(err) => return self.fail(&handle, err).await,
                SchedulerOutcome::Paused(reason) => reason,
            };

            let message = reason.describe();
            let state = match handle.transition(ExecutionStatus::Paused, |s| {
                s.pause_reason = Some(reason.clone());
            }) {
                Ok(state) => state,
                Err(_) => return,
            };
            warn!(execution_id = %execution_id, reason = %message, "Execution paused");
            handle.append_log(
                LogEntry::new(LogLevel::Warn, ExecutionPhase::Execution, format!("execution paused: {message}"))
                    .data(json!({ "userOptions": reason.user_options() })),
            );
            handle.notify(&state, ObserverEvent::CriticalError(message.clone()));
            handle.persist_status(Some(message)).await;

            let decision = tokio::select! {
                _ = handle.cancel.cancelled() => return,
                decision = decisions.recv() => match decision {
                    Some(decision) => decision,
                    None => return,
                },
            };
            self.apply_decision(&handle, &reason, decision, &mut progress);
        }

        self.complete_phase(&handle, ExecutionPhase::Execution);
        self.enter_phase(&handle, ExecutionPhase::Completion);
        let result = handle.transition(ExecutionStatus::Completed, |s| {
            s.complete_phase(ExecutionPhase::Completion);
        });
        if let Ok(state) = result {
            handle.info(ExecutionPhase::Completion, "execution completed");
            handle.finish(state, None).await;
        }
    }

    fn stopped(&self, handle: &ExecutionHandle) -> bool {
        handle.cancel.is_cancelled() || handle.snapshot().status.is_terminal()
    }

    fn enter_phase(&self, handle: &ExecutionHandle, phase: ExecutionPhase) {
        handle.update(|s| s.phase = phase);
        handle.info(phase, format!("entering phase {phase}"));
        debug!(phase = %phase, "Entering phase");
    }

    fn complete_phase(&self, handle: &ExecutionHandle, phase: ExecutionPhase) {
        let state = handle.update(|s| s.complete_phase(phase));
        handle.notify(&state, ObserverEvent::Progress);
    }

    /// A disabled optional phase is not recorded as completed but still
    /// counts toward progress.
    fn skip_phase(&self, handle: &ExecutionHandle, phase: ExecutionPhase) {
        handle.info(phase, format!("phase {phase} disabled"));
        let state = handle.update(|s| s.advance_progress(phase.progress_floor() + phase.weight()));
        handle.notify(&state, ObserverEvent::Progress);
    }

    fn tool_research(&self, handle: &ExecutionHandle, plan: &mut ExecutionPlan, enabled: bool) {
        let phase = ExecutionPhase::ToolResearch;
        if !enabled {
            return self.skip_phase(handle, phase);
        }
        self.enter_phase(handle, phase);
        for task in plan
            .tasks
            .iter_mut()
            .filter(|t| t.task_type == TaskType::Integration)
        {
            match task.resolve_tool_id() {
                Some(tool_id) => task.tool_id = Some(tool_id),
                None => handle.non_critical(NonCriticalError {
                    phase,
                    task_id: Some(task.id.clone()),
                    tool_id: None,
                    error_type: None,
                    message: format!("no integration resolved for task {}", task.id),
                    timestamp: Utc::now(),
                }),
            }
        }
        self.complete_phase(handle, phase);
    }

    async fn integration_setup(
        &self,
        handle: &ExecutionHandle,
        plan: &ExecutionPlan,
        config: &ExecutionConfig,
    ) {
        let phase = ExecutionPhase::IntegrationSetup;
        if !config.enable_integration_setup {
            return self.skip_phase(handle, phase);
        }
        self.enter_phase(handle, phase);

        let mut tool_ids: Vec<String> = plan
            .tasks
            .iter()
            .filter(|t| t.task_type == TaskType::Integration)
            .filter_map(|t| t.resolve_tool_id())
            .collect();
        tool_ids.sort();
        tool_ids.dedup();

        for tool_id in tool_ids {
            let problem = match self.integrations.get(&tool_id) {
                None => Some((None, format!("no client registered for integration {tool_id}"))),
                Some(_) if self.healing.circuit_breakers().is_open(&tool_id) => {
                    Some((None, ExecutionError::CircuitOpen(tool_id.to_string()).to_string()))
                }
                Some(client) => {
                    match tokio::time::timeout(config.task_timeout, client.health_check()).await {
                        Ok(Ok(())) => None,
                        Ok(Err(err)) => {
                            let classification = classify_error(&err, None, None);
                            Some((
                                Some(classification.error_type),
                                format!("health check failed for {tool_id}: {}", classification.technical_details),
                            ))
                        }
                        Err(_) => Some((None, format!("health check timed out for {tool_id}"))),
                    }
                }
            };
            if let Some((error_type, message)) = problem {
                handle.non_critical(NonCriticalError {
                    phase,
                    task_id: None,
                    tool_id: Some(tool_id),
                    error_type,
                    message,
                    timestamp: Utc::now(),
                });
            }
        }
        self.complete_phase(handle, phase);
    }

    fn apply_decision(
        &self,
        handle: &ExecutionHandle,
        reason: &PauseReason,
        decision: ResumeDecision,
        progress: &mut RunProgress,
    ) {
        let PauseReason::Escalation { task_id, tool_id, .. } = reason else {
            return;
        };
        match decision.decision {
            EscalationDecision::Skip => {
                let skipped = TaskResult::skipped(task_id, "skipped by decision");
                progress.record(skipped.clone());
                handle.task_settled(&skipped, progress.cumulative_cost);
            }
            EscalationDecision::Reconnect => {
                if let Some(tool_id) = tool_id {
                    self.healing.circuit_breakers().reset(tool_id);
                }
            }
            // the escalated task was never settled and runs again
            EscalationDecision::Retry | EscalationDecision::Reconfigure | EscalationDecision::Cancel => {}
        }
    }

    async fn fail(&self, handle: &ExecutionHandle, err: ExecutionError) {
        let message = err.to_string();
        error!(error = %message, "Execution failed");
        let result = handle.transition(ExecutionStatus::Failed, |s| {
            s.error = Some(message.clone());
        });
        if let Ok(state) = result {
            handle.append_log(LogEntry::new(LogLevel::Error, state.phase, message.clone()));
            handle.notify(&state, ObserverEvent::CriticalError(message.clone()));
            handle.finish(state, Some(message)).await;
        }
    }
}
