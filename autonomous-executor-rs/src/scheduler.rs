//! Dependency-ordered task execution.
//!
//! Ready tasks run concurrently up to `max_concurrent_tasks`. Results are
//! folded in completion order: the cumulative cost, the checkpoint and the
//! budget check all happen as each task settles. An escalation, a budget
//! overrun or a fatal task error stops new spawns; in-flight tasks are
//! drained before the run returns so their work is not lost.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use self_healing::{
    detect_error, AttemptContext, ConnectionErrorType, ConnectionInfo, ErrorClassification,
    EscalationDecision, HealingEngine, HealingRequest, RawError, RetryableOperation, UserOption,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentRunner;
use crate::config::ExecutionConfig;
use crate::error::ExecutionError;
use crate::integration::{IntegrationClient, IntegrationRegistry, IntegrationRequest};
use crate::log::{LogEntry, LogLevel};
use crate::plan::{DependencyGraph, ExecutionPlan, Task, TaskType};
use crate::state::{ExecutionPhase, HealingRecord, NonCriticalError, PauseReason, TaskResult, TaskStatus};
use crate::store::{Checkpoint, ExecutionStore};
use crate::transform::apply_transform;

/// Sink for everything a run produces besides its final outcome
pub(crate) trait RunReporter: Send + Sync {
    fn task_settled(&self, result: &TaskResult, cumulative_cost: f64);
    fn healing_recorded(&self, record: HealingRecord);
    fn non_critical(&self, error: NonCriticalError);
    fn log(&self, entry: LogEntry);
}

/// Settled tasks and spend; survives pause/resume cycles
#[derive(Debug, Clone, Default)]
pub(crate) struct RunProgress {
    pub results: HashMap<String, TaskResult>,
    pub completion_order: Vec<String>,
    pub cumulative_cost: f64,
}

impl RunProgress {
    pub(crate) fn settled_results(&self) -> Vec<TaskResult> {
        self.completion_order
            .iter()
            .filter_map(|id| self.results.get(id).cloned())
            .collect()
    }

    pub(crate) fn record(&mut self, result: TaskResult) {
        self.cumulative_cost += result.cost;
        if !self.results.contains_key(&result.task_id) {
            self.completion_order.push(result.task_id.clone());
        }
        self.results.insert(result.task_id.clone(), result);
    }
}

#[derive(Debug)]
pub(crate) enum SchedulerOutcome {
    Completed,
    Paused(PauseReason),
    /// The cancellation token fired
    Cancelled,
    /// An escalation decision asked for the run to stop
    CancelledByDecision { task_id: String },
    Failed(ExecutionError),
}

enum TaskOutcome {
    Settled(TaskResult),
    Escalated {
        result: TaskResult,
        reason: PauseReason,
        decision: Option<EscalationDecision>,
    },
    Fatal {
        result: TaskResult,
        error: ExecutionError,
    },
    /// Healing observed cancellation; nothing to record
    Discarded,
}

#[derive(Clone)]
pub(crate) struct TaskScheduler {
    healing: Arc<HealingEngine>,
    integrations: Arc<IntegrationRegistry>,
    agent: Option<Arc<dyn AgentRunner>>,
    store: Arc<dyn ExecutionStore>,
}

/// Everything a spawned task needs, owned
#[derive(Clone)]
struct TaskContext {
    execution_id: String,
    config: ExecutionConfig,
    healing: Arc<HealingEngine>,
    integrations: Arc<IntegrationRegistry>,
    agent: Option<Arc<dyn AgentRunner>>,
    reporter: Arc<dyn RunReporter>,
    cancel: CancellationToken,
}

impl TaskScheduler {
    pub(crate) fn new(
        healing: Arc<HealingEngine>,
        integrations: Arc<IntegrationRegistry>,
        agent: Option<Arc<dyn AgentRunner>>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            healing,
            integrations,
            agent,
            store,
        }
    }

    #[instrument(skip_all, fields(execution_id = %execution_id))]
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run(
        &self,
        execution_id: &str,
        plan: &ExecutionPlan,
        graph: &DependencyGraph,
        config: &ExecutionConfig,
        progress: &mut RunProgress,
        reporter: Arc<dyn RunReporter>,
        cancel: &CancellationToken,
    ) -> SchedulerOutcome {
        let order = graph.topological_order();
        let ctx = TaskContext {
            execution_id: execution_id.to_string(),
            config: config.clone(),
            healing: self.healing.clone(),
            integrations: self.integrations.clone(),
            agent: self.agent.clone(),
            reporter: reporter.clone(),
            cancel: cancel.clone(),
        };
        let max_concurrent = config.max_concurrent_tasks.max(1);

        let mut in_flight = FuturesUnordered::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut halt: Option<SchedulerOutcome> = None;

        loop {
            if cancel.is_cancelled() {
                return SchedulerOutcome::Cancelled;
            }

            if halt.is_none() {
                for task_id in &order {
                    if progress.results.contains_key(task_id) || running.contains(task_id) {
                        continue;
                    }
                    let Some(task) = plan.task(task_id) else { continue };

                    if let Some(failed) = task.dependencies.iter().find(|dep| {
                        progress.results.get(*dep).map_or(false, |r| !r.is_success())
                    }) {
                        let skipped = TaskResult::skipped(
                            &task.id,
                            format!("dependency {failed} did not complete"),
                        );
                        debug!(task_id = %task.id, dependency = %failed, "Skipping task");
                        progress.record(skipped.clone());
                        reporter.task_settled(&skipped, progress.cumulative_cost);
                        self.checkpoint(execution_id, &skipped, progress.cumulative_cost).await;
                        continue;
                    }

                    let ready = task
                        .dependencies
                        .iter()
                        .all(|dep| progress.results.get(dep).map_or(false, TaskResult::is_success));
                    if !ready || running.len() >= max_concurrent {
                        continue;
                    }

                    let input = dependency_input(task, &progress.results);
                    let handle = tokio::spawn(execute_task(ctx.clone(), task.clone(), input));
                    let id = task.id.clone();
                    running.insert(id.clone());
                    in_flight.push(async move { (id, handle.await) });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let (task_id, joined) = tokio::select! {
                _ = cancel.cancelled() => return SchedulerOutcome::Cancelled,
                Some(next) = in_flight.next() => next,
            };
            running.remove(&task_id);

            if cancel.is_cancelled() {
                return SchedulerOutcome::Cancelled;
            }

            let outcome = joined.unwrap_or_else(|err| TaskOutcome::Fatal {
                result: failed_result(&task_id, format!("task panicked: {err}")),
                error: ExecutionError::Task {
                    task_id: task_id.clone(),
                    message: format!("task panicked: {err}"),
                },
            });

            match outcome {
                TaskOutcome::Settled(result) => {
                    progress.record(result.clone());
                    reporter.task_settled(&result, progress.cumulative_cost);
                    self.checkpoint(execution_id, &result, progress.cumulative_cost).await;

                    if progress.cumulative_cost > config.max_budget && halt.is_none() {
                        warn!(
                            current_cost = progress.cumulative_cost,
                            max_budget = config.max_budget,
                            "Budget exceeded, pausing"
                        );
                        halt = Some(SchedulerOutcome::Paused(PauseReason::BudgetExceeded {
                            current_cost: progress.cumulative_cost,
                            max_budget: config.max_budget,
                        }));
                    }
                }
                TaskOutcome::Escalated {
                    result,
                    reason,
                    decision,
                } => {
                    reporter.task_settled(&result, progress.cumulative_cost);
                    match decision {
                        Some(EscalationDecision::Cancel) => {
                            if !matches!(halt, Some(SchedulerOutcome::Failed(_))) {
                                halt = Some(SchedulerOutcome::CancelledByDecision { task_id });
                            }
                        }
                        _ => {
                            if halt.is_none() {
                                halt = Some(SchedulerOutcome::Paused(reason));
                            }
                        }
                    }
                }
                TaskOutcome::Fatal { result, error } => {
                    progress.record(result.clone());
                    reporter.task_settled(&result, progress.cumulative_cost);
                    self.checkpoint(execution_id, &result, progress.cumulative_cost).await;
                    if !matches!(halt, Some(SchedulerOutcome::Failed(_))) {
                        halt = Some(SchedulerOutcome::Failed(error));
                    }
                }
                TaskOutcome::Discarded => {}
            }
        }

        halt.unwrap_or(SchedulerOutcome::Completed)
    }

    async fn checkpoint(&self, execution_id: &str, result: &TaskResult, cumulative_cost: f64) {
        let checkpoint = Checkpoint {
            execution_id: execution_id.to_string(),
            task_id: result.task_id.clone(),
            output: result.output.clone(),
            cumulative_cost,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.store.save_checkpoint(&checkpoint).await {
            warn!(
                execution_id = %execution_id,
                task_id = %result.task_id,
                error = %err,
                "Failed to write checkpoint"
            );
        }
    }
}

/// Input handed to a task: the single dependency's output, an object keyed
/// by dependency id, or the task's own `config.input`.
fn dependency_input(task: &Task, results: &HashMap<String, TaskResult>) -> Value {
    let output_of = |id: &str| {
        results
            .get(id)
            .and_then(|r| r.output.clone())
            .unwrap_or(Value::Null)
    };
    match task.dependencies.as_slice() {
        [] => task.config.get("input").cloned().unwrap_or(Value::Null),
        [only] => output_of(only),
        many => Value::Object(
            many.iter()
                .map(|id| (id.clone(), output_of(id)))
                .collect::<Map<_, _>>(),
        ),
    }
}

fn completed_result(task: &Task, output: Value, cost: f64) -> TaskResult {
    TaskResult {
        task_id: task.id.clone(),
        status: TaskStatus::Completed,
        output: Some(output),
        cost,
        error: None,
        error_type: None,
        healed: false,
        attempts: 1,
        completed_at: Utc::now(),
    }
}

fn failed_result(task_id: &str, message: String) -> TaskResult {
    TaskResult {
        task_id: task_id.to_string(),
        status: TaskStatus::Failed,
        output: None,
        cost: 0.0,
        error: Some(message),
        error_type: None,
        healed: false,
        attempts: 1,
        completed_at: Utc::now(),
    }
}

fn fatal(task: &Task, message: String) -> TaskOutcome {
    TaskOutcome::Fatal {
        result: failed_result(&task.id, message.clone()),
        error: ExecutionError::Task {
            task_id: task.id.clone(),
            message,
        },
    }
}

async fn execute_task(ctx: TaskContext, task: Task, input: Value) -> TaskOutcome {
    debug!(
        execution_id = %ctx.execution_id,
        task_id = %task.id,
        task_type = ?task.task_type,
        "Running task"
    );
    match task.task_type {
        TaskType::Transform => match apply_transform(&task.config, &input) {
            Ok(output) => TaskOutcome::Settled(completed_result(&task, output, task.estimated_cost)),
            Err(err) => fatal(&task, err.to_string()),
        },
        TaskType::Agent => run_agent(&ctx, &task, &input).await,
        TaskType::Integration => run_integration(&ctx, &task, input).await,
    }
}

async fn run_agent(ctx: &TaskContext, task: &Task, input: &Value) -> TaskOutcome {
    let Some(runner) = ctx.agent.as_ref() else {
        return fatal(task, "no agent runner configured".to_string());
    };
    match tokio::time::timeout(ctx.config.task_timeout, runner.run(task, input)).await {
        Ok(Ok(agent)) => TaskOutcome::Settled(completed_result(
            task,
            agent.output,
            task.estimated_cost + agent.cost.max(0.0),
        )),
        Ok(Err(message)) => fatal(task, message),
        Err(_) => fatal(
            task,
            format!("agent timed out after {}ms", ctx.config.task_timeout.as_millis()),
        ),
    }
}

/// One integration call, replayable by the healing engine
struct IntegrationCall {
    client: Arc<dyn IntegrationClient>,
    request: IntegrationRequest,
    timeout: Duration,
}

impl IntegrationCall {
    async fn invoke(&self) -> Result<Value, RawError> {
        match tokio::time::timeout(self.timeout, self.client.execute(&self.request)).await {
            Ok(result) => result,
            Err(_) => Err(RawError::Timeout(format!(
                "{} did not respond within {}ms",
                self.request.tool_id,
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl RetryableOperation for IntegrationCall {
    async fn call(&self, _context: &AttemptContext) -> Result<Value, RawError> {
        self.invoke().await
    }
}

fn escalate_unconfigured(task: &Task, tool_id: Option<String>, detail: String) -> TaskOutcome {
    let classification = ErrorClassification::new(ConnectionErrorType::InvalidConfig, detail.clone());
    let result = TaskResult {
        task_id: task.id.clone(),
        status: TaskStatus::Escalated,
        output: None,
        cost: 0.0,
        error: Some(detail.clone()),
        error_type: Some(ConnectionErrorType::InvalidConfig),
        healed: false,
        attempts: 0,
        completed_at: Utc::now(),
    };
    TaskOutcome::Escalated {
        result,
        reason: PauseReason::Escalation {
            task_id: task.id.clone(),
            tool_id,
            reason: detail,
            user_options: UserOption::for_error(Some(ConnectionErrorType::InvalidConfig)),
            error: classification,
        },
        decision: None,
    }
}

async fn run_integration(ctx: &TaskContext, task: &Task, input: Value) -> TaskOutcome {
    let Some(tool_id) = task.resolve_tool_id() else {
        return escalate_unconfigured(task, None, format!("task {} has no integration configured", task.id));
    };
    let Some(client) = ctx.integrations.get(&tool_id) else {
        return escalate_unconfigured(
            task,
            Some(tool_id.clone()),
            format!("no client registered for integration {tool_id}"),
        );
    };

    let connection: Option<ConnectionInfo> = task
        .config
        .get("connection")
        .and_then(|c| serde_json::from_value(c.clone()).ok());
    let mut params = task.config.get("params").cloned().unwrap_or_else(|| json!({}));
    if !input.is_null() {
        if let Value::Object(map) = &mut params {
            map.entry("input").or_insert(input);
        }
    }
    let call = Arc::new(IntegrationCall {
        client,
        request: IntegrationRequest {
            execution_id: ctx.execution_id.clone(),
            task_id: task.id.clone(),
            tool_id: tool_id.clone(),
            operation: task
                .config
                .get("operation")
                .and_then(Value::as_str)
                .unwrap_or("execute")
                .to_string(),
            params,
            connection: connection.clone(),
        },
        timeout: ctx.config.task_timeout,
    });

    let breakers = ctx.healing.circuit_breakers();
    let error = if breakers.is_open(&tool_id) {
        RawError::Message(ExecutionError::CircuitOpen(tool_id.to_string()).to_string())
    } else {
        match call.invoke().await {
            Ok(output) => match detect_error(&output, task.expected_shape) {
                None => {
                    breakers.record_success(&tool_id);
                    return TaskOutcome::Settled(completed_result(task, output, task.estimated_cost));
                }
                Some(classification) => RawError::Classified(classification),
            },
            Err(err) => err,
        }
    };

    if ctx.cancel.is_cancelled() {
        return TaskOutcome::Discarded;
    }

    let mut request = HealingRequest::new(tool_id.clone(), error, call.clone())
        .tool_name(task.display_name())
        .operation_id(format!("{}:{}", ctx.execution_id, task.id))
        .max_attempts(ctx.config.max_retries.max(1))
        .cancellation(ctx.cancel.child_token());
    if let Some(shape) = task.expected_shape {
        request = request.expected_shape(shape);
    }
    if let Some(connection) = connection {
        request = request.connection(connection);
    }

    let healing = ctx.healing.attempt_healing(request).await;
    if healing.cancelled {
        return TaskOutcome::Discarded;
    }

    let error_type = healing.original_error.error_type;
    ctx.reporter.healing_recorded(HealingRecord {
        task_id: task.id.clone(),
        tool_id: tool_id.clone(),
        error_type,
        success: healing.success,
        resolved_by: healing.resolved_by,
        escalated: healing.escalated,
        attempts: healing.total_attempts,
        decision: healing.decision,
        timestamp: Utc::now(),
    });

    if healing.success {
        let strategy = healing.resolved_by.map(|s| s.as_str()).unwrap_or("retry");
        info!(
            execution_id = %ctx.execution_id,
            task_id = %task.id,
            tool_id = %tool_id,
            error_type = %error_type,
            strategy,
            attempts = healing.total_attempts,
            "Task healed"
        );
        ctx.reporter.non_critical(NonCriticalError {
            phase: ExecutionPhase::Execution,
            task_id: Some(task.id.clone()),
            tool_id: Some(tool_id.clone()),
            error_type: Some(error_type),
            message: format!(
                "{} recovered by {} after {} attempts",
                healing.original_error, strategy, healing.total_attempts
            ),
            timestamp: Utc::now(),
        });
        return TaskOutcome::Settled(TaskResult {
            task_id: task.id.clone(),
            status: TaskStatus::Completed,
            output: Some(healing.output.unwrap_or(Value::Null)),
            cost: task.estimated_cost,
            error: None,
            error_type: Some(error_type),
            healed: true,
            attempts: healing.total_attempts + 1,
            completed_at: Utc::now(),
        });
    }

    let reason = healing
        .escalation_reason
        .clone()
        .unwrap_or_else(|| healing.effective_error().technical_details.clone());
    ctx.reporter.log(
        LogEntry::new(LogLevel::Error, ExecutionPhase::Execution, format!("healing escalated: {reason}"))
            .task(task.id.clone())
            .data(json!({
                "toolId": tool_id,
                "errorType": error_type.as_str(),
                "attempts": healing.total_attempts,
                "decision": healing.decision,
            })),
    );

    if healing.decision == Some(EscalationDecision::Skip) {
        return TaskOutcome::Settled(TaskResult {
            error_type: Some(error_type),
            attempts: healing.total_attempts + 1,
            ..TaskResult::skipped(&task.id, format!("skipped by escalation decision: {reason}"))
        });
    }

    let user_options = if healing.user_options.is_empty() {
        UserOption::for_error(Some(error_type))
    } else {
        healing.user_options.clone()
    };
    TaskOutcome::Escalated {
        result: TaskResult {
            task_id: task.id.clone(),
            status: TaskStatus::Escalated,
            output: None,
            cost: 0.0,
            error: Some(reason.clone()),
            error_type: Some(error_type),
            healed: false,
            attempts: healing.total_attempts + 1,
            completed_at: Utc::now(),
        },
        reason: PauseReason::Escalation {
            task_id: task.id.clone(),
            tool_id: Some(tool_id),
            reason,
            user_options,
            error: healing.effective_error().clone(),
        },
        decision: healing.decision,
    }
}
