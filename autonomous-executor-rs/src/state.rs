//! Execution data model: status and phase state machines, the execution
//! snapshot, per-task results and the records kept for postmortems.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use self_healing::{ConnectionErrorType, ErrorClassification, EscalationDecision, HealingStrategy, UserOption};

use crate::config::ExecutionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Allowed edges: running ⇄ paused, running → terminal, paused → cancelled
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Initialization,
    Planning,
    ToolResearch,
    IntegrationSetup,
    Execution,
    Completion,
}

impl ExecutionPhase {
    pub const ALL: [ExecutionPhase; 6] = [
        ExecutionPhase::Initialization,
        ExecutionPhase::Planning,
        ExecutionPhase::ToolResearch,
        ExecutionPhase::IntegrationSetup,
        ExecutionPhase::Execution,
        ExecutionPhase::Completion,
    ];

    /// Share of overall progress the phase accounts for; sums to 100
    pub fn weight(self) -> u8 {
        match self {
            ExecutionPhase::Initialization => 5,
            ExecutionPhase::Planning => 10,
            ExecutionPhase::ToolResearch => 10,
            ExecutionPhase::IntegrationSetup => 10,
            ExecutionPhase::Execution => 60,
            ExecutionPhase::Completion => 5,
        }
    }

    /// Progress reached once every phase before this one is done
    pub fn progress_floor(self) -> u8 {
        Self::ALL
            .iter()
            .take_while(|p| **p != self)
            .map(|p| p.weight())
            .sum()
    }

    pub fn is_optional(self) -> bool {
        matches!(self, ExecutionPhase::ToolResearch | ExecutionPhase::IntegrationSetup)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPhase::Initialization => "initialization",
            ExecutionPhase::Planning => "planning",
            ExecutionPhase::ToolResearch => "tool_research",
            ExecutionPhase::IntegrationSetup => "integration_setup",
            ExecutionPhase::Execution => "execution",
            ExecutionPhase::Completion => "completion",
        }
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    /// Healing escalated; waiting on a decision
    Escalated,
    /// Not run because a dependency did not succeed, or skipped by decision
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub cost: f64,
    pub error: Option<String>,
    pub error_type: Option<ConnectionErrorType>,
    /// Completed only after the healing engine recovered it
    pub healed: bool,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn skipped<S: Into<String>>(task_id: &str, reason: S) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Skipped,
            output: None,
            cost: 0.0,
            error: Some(reason.into()),
            error_type: None,
            healed: false,
            attempts: 0,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// A failure that did not stop the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonCriticalError {
    pub phase: ExecutionPhase,
    pub task_id: Option<String>,
    pub tool_id: Option<String>,
    pub error_type: Option<ConnectionErrorType>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Summary of one healing session run for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingRecord {
    pub task_id: String,
    pub tool_id: String,
    pub error_type: ConnectionErrorType,
    pub success: bool,
    pub resolved_by: Option<HealingStrategy>,
    pub escalated: bool,
    pub attempts: u32,
    pub decision: Option<EscalationDecision>,
    pub timestamp: DateTime<Utc>,
}

/// Why a run is waiting on a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    #[serde(rename_all = "camelCase")]
    Escalation {
        task_id: String,
        tool_id: Option<String>,
        reason: String,
        user_options: Vec<UserOption>,
        error: ErrorClassification,
    },
    #[serde(rename_all = "camelCase")]
    BudgetExceeded { current_cost: f64, max_budget: f64 },
}

impl PauseReason {
    pub fn describe(&self) -> String {
        match self {
            PauseReason::Escalation { task_id, reason, .. } => {
                format!("task {task_id} needs attention: {reason}")
            }
            PauseReason::BudgetExceeded {
                current_cost,
                max_budget,
            } => format!("cost {current_cost:.2} exceeded budget {max_budget:.2}"),
        }
    }

    pub fn user_options(&self) -> Vec<UserOption> {
        match self {
            PauseReason::Escalation { user_options, .. } => user_options.clone(),
            PauseReason::BudgetExceeded { .. } => {
                vec![UserOption::Retry, UserOption::Cancel, UserOption::Reconfigure]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationInfo {
    pub reason: String,
    pub cancelled_by: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub project_id: String,
    pub status: ExecutionStatus,
    pub phase: ExecutionPhase,
    pub phases_completed: Vec<ExecutionPhase>,
    /// 0 to 100, never decreases
    pub progress: u8,
    pub current_cost: f64,
    pub estimated_total_cost: f64,
    pub config: ExecutionConfig,
    pub non_critical_errors: Vec<NonCriticalError>,
    pub healing_attempts: Vec<HealingRecord>,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_skipped: usize,
    pub pause_reason: Option<PauseReason>,
    pub error: Option<String>,
    pub cancellation: Option<CancellationInfo>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub(crate) fn new(
        execution_id: String,
        workflow_id: String,
        user_id: String,
        project_id: String,
        config: ExecutionConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            workflow_id,
            user_id,
            project_id,
            status: ExecutionStatus::Running,
            phase: ExecutionPhase::Initialization,
            phases_completed: Vec::new(),
            progress: 0,
            current_cost: 0.0,
            estimated_total_cost: 0.0,
            config,
            non_critical_errors: Vec::new(),
            healing_attempts: Vec::new(),
            tasks_total: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            tasks_skipped: 0,
            pause_reason: None,
            error: None,
            cancellation: None,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Raises progress; lower values are ignored
    pub(crate) fn advance_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    pub(crate) fn complete_phase(&mut self, phase: ExecutionPhase) {
        if !self.phases_completed.contains(&phase) {
            self.phases_completed.push(phase);
        }
        self.advance_progress(phase.progress_floor() + phase.weight());
    }
}
