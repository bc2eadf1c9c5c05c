//! Execution-level error taxonomy.
//!
//! Integration failures never show up here directly: they are classified
//! and healed by `self_healing`, and only reach the controller as a
//! paused execution.

use thiserror::Error;

use crate::store::PersistenceError;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Start request rejected before any state was allocated
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Missing dependency, duplicate task id or cycle in the plan
    #[error("plan dependency error: {0}")]
    PlanDependency(String),

    #[error("budget exceeded: cost {current_cost:.2} over budget {max_budget:.2}")]
    BudgetExceeded { current_cost: f64, max_budget: f64 },

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("execution not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the execution's current status
    #[error("{0}")]
    InvalidState(String),

    #[error("store error: {0}")]
    Store(#[from] PersistenceError),

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// A task failed in a way healing does not apply to
    #[error("task {task_id} failed: {message}")]
    Task { task_id: String, message: String },
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
