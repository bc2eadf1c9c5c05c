//! # Autonomous Executor
//!
//! Runs externally planned, dependency-ordered task plans against
//! third-party integrations without supervision.
//!
//! ## Features
//!
//! - Phase state machine from initialization to completion with monotonic progress
//! - Concurrent, dependency-ordered task scheduling with best-effort checkpoints
//! - Integration failures handed to the `self_healing` engine; escalations pause the run
//! - Budget enforcement, pause/resume with explicit decisions and cooperative cancellation
//! - Observer callbacks, an append-only execution log and status subscriptions
//! - Layered settings from files and `AUTOPILOT__*` environment variables
//!

pub mod agent;
pub mod config;
pub mod controller;
pub mod error;
pub mod integration;
pub mod log;
pub mod observer;
pub mod plan;
mod scheduler;
pub mod settings;
pub mod state;
pub mod store;
pub mod transform;

// Re-export commonly used types
pub use agent::{AgentOutput, AgentRunner};
pub use config::{ExecutionConfig, ExecutionOverrides};
pub use controller::{
    AutonomousExecutionController, CancelResponse, ResumeDecision, StartRequest, StartResponse,
};
pub use error::{ExecutionError, Result};
pub use integration::{HttpIntegrationClient, IntegrationClient, IntegrationRegistry, IntegrationRequest};
pub use log::{ExecutionLog, LogEntry, LogLevel};
pub use observer::ExecutionObserver;
pub use plan::{DependencyGraph, ExecutionPlan, Task, TaskType};
pub use settings::EngineSettings;
pub use state::{
    CancellationInfo, ExecutionPhase, ExecutionState, ExecutionStatus, HealingRecord,
    NonCriticalError, PauseReason, TaskResult, TaskStatus,
};
pub use store::{
    Checkpoint, ExecutionStore, FileExecutionStore, InMemoryExecutionStore, PersistenceError,
    StatusRecord,
};
pub use transform::{apply_transform, TransformError};
