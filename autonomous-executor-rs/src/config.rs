//! Execution configuration and per-execution overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Controller-wide defaults; each execution gets a copy with its overrides
/// applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Cumulative cost above which the run pauses for approval
    pub max_budget: f64,
    pub enable_tool_research: bool,
    pub enable_integration_setup: bool,
    /// Healing attempts per failed integration call
    pub max_retries: u32,
    pub max_concurrent_tasks: usize,
    /// Bound on a single integration call, transform or agent run
    pub task_timeout: Duration,
    /// Bound on a single observer notification
    pub observer_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_budget: 100.0,
            enable_tool_research: true,
            enable_integration_setup: true,
            max_retries: 3,
            max_concurrent_tasks: 4,
            task_timeout: Duration::from_secs(300),
            observer_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-execution overrides supplied with a start request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOverrides {
    pub max_budget: Option<f64>,
    pub enable_tool_research: Option<bool>,
    pub enable_integration_setup: Option<bool>,
    pub max_retries: Option<u32>,
    pub max_concurrent_tasks: Option<usize>,
    pub task_timeout_ms: Option<u64>,
}

impl ExecutionOverrides {
    /// Problems that make the overrides unusable
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(budget) = self.max_budget {
            if !budget.is_finite() || budget <= 0.0 {
                errors.push("maxBudget must be a positive number".to_string());
            }
        }
        if self.max_concurrent_tasks == Some(0) {
            errors.push("maxConcurrentTasks must be at least 1".to_string());
        }
        if self.task_timeout_ms == Some(0) {
            errors.push("taskTimeoutMs must be greater than 0".to_string());
        }
        errors
    }
}

impl ExecutionConfig {
    pub fn with_overrides(&self, overrides: &ExecutionOverrides) -> Self {
        let mut config = self.clone();
        if let Some(v) = overrides.max_budget {
            config.max_budget = v;
        }
        if let Some(v) = overrides.enable_tool_research {
            config.enable_tool_research = v;
        }
        if let Some(v) = overrides.enable_integration_setup {
            config.enable_integration_setup = v;
        }
        if let Some(v) = overrides.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = overrides.max_concurrent_tasks {
            config.max_concurrent_tasks = v;
        }
        if let Some(ms) = overrides.task_timeout_ms {
            config.task_timeout = Duration::from_millis(ms);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let overrides: ExecutionOverrides =
            serde_json::from_str(r#"{"maxBudget": 50, "enableToolResearch": false, "taskTimeoutMs": 1500}"#)
                .unwrap();
        let config = ExecutionConfig::default().with_overrides(&overrides);

        assert_eq!(config.max_budget, 50.0);
        assert!(!config.enable_tool_research);
        assert!(config.enable_integration_setup);
        assert_eq!(config.task_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_concurrent_tasks, 4);
    }

    #[test]
    fn rejects_non_positive_budget() {
        let overrides = ExecutionOverrides {
            max_budget: Some(0.0),
            max_concurrent_tasks: Some(0),
            ..Default::default()
        };
        assert_eq!(overrides.validate().len(), 2);
    }
}
