//! Agent/planning tasks are delegated to an external runner.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::Task;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub output: Value,
    /// Cost incurred on top of the task's estimate
    #[serde(default)]
    pub cost: f64,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// `input` is the dependency output(s), shaped like a transform input.
    async fn run(&self, task: &Task, input: &Value) -> Result<AgentOutput, String>;
}
