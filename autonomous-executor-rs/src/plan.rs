//! Execution plans and their dependency graph.
//!
//! Plans come from an external planner and are only interpreted as far as
//! task ids, types, dependencies and a free-form `config` object go.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use self_healing::ExpectedShape;

use crate::error::{ExecutionError, Result};

/// What a task does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Calls an external integration; failures are healed
    Integration,
    /// Pure data reshaping over dependency outputs
    Transform,
    /// Delegated to an agent runner
    #[serde(alias = "planning")]
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config: Value,
    /// Resolved during tool research when not supplied by the planner
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub expected_shape: Option<ExpectedShape>,
}

impl Task {
    pub fn new<S: Into<String>>(id: S, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            name: None,
            task_type,
            dependencies: Vec::new(),
            config: Value::Null,
            tool_id: None,
            estimated_cost: 0.0,
            expected_shape: None,
        }
    }

    pub fn depends_on<S: Into<String>>(mut self, dependency: S) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn tool<S: Into<String>>(mut self, tool_id: S) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    pub fn cost(mut self, estimated_cost: f64) -> Self {
        self.estimated_cost = estimated_cost;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Tool id from the task itself or its config (`tool`, `integration`, `app`)
    pub fn resolve_tool_id(&self) -> Option<String> {
        if let Some(tool_id) = self.tool_id.as_deref().filter(|t| !t.is_empty()) {
            return Some(tool_id.to_string());
        }
        ["toolId", "tool", "integration", "app"]
            .iter()
            .find_map(|key| self.config.get(*key).and_then(Value::as_str))
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub tasks: Vec<Task>,
}

impl ExecutionPlan {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn estimated_total_cost(&self) -> f64 {
        self.tasks.iter().map(|t| t.estimated_cost).sum()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Validated task dependency graph. Edges point from a dependency to the
/// tasks that need it.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Builds the graph, rejecting duplicate ids, unknown dependencies and
    /// cycles.
    pub fn build(plan: &ExecutionPlan) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();

        for task in &plan.tasks {
            if task.id.trim().is_empty() {
                return Err(ExecutionError::PlanDependency("task with empty id".to_string()));
            }
            if node_map.contains_key(&task.id) {
                return Err(ExecutionError::PlanDependency(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
            let node = graph.add_node(task.id.clone());
            node_map.insert(task.id.clone(), node);
        }

        for task in &plan.tasks {
            let to = node_map[&task.id];
            for dependency in &task.dependencies {
                let from = node_map.get(dependency).ok_or_else(|| {
                    ExecutionError::PlanDependency(format!(
                        "task {} depends on unknown task {}",
                        task.id, dependency
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        if is_cyclic_directed(&graph) {
            let involved = toposort(&graph, None)
                .err()
                .map(|cycle| graph[cycle.node_id()].clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(ExecutionError::PlanDependency(format!(
                "circular dependency involving task {involved}"
            )));
        }

        Ok(Self { graph, node_map })
    }

    /// Task ids with every dependency before its dependents
    pub fn topological_order(&self) -> Vec<String> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n].clone()).collect())
            .unwrap_or_default()
    }

    pub fn dependencies_of(&self, task_id: &str) -> Vec<String> {
        self.neighbors(task_id, Direction::Incoming)
    }

    pub fn dependents_of(&self, task_id: &str) -> Vec<String> {
        self.neighbors(task_id, Direction::Outgoing)
    }

    /// Every task reachable from `task_id` through dependents
    pub fn transitive_dependents(&self, task_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = self.dependents_of(task_id);
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents_of(&next));
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn neighbors(&self, task_id: &str, direction: Direction) -> Vec<String> {
        match self.node_map.get(task_id) {
            Some(node) => self
                .graph
                .neighbors_directed(*node, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }
}
