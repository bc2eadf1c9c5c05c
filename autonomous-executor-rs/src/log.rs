//! Append-only execution log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::ExecutionPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub phase: ExecutionPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogEntry {
    pub fn new<S: Into<String>>(level: LogLevel, phase: ExecutionPhase, message: S) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            phase,
            message: message.into(),
            task_id: None,
            data: None,
        }
    }

    pub fn task<S: Into<String>>(mut self, task_id: S) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Entries are only ever appended; readers get copies.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
}

impl ExecutionLog {
    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entries_keep_insertion_order() {
        let mut log = ExecutionLog::default();
        log.append(LogEntry::new(LogLevel::Info, ExecutionPhase::Planning, "plan built"));
        log.append(
            LogEntry::new(LogLevel::Warn, ExecutionPhase::Execution, "healed")
                .task("fetch")
                .data(json!({"attempts": 2})),
        );

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].task_id.as_deref(), Some("fetch"));

        let encoded = serde_json::to_value(&log.entries()[0]).unwrap();
        assert_eq!(encoded["level"], "info");
        assert!(encoded.get("taskId").is_none());
    }
}
