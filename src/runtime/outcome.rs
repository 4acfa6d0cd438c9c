// src/runtime/outcome.rs
//! Execution states and terminal outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Exit code reported when a process was killed at its deadline
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Exit code reported when no process ever ran
pub const NO_EXIT_CODE: i32 = -1;

/// Terminal status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an execution in `pending → running → terminal`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Success => "success",
            ExecutionState::Failed => "failed",
            ExecutionState::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionState::Pending),
            "running" => Some(ExecutionState::Running),
            "success" => Some(ExecutionState::Success),
            "failed" => Some(ExecutionState::Failed),
            "timeout" => Some(ExecutionState::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Success | ExecutionState::Failed | ExecutionState::Timeout
        )
    }

    /// Whether `next` may follow `self`. Terminal states are final.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        match self {
            ExecutionState::Pending => next != ExecutionState::Pending,
            ExecutionState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl From<ExecutionStatus> for ExecutionState {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => ExecutionState::Success,
            ExecutionStatus::Failed => ExecutionState::Failed,
            ExecutionStatus::Timeout => ExecutionState::Timeout,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one execution.
///
/// Built only through [`ExecutionOutcome::success`], [`ExecutionOutcome::failed`]
/// and [`ExecutionOutcome::timeout`]: `output` is set only on success and
/// `error` only otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub exit_code: i32,

    /// When the execution entered `running`; absent if it never did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ExecutionOutcome {
    pub fn success(output: Value, logs: String, exit_code: i32) -> Self {
        Self {
            execution_id: String::new(),
            status: ExecutionStatus::Success,
            output: Some(output),
            logs,
            error: None,
            duration_ms: 0,
            exit_code,
            started_at: None,
        }
    }

    pub fn failed(error: impl Into<String>, logs: String, exit_code: i32) -> Self {
        let error = error.into();
        Self {
            execution_id: String::new(),
            status: ExecutionStatus::Failed,
            output: None,
            logs,
            error: Some(if error.is_empty() {
                "execution failed".to_string()
            } else {
                error
            }),
            duration_ms: 0,
            exit_code,
            started_at: None,
        }
    }

    pub fn timeout(deadline_secs: f64, logs: String) -> Self {
        Self {
            execution_id: String::new(),
            status: ExecutionStatus::Timeout,
            output: None,
            logs,
            error: Some(format!("Execution timed out after {}s", deadline_secs)),
            duration_ms: 0,
            exit_code: TIMEOUT_EXIT_CODE,
            started_at: None,
        }
    }

    /// Zero exit without a result block
    pub fn completed_without_output(logs: String) -> Self {
        Self::success(json!({ "message": "Execution completed" }), logs, 0)
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
