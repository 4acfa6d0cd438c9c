// src/store/mod.rs
//! Persistence collaborator interfaces
//!
//! The engine reads function definitions through [`FunctionStore`] and
//! reports status transitions through [`ExecutionSink`]. Both are injected;
//! the engine never owns a storage handle. [`SqliteStore`] implements both
//! for the binary and the tests.

pub mod sqlite;

use crate::runtime::function::{ExecutionRequest, FunctionSpec};
use crate::runtime::outcome::{ExecutionOutcome, ExecutionState};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub use sqlite::{ExecutionRecord, SqliteStore};

/// Read access to stored functions
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn get_function(&self, id: &str) -> Result<Option<FunctionSpec>>;
}

/// Receiver of execution status transitions.
///
/// Writes are best-effort from the engine's point of view: an error is
/// logged and the execution carries on.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn record(&self, update: StatusUpdate) -> Result<()>;
}

/// One status transition of one execution
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub execution_id: String,
    pub function_id: String,
    pub caller: String,
    pub state: ExecutionState,
    pub at: DateTime<Utc>,

    /// Request input, on `pending`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Function timeout, on `running`; with `at` it bounds when the
    /// execution must have finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Final result, on terminal states
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ExecutionOutcome>,
}

impl StatusUpdate {
    fn base(request: &ExecutionRequest, state: ExecutionState, at: DateTime<Utc>) -> Self {
        Self {
            execution_id: request.execution_id.clone(),
            function_id: request.function_id.clone(),
            caller: request.caller.clone(),
            state,
            at,
            input: None,
            timeout_secs: None,
            outcome: None,
        }
    }

    pub fn pending(request: &ExecutionRequest) -> Self {
        Self {
            input: Some(request.input.clone()),
            ..Self::base(request, ExecutionState::Pending, Utc::now())
        }
    }

    pub fn running(request: &ExecutionRequest, at: DateTime<Utc>, timeout_secs: u64) -> Self {
        Self {
            timeout_secs: Some(timeout_secs),
            ..Self::base(request, ExecutionState::Running, at)
        }
    }

    pub fn terminal(request: &ExecutionRequest, outcome: &ExecutionOutcome) -> Self {
        Self {
            outcome: Some(outcome.clone()),
            ..Self::base(request, outcome.status.into(), Utc::now())
        }
    }
}
