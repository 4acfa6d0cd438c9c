// src/isolation/mod.rs
//! Isolated execution environments
//!
//! The [`IsolationManager`] owns the lifecycle of every sandbox; an
//! [`IsolationBackend`] decides what a sandbox actually is. The engine and
//! the runners only ever see [`SandboxHandle`]s and the exec contract, so a
//! container or micro-VM backend can replace [`ProcessBackend`] without
//! touching them.
//!
//! ```text
//!            acquire              provision ok
//!   (none) ──────────► starting ───────────────► running
//!                         │                         │ release
//!                         │ provision failed        ▼
//!                         └──────────► error ◄── stopping ──► stopped
//!                                              teardown failed
//! ```

pub mod manager;
pub mod process;

#[cfg(test)]
pub mod testing;

use crate::runtime::process_manager::{OutputLine, ResultFrame};
use crate::runtime::resource_limiter::ResourceSpec;
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use manager::IsolationManager;
pub use process::ProcessBackend;

/// Sandbox lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Starting => "starting",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopping => "stopping",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxStatus::Stopped | SandboxStatus::Error)
    }

    /// Forward-only transitions, plus `error` from any non-terminal state
    pub fn can_transition_to(&self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        match (self, next) {
            (Starting, Running) | (Running, Stopping) | (Stopping, Stopped) => true,
            (current, Error) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to one sandbox.
///
/// The authoritative status lives in the manager; use
/// [`IsolationManager::get`] for a current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub created_at: DateTime<Utc>,

    /// Network address, for backends that expose one
    pub address: Option<String>,

    pub resources: ResourceSpec,
}

impl SandboxHandle {
    fn new(resources: ResourceSpec) -> Self {
        Self {
            id: format!("sb-{}", ulid::Ulid::new().to_string().to_lowercase()),
            created_at: Utc::now(),
            address: None,
            resources,
        }
    }
}

/// Point-in-time view of a sandbox for operational tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub handle: SandboxHandle,
    pub status: SandboxStatus,
}

/// What a backend returns once a sandbox is provisioned
#[derive(Debug, Clone, Default)]
pub struct Provisioned {
    pub address: Option<String>,
}

/// A command to run inside a sandbox
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub deadline: Duration,

    /// Stdout block the backend must capture whole regardless of the
    /// output limit
    pub result_frame: Option<ResultFrame>,
}

/// Result of [`IsolationBackend::exec`]
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,

    /// Combined output in arrival order
    pub lines: Vec<OutputLine>,

    pub exit_code: i32,
    pub timed_out: bool,

    /// Some output was dropped at the capture limit
    pub truncated: bool,

    /// Part of the result frame was dropped; the result is unusable
    pub frame_truncated: bool,
}

/// Capability interface every isolation backend implements.
///
/// Backends must preserve the manager's state machine and honor the exec
/// deadline the same way the process backend does: kill on expiry and
/// report `timed_out` with the output captured so far.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Bring up the environment described by `handle.resources`
    async fn provision(&self, handle: &SandboxHandle) -> Result<Provisioned>;

    /// Run one command inside a provisioned sandbox
    async fn exec(&self, handle: &SandboxHandle, request: ExecRequest) -> Result<ExecOutput>;

    /// Tear the environment down. Called at most once per sandbox.
    async fn teardown(&self, handle: &SandboxHandle) -> Result<()>;
}
