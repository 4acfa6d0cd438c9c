// src/isolation/process.rs
//! Process-per-execution backend
//!
//! The minimum isolation level: every exec is a fresh OS process in its own
//! process group, with a cleared environment. When a cgroup root is
//! configured the sandbox also gets a cgroup v2 group carrying its memory
//! and CPU budget; without one the budget is recorded but not enforced.

use crate::isolation::{ExecOutput, ExecRequest, IsolationBackend, Provisioned, SandboxHandle};
use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::runtime::resource_limiter::CgroupLimiter;
use crate::utils::errors::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

pub struct ProcessBackend {
    processes: Arc<ProcessManager>,
    cgroups: Option<CgroupLimiter>,

    /// Sandboxes with a cgroup that has to be removed on teardown
    grouped: DashMap<String, ()>,
}

impl ProcessBackend {
    pub fn new(processes: Arc<ProcessManager>) -> Self {
        Self {
            processes,
            cgroups: None,
            grouped: DashMap::new(),
        }
    }

    /// Enforce budgets through cgroup v2 groups created under the limiter's root
    pub fn with_cgroups(mut self, limiter: CgroupLimiter) -> Self {
        self.cgroups = Some(limiter);
        self
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn provision(&self, handle: &SandboxHandle) -> Result<Provisioned> {
        if let Some(limiter) = &self.cgroups {
            if limiter.create(&handle.id, &handle.resources) {
                self.grouped.insert(handle.id.clone(), ());
            }
        }
        debug!(
            "Process sandbox {} provisioned ({}MB, {} cpu)",
            handle.id, handle.resources.memory_mb, handle.resources.cpu_share
        );
        Ok(Provisioned::default())
    }

    async fn exec(&self, handle: &SandboxHandle, request: ExecRequest) -> Result<ExecOutput> {
        let config = SpawnConfig {
            program: request.program,
            args: request.args,
            work_dir: Some(request.working_dir),
            env_vars: request.env,
            stdin: request.stdin,
            timeout: request.deadline,
            result_frame: request.result_frame,
        };

        let limiter = self
            .cgroups
            .as_ref()
            .filter(|_| self.grouped.contains_key(&handle.id));

        let output = self
            .processes
            .run(config, |pid| {
                if let Some(limiter) = limiter {
                    limiter.attach(&handle.id, pid);
                }
            })
            .await?;

        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            lines: output.lines,
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            truncated: output.truncated,
            frame_truncated: output.frame_truncated,
        })
    }

    async fn teardown(&self, handle: &SandboxHandle) -> Result<()> {
        if self.grouped.remove(&handle.id).is_some() {
            if let Some(limiter) = &self.cgroups {
                limiter.remove(&handle.id)?;
            }
        }
        debug!("Process sandbox {} torn down", handle.id);
        Ok(())
    }
}
