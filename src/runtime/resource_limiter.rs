// src/runtime/resource_limiter.rs
//! Resource budgets for sandboxes
//!
//! A [`ResourceSpec`] is what a sandbox is provisioned with. Enforcement is
//! up to the backend; the process backend applies it through cgroup v2 when a
//! cgroup root is configured and the host allows it, and otherwise treats the
//! budget as advisory.

use crate::runtime::function::FunctionSpec;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const MIN_MEMORY_MB: u64 = 16;
const MAX_MEMORY_MB: u64 = 16 * 1024;
const MAX_TIMEOUT_SECS: u64 = 15 * 60;

/// CFS period used when writing `cpu.max`
const CPU_PERIOD_US: u64 = 100_000;

/// Requested budget for one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub memory_mb: u64,

    /// Fraction of CPU cores (1.0 = one core)
    pub cpu_share: f64,

    pub timeout_secs: u64,
}

impl ResourceSpec {
    /// Budget for one execution of `function`
    pub fn for_function(function: &FunctionSpec, cpu_share: f64) -> Self {
        Self {
            memory_mb: function.memory_mb,
            cpu_share,
            timeout_secs: function.timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_mb < MIN_MEMORY_MB {
            return Err(EngineError::InvalidResources(format!(
                "memory limit cannot be less than {}MB",
                MIN_MEMORY_MB
            )));
        }
        if self.memory_mb > MAX_MEMORY_MB {
            return Err(EngineError::InvalidResources(format!(
                "memory limit cannot exceed {}MB",
                MAX_MEMORY_MB
            )));
        }
        if !(self.cpu_share > 0.0 && self.cpu_share <= 4.0) {
            return Err(EngineError::InvalidResources(
                "cpu share must be in (0, 4]".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(EngineError::InvalidResources("timeout cannot be 0".to_string()));
        }
        if self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(EngineError::InvalidResources(format!(
                "timeout cannot exceed {}s",
                MAX_TIMEOUT_SECS
            )));
        }
        Ok(())
    }
}

/// Applies budgets to processes through cgroup v2.
///
/// Every failure is logged and ignored: a host without a delegated cgroup
/// tree still runs functions, only without kernel-enforced limits.
#[derive(Debug, Clone)]
pub struct CgroupLimiter {
    root: PathBuf,
}

impl CgroupLimiter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn group_path(&self, sandbox_id: &str) -> PathBuf {
        self.root.join(format!("voltrun-{}", sandbox_id))
    }

    /// Create the group for a sandbox and write its limits
    pub fn create(&self, sandbox_id: &str, spec: &ResourceSpec) -> bool {
        let path = self.group_path(sandbox_id);
        if let Err(e) = std::fs::create_dir_all(&path) {
            warn!("Failed to create cgroup {:?}: {}", path, e);
            return false;
        }

        let memory_bytes = spec.memory_mb * 1024 * 1024;
        let quota = (spec.cpu_share * CPU_PERIOD_US as f64) as u64;

        debug!(
            "Setting cgroup limits for sandbox {}: {}MB, cpu.max {} {}",
            sandbox_id, spec.memory_mb, quota, CPU_PERIOD_US
        );

        write_control(&path, "memory.max", &memory_bytes.to_string());
        write_control(&path, "cpu.max", &format!("{} {}", quota, CPU_PERIOD_US));
        true
    }

    /// Move a process into the sandbox's group
    pub fn attach(&self, sandbox_id: &str, pid: u32) {
        write_control(&self.group_path(sandbox_id), "cgroup.procs", &pid.to_string());
    }

    /// Remove the sandbox's group. Fails only if processes remain inside.
    pub fn remove(&self, sandbox_id: &str) -> Result<()> {
        let path = self.group_path(sandbox_id);
        match std::fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::TeardownFailed(format!(
                "Failed to remove cgroup {:?}: {}",
                path, e
            ))),
        }
    }
}

fn write_control(group: &Path, file: &str, value: &str) {
    if let Err(e) = std::fs::write(group.join(file), value) {
        warn!("Failed to write {} in {:?}: {}", file, group, e);
    }
}
