// src/isolation/manager.rs
//! Sandbox lifecycle tracking
//!
//! Sandboxes live in a sharded map and no lock is held across a backend
//! call, so acquisitions and releases of different sandboxes proceed in
//! parallel. A sandbox is dropped from the map once it reaches a terminal
//! status; releasing a handle the map no longer knows is a no-op.

use crate::isolation::{
    ExecOutput, ExecRequest, IsolationBackend, SandboxHandle, SandboxInfo, SandboxStatus,
};
use crate::observability::{ACQUIRE_FAILURES_TOTAL, SANDBOXES_ACTIVE};
use crate::runtime::resource_limiter::ResourceSpec;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct IsolationManager {
    backend: Arc<dyn IsolationBackend>,
    sandboxes: DashMap<String, SandboxInfo>,
}

impl IsolationManager {
    pub fn new(backend: Arc<dyn IsolationBackend>) -> Self {
        info!("Isolation manager using {} backend", backend.name());
        Self {
            backend,
            sandboxes: DashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Provision a sandbox with at least `spec`'s budget
    pub async fn acquire(&self, spec: ResourceSpec) -> Result<SandboxHandle> {
        if let Err(e) = spec.validate() {
            metrics::counter!(ACQUIRE_FAILURES_TOTAL).increment(1);
            return Err(e);
        }

        let mut handle = SandboxHandle::new(spec);
        self.sandboxes.insert(
            handle.id.clone(),
            SandboxInfo {
                handle: handle.clone(),
                status: SandboxStatus::Starting,
            },
        );
        self.update_gauge();
        debug!("Provisioning sandbox {}", handle.id);

        match self.backend.provision(&handle).await {
            Ok(provisioned) => {
                handle.address = provisioned.address;
                if let Some(mut info) = self.sandboxes.get_mut(&handle.id) {
                    info.handle.address = handle.address.clone();
                }
                self.transition(&handle.id, SandboxStatus::Running);
                debug!("Sandbox {} running", handle.id);
                Ok(handle)
            }
            Err(e) => {
                warn!("Provisioning sandbox {} failed: {}", handle.id, e);
                self.transition(&handle.id, SandboxStatus::Error);
                if let Err(cleanup) = self.backend.teardown(&handle).await {
                    debug!("Cleanup of failed sandbox {}: {}", handle.id, cleanup);
                }
                self.sandboxes.remove(&handle.id);
                self.update_gauge();
                metrics::counter!(ACQUIRE_FAILURES_TOTAL).increment(1);

                Err(match e {
                    EngineError::ProvisioningFailed(_) => e,
                    other => EngineError::ProvisioningFailed(other.to_string()),
                })
            }
        }
    }

    /// Run a command inside a running sandbox
    pub async fn exec(&self, handle: &SandboxHandle, request: ExecRequest) -> Result<ExecOutput> {
        match self.status(&handle.id) {
            Some(SandboxStatus::Running) => self.backend.exec(handle, request).await,
            _ => Err(EngineError::SandboxNotRunning(handle.id.clone())),
        }
    }

    /// Tear a sandbox down.
    ///
    /// Idempotent: unknown, already released and errored handles are a
    /// no-op. Only the first caller of a running sandbox reaches the backend.
    pub async fn release(&self, handle: &SandboxHandle) -> Result<()> {
        let claimed = match self.sandboxes.get_mut(&handle.id) {
            Some(mut info) if info.status == SandboxStatus::Running => {
                info.status = SandboxStatus::Stopping;
                true
            }
            _ => false,
        };

        if !claimed {
            debug!("Sandbox {} already released", handle.id);
            return Ok(());
        }

        let result = self.backend.teardown(handle).await;

        let final_status = match &result {
            Ok(()) => SandboxStatus::Stopped,
            Err(_) => SandboxStatus::Error,
        };
        self.transition(&handle.id, final_status);
        self.sandboxes.remove(&handle.id);
        self.update_gauge();

        match result {
            Ok(()) => {
                debug!("Sandbox {} stopped", handle.id);
                Ok(())
            }
            Err(EngineError::TeardownFailed(msg)) => Err(EngineError::TeardownFailed(msg)),
            Err(other) => Err(EngineError::TeardownFailed(other.to_string())),
        }
    }

    /// Snapshot of one sandbox
    pub fn get(&self, id: &str) -> Option<SandboxInfo> {
        self.sandboxes.get(id).map(|info| info.clone())
    }

    /// Snapshot of every live sandbox
    pub fn list(&self) -> Vec<SandboxInfo> {
        self.sandboxes.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of sandboxes currently in `running`
    pub fn running_count(&self) -> usize {
        self.sandboxes
            .iter()
            .filter(|entry| entry.status == SandboxStatus::Running)
            .count()
    }

    fn status(&self, id: &str) -> Option<SandboxStatus> {
        self.sandboxes.get(id).map(|info| info.status)
    }

    fn transition(&self, id: &str, next: SandboxStatus) {
        if let Some(mut info) = self.sandboxes.get_mut(id) {
            if info.status.can_transition_to(next) {
                info.status = next;
            } else {
                warn!(
                    "Ignoring sandbox {} transition {} -> {}",
                    id, info.status, next
                );
            }
        }
    }

    fn update_gauge(&self) {
        metrics::gauge!(SANDBOXES_ACTIVE).set(self.sandboxes.len() as f64);
    }
}
