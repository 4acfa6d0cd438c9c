// src/runner/mod.rs
//! Runtime-specific function runners
//!
//! A [`Runner`] executes one function invocation inside a sandbox it is
//! handed and always returns a terminal outcome: setup failures, crashes and
//! deadline expiry are outcomes, not errors. The engine picks the runner by
//! the function's runtime name through a [`RunnerRegistry`].
//!
//! - **nodejs**: [`NodeRunner`], `node`
//! - **python**: [`PythonRunner`], `python3 -u`

pub mod harness;
pub mod node;
pub mod python;

use crate::isolation::{ExecOutput, ExecRequest, IsolationManager, SandboxHandle};
use crate::runtime::function::EntryPoint;
use crate::runtime::outcome::ExecutionOutcome;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use node::NodeRunner;
pub use python::PythonRunner;

/// One invocation of user code
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub code: &'a str,
    pub entry_point: &'a EntryPoint,
    pub input: &'a Value,
    pub deadline: Duration,
}

/// The sandbox a runner executes in
pub struct SandboxSession<'a> {
    manager: &'a IsolationManager,
    handle: &'a SandboxHandle,
}

impl<'a> SandboxSession<'a> {
    pub fn new(manager: &'a IsolationManager, handle: &'a SandboxHandle) -> Self {
        Self { manager, handle }
    }

    pub fn handle(&self) -> &SandboxHandle {
        self.handle
    }

    pub async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        self.manager.exec(self.handle, request).await
    }
}

#[async_trait]
pub trait Runner: Send + Sync {
    /// Runtime name matched against `FunctionSpec::runtime`
    fn runtime(&self) -> &'static str;

    async fn run(&self, session: &SandboxSession<'_>, invocation: Invocation<'_>)
        -> ExecutionOutcome;
}

/// Runners by runtime name
#[derive(Default, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<&'static str, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node.js and Python runners configured from `config`
    pub fn from_config(config: &EngineConfig) -> Self {
        let scratch = config.runtime.scratch_dir.clone();
        let mut registry = Self::new();
        registry.register(Arc::new(NodeRunner::new(
            config.runners.node_bin.clone(),
            scratch.clone(),
        )));
        registry.register(Arc::new(PythonRunner::new(
            config.runners.python_bin.clone(),
            scratch,
        )));
        registry
    }

    /// Add a runner, replacing any runner for the same runtime
    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        self.runners.insert(runner.runtime(), runner);
    }

    pub fn get(&self, runtime: &str) -> Result<Arc<dyn Runner>> {
        self.runners
            .get(runtime)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedRuntime(runtime.to_string()))
    }

    pub fn runtimes(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.runners.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
