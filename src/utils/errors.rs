// src/utils/errors.rs
//! Engine error type
//!
//! Variants are grouped by where in an execution they can occur. A timeout
//! is not an error: it is a terminal outcome status produced by a runner.

use thiserror::Error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors: surfaced before any sandbox is provisioned
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("unsupported runtime: {0}")]
    UnsupportedRuntime(String),

    #[error("invalid entry point '{0}': expected <module>.<function>")]
    InvalidEntryPoint(String),

    // Provisioning errors
    #[error("invalid resource spec: {0}")]
    InvalidResources(String),

    #[error("sandbox provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("sandbox {0} is not running")]
    SandboxNotRunning(String),

    // Execution errors
    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),

    // Teardown errors: logged, never turned into an execution failure
    #[error("sandbox teardown failed: {0}")]
    TeardownFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("execution queue is full")]
    QueueFull,

    #[error("execution pool is shut down")]
    PoolClosed,
}

impl EngineError {
    /// True for errors raised before any sandbox was acquired
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::FunctionNotFound(_) | Self::UnsupportedRuntime(_) | Self::InvalidEntryPoint(_)
        )
    }

    /// True for errors raised while acquiring a sandbox
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::InvalidResources(_) | Self::ProvisioningFailed(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}
