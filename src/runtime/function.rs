// src/runtime/function.rs
//! Function definitions and execution requests
//!
//! A [`FunctionSpec`] is owned by the persistence layer; the engine works on
//! a cloned snapshot, so edits to the stored function never reach an
//! execution that already started.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_ENTRY_POINT: &str = "index.handler";
pub const DEFAULT_MEMORY_MB: u64 = 128;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A stored user function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub id: String,

    /// Runtime name, matched against the registered runners (`nodejs`, `python`)
    pub runtime: String,

    /// Source code
    pub code: String,

    /// `<module>.<callable>`
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

fn default_memory_mb() -> u64 {
    DEFAULT_MEMORY_MB
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl FunctionSpec {
    /// Function with default entry point and limits
    pub fn new(id: impl Into<String>, runtime: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            runtime: runtime.into(),
            code: code.into(),
            entry_point: default_entry_point(),
            memory_mb: DEFAULT_MEMORY_MB,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }
}

/// Parsed entry point: the module file to load and the callable inside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub module: String,
    pub function: String,
}

impl EntryPoint {
    /// Parse `<module>.<function>`.
    ///
    /// Both parts must be plain identifiers; the module name becomes a file
    /// name inside the scratch workspace, so paths are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let (module, function) = raw
            .rsplit_once('.')
            .ok_or_else(|| EngineError::InvalidEntryPoint(raw.to_string()))?;

        if !is_identifier(module) || !is_identifier(function) {
            return Err(EngineError::InvalidEntryPoint(raw.to_string()));
        }

        Ok(Self {
            module: module.to_string(),
            function: function.to_string(),
        })
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.function)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One invocation of a stored function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Assigned at construction, used as the key for status reports
    pub execution_id: String,

    pub function_id: String,

    /// Identity resolved by the authentication layer
    pub caller: String,

    pub input: serde_json::Value,
}

impl ExecutionRequest {
    pub fn new(
        function_id: impl Into<String>,
        caller: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            execution_id: ulid::Ulid::new().to_string(),
            function_id: function_id.into(),
            caller: caller.into(),
            input,
        }
    }
}
