// src/lib.rs
//! Voltrun function execution engine
//!
//! Runs short-lived user functions written in Node.js or Python inside
//! isolated sandboxes and turns every invocation into exactly one terminal
//! outcome.
//!
//! # Architecture
//!
//! - **engine**: request lifecycle and the bounded worker pool
//! - **isolation**: sandbox lifecycle and the pluggable backend trait
//! - **runner**: per-runtime harnesses and result framing
//! - **runtime**: function specs, outcomes, process and resource control
//! - **store**: persistence collaborators and the SQLite store
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors

pub mod engine;
pub mod isolation;
pub mod observability;
pub mod runner;
pub mod runtime;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use engine::{ExecutionEngine, ExecutionPool, Submission};
pub use isolation::{IsolationBackend, IsolationManager, ProcessBackend, SandboxHandle};
pub use runner::{Runner, RunnerRegistry};
pub use runtime::{ExecutionOutcome, ExecutionRequest, ExecutionStatus, FunctionSpec};
pub use store::{ExecutionSink, FunctionStore, SqliteStore};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
