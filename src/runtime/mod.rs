// src/runtime/mod.rs
//! Execution primitives shared by the engine, the runners and the backends
//!
//! - **Function**: stored function definitions and execution requests
//! - **Outcome**: execution states and terminal outcomes
//! - **Process Manager**: process-group spawning with deadline and output capture
//! - **Resource Limiter**: resource specs and best-effort cgroup v2 budgets
//!
//! # Architecture
//!
//! ```text
//! ExecutionRequest ──► FunctionSpec ──► ResourceSpec ──► sandbox
//!                                                          │
//!                      ExecutionOutcome ◄── ProcessOutput ◄┘
//! ```

pub mod function;
pub mod outcome;
pub mod process_manager;
pub mod resource_limiter;

// Re-export commonly used types
pub use function::{EntryPoint, ExecutionRequest, FunctionSpec};
pub use outcome::{ExecutionOutcome, ExecutionState, ExecutionStatus};
pub use process_manager::{
    OutputLine, OutputStream, ProcessManager, ProcessOutput, ResultFrame, SpawnConfig,
};
pub use resource_limiter::{CgroupLimiter, ResourceSpec};
