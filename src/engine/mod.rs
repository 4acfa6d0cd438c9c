// src/engine/mod.rs
//! Execution engine
//!
//! Drives one request through `pending → running → terminal`:
//!
//! ```text
//! resolve function ─► entry point + runner ─► acquire ─► run ─► release
//!        │                    │                  │
//!        └────────────────────┴──────────────────┴──► failed (no runner)
//! ```
//!
//! Every request yields exactly one [`ExecutionOutcome`]. Configuration
//! problems are reported before a sandbox is provisioned; only the runner
//! step can produce `success` or `timeout`.

pub mod pool;

use crate::isolation::IsolationManager;
use crate::observability::{EXECUTIONS_TOTAL, EXECUTION_DURATION_MS};
use crate::runner::{Invocation, Runner, RunnerRegistry, SandboxSession};
use crate::runtime::function::{EntryPoint, ExecutionRequest, FunctionSpec};
use crate::runtime::outcome::{ExecutionOutcome, NO_EXIT_CODE};
use crate::runtime::resource_limiter::ResourceSpec;
use crate::store::{ExecutionSink, FunctionStore, StatusUpdate};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use pool::{ExecutionPool, Submission};

/// Default CPU share: one core per execution
pub const DEFAULT_CPU_SHARE: f64 = 1.0;

pub struct ExecutionEngine {
    functions: Arc<dyn FunctionStore>,
    sink: Arc<dyn ExecutionSink>,
    isolation: Arc<IsolationManager>,
    runners: RunnerRegistry,
    cpu_share: f64,
}

impl ExecutionEngine {
    pub fn new(
        functions: Arc<dyn FunctionStore>,
        sink: Arc<dyn ExecutionSink>,
        isolation: Arc<IsolationManager>,
        runners: RunnerRegistry,
    ) -> Self {
        Self {
            functions,
            sink,
            isolation,
            runners,
            cpu_share: DEFAULT_CPU_SHARE,
        }
    }

    pub fn with_cpu_share(mut self, cpu_share: f64) -> Self {
        self.cpu_share = cpu_share;
        self
    }

    pub fn isolation(&self) -> &Arc<IsolationManager> {
        &self.isolation
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    /// Run `request` to completion under the function's own timeout
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionOutcome {
        self.execute_with_deadline(request, None).await
    }

    /// Like [`execute`](Self::execute), but the runner is stopped at
    /// `cancel_at` if that comes before the function timeout.
    pub async fn execute_with_deadline(
        &self,
        request: ExecutionRequest,
        cancel_at: Option<Instant>,
    ) -> ExecutionOutcome {
        let accepted_at = Instant::now();
        self.accept(&request).await;
        self.run(&request, accepted_at, cancel_at).await
    }

    /// Record `request` as `pending`
    pub(crate) async fn accept(&self, request: &ExecutionRequest) {
        info!(
            "Execution {} accepted: function={} caller={}",
            request.execution_id, request.function_id, request.caller
        );
        self.report(StatusUpdate::pending(request)).await;
    }

    /// Drive an accepted request to its terminal state. The pool workers
    /// call this with the submission time as `accepted_at`.
    pub(crate) async fn run(
        &self,
        request: &ExecutionRequest,
        accepted_at: Instant,
        cancel_at: Option<Instant>,
    ) -> ExecutionOutcome {
        let mut outcome = self.drive(request, cancel_at).await;
        outcome.execution_id = request.execution_id.clone();
        outcome.duration_ms = accepted_at.elapsed().as_millis() as u64;

        self.report(StatusUpdate::terminal(request, &outcome)).await;

        metrics::counter!(EXECUTIONS_TOTAL, "status" => outcome.status.as_str()).increment(1);
        metrics::histogram!(EXECUTION_DURATION_MS).record(outcome.duration_ms as f64);
        info!(
            "Execution {} finished: status={} duration={}ms exit_code={}",
            outcome.execution_id, outcome.status, outcome.duration_ms, outcome.exit_code
        );

        outcome
    }

    async fn drive(
        &self,
        request: &ExecutionRequest,
        cancel_at: Option<Instant>,
    ) -> ExecutionOutcome {
        let (function, entry_point, runner) = match self.prepare(request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Execution {} rejected: {}", request.execution_id, e);
                return ExecutionOutcome::failed(e.to_string(), String::new(), NO_EXIT_CODE);
            }
        };

        let resources = ResourceSpec::for_function(&function, self.cpu_share);
        let deadline = match effective_deadline(resources.timeout(), cancel_at) {
            Some(deadline) => deadline,
            None => {
                return ExecutionOutcome::failed(
                    "execution cancelled before it started",
                    String::new(),
                    NO_EXIT_CODE,
                )
            }
        };

        let handle = match self.isolation.acquire(resources).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Execution {}: {}", request.execution_id, e);
                return ExecutionOutcome::failed(e.to_string(), String::new(), NO_EXIT_CODE);
            }
        };

        let started_at = Utc::now();
        self.report(StatusUpdate::running(request, started_at, function.timeout_secs))
            .await;
        debug!(
            "Execution {} running in sandbox {} (deadline {:?})",
            request.execution_id, handle.id, deadline
        );

        let session = SandboxSession::new(&self.isolation, &handle);
        let invocation = Invocation {
            code: &function.code,
            entry_point: &entry_point,
            input: &request.input,
            deadline,
        };
        let mut outcome = AssertUnwindSafe(runner.run(&session, invocation))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                warn!("Runner panicked in execution {}: {}", request.execution_id, message);
                ExecutionOutcome::failed(
                    format!("runner panicked: {}", message),
                    String::new(),
                    NO_EXIT_CODE,
                )
            });

        if let Err(e) = self.isolation.release(&handle).await {
            warn!(
                "Releasing sandbox {} for execution {}: {}",
                handle.id, request.execution_id, e
            );
        }

        outcome.started_at = Some(started_at);
        outcome
    }

    /// Everything that can be checked before a sandbox exists
    async fn prepare(
        &self,
        request: &ExecutionRequest,
    ) -> Result<(FunctionSpec, EntryPoint, Arc<dyn Runner>)> {
        let function = self
            .functions
            .get_function(&request.function_id)
            .await?
            .ok_or_else(|| EngineError::FunctionNotFound(request.function_id.clone()))?;
        let entry_point = EntryPoint::parse(&function.entry_point)?;
        let runner = self.runners.get(&function.runtime)?;
        Ok((function, entry_point, runner))
    }

    async fn report(&self, update: StatusUpdate) {
        let (execution_id, state) = (update.execution_id.clone(), update.state);
        if let Err(e) = self.sink.record(update).await {
            warn!("Failed to record {} for execution {}: {}", state, execution_id, e);
        }
    }
}

/// The function timeout, cut short by `cancel_at`. `None` once `cancel_at`
/// has passed.
fn effective_deadline(timeout: Duration, cancel_at: Option<Instant>) -> Option<Duration> {
    match cancel_at {
        None => Some(timeout),
        Some(at) => {
            let remaining = at.saturating_duration_since(Instant::now());
            (!remaining.is_zero()).then(|| remaining.min(timeout))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
