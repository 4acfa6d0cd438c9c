// src/isolation/testing.rs
//! In-memory backend for tests
//!
//! Counts every backend call and lets a test script what `exec` returns, so
//! engine and runner behavior can be checked without real interpreters.

use crate::isolation::{ExecOutput, ExecRequest, IsolationBackend, Provisioned, SandboxHandle};
use crate::runtime::process_manager::{OutputLine, OutputStream};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type ExecFn = Arc<dyn Fn(&ExecRequest) -> Result<ExecOutput> + Send + Sync>;

pub struct MockBackend {
    pub provisions: AtomicUsize,
    pub execs: AtomicUsize,
    pub teardowns: AtomicUsize,
    fail_provision: bool,
    fail_teardown: bool,
    exec_delay: Duration,
    exec: ExecFn,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            provisions: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
            fail_provision: false,
            fail_teardown: false,
            exec_delay: Duration::ZERO,
            exec: Arc::new(|_| Ok(ExecOutput::default())),
        }
    }

    pub fn failing_provision(mut self) -> Self {
        self.fail_provision = true;
        self
    }

    pub fn failing_teardown(mut self) -> Self {
        self.fail_teardown = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    pub fn with_exec<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExecRequest) -> Result<ExecOutput> + Send + Sync + 'static,
    {
        self.exec = Arc::new(f);
        self
    }
}

/// Build an [`ExecOutput`] whose stdout is `stdout` and stderr `stderr`
pub fn exec_output(stdout: &str, stderr: &str, exit_code: i32) -> ExecOutput {
    let mut lines: Vec<OutputLine> = stdout
        .lines()
        .map(|text| OutputLine {
            stream: OutputStream::Stdout,
            text: text.to_string(),
        })
        .collect();
    lines.extend(stderr.lines().map(|text| OutputLine {
        stream: OutputStream::Stderr,
        text: text.to_string(),
    }));

    ExecOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        lines,
        exit_code,
        ..Default::default()
    }
}

/// The nonce a runner passed on stdin
pub fn stdin_nonce(request: &ExecRequest) -> String {
    request
        .stdin
        .as_ref()
        .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl IsolationBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn provision(&self, _handle: &SandboxHandle) -> Result<Provisioned> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if self.fail_provision {
            return Err(EngineError::ProvisioningFailed("mock provision failure".into()));
        }
        Ok(Provisioned::default())
    }

    async fn exec(&self, _handle: &SandboxHandle, request: ExecRequest) -> Result<ExecOutput> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if !self.exec_delay.is_zero() {
            let delay = self.exec_delay.min(request.deadline);
            tokio::time::sleep(delay).await;
            if delay < self.exec_delay {
                return Ok(ExecOutput {
                    exit_code: crate::runtime::outcome::TIMEOUT_EXIT_CODE,
                    timed_out: true,
                    ..Default::default()
                });
            }
        }
        (self.exec)(&request)
    }

    async fn teardown(&self, _handle: &SandboxHandle) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(EngineError::TeardownFailed("mock teardown failure".into()));
        }
        Ok(())
    }
}
