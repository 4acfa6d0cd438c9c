// src/engine/pool.rs
//! Bounded worker pool in front of the engine
//!
//! ```text
//! submit ─► [ bounded queue ] ─► worker 1 ─┐
//!                  │          ─► worker 2 ─┼─► ExecutionEngine
//!                  │          ─► worker N ─┘
//!                  └─ full: submit waits, try_submit fails
//! ```
//!
//! A submission is accepted, and recorded as `pending`, the moment it takes
//! a queue slot; its duration includes the time spent waiting for a worker.

use crate::engine::ExecutionEngine;
use crate::runtime::function::ExecutionRequest;
use crate::runtime::outcome::ExecutionOutcome;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Job {
    request: ExecutionRequest,
    accepted_at: Instant,
    cancel_at: Option<Instant>,
    reply: oneshot::Sender<ExecutionOutcome>,
}

/// Handle to an accepted execution
#[derive(Debug)]
pub struct Submission {
    pub execution_id: String,
    pub outcome: oneshot::Receiver<ExecutionOutcome>,
}

impl Submission {
    /// Wait for the terminal outcome
    pub async fn wait(self) -> Result<ExecutionOutcome> {
        self.outcome.await.map_err(|_| EngineError::PoolClosed)
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queued: usize,
    pub in_flight: usize,
}

pub struct ExecutionPool {
    engine: Arc<ExecutionEngine>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    queue_capacity: usize,
    in_flight: Arc<AtomicUsize>,
}

impl ExecutionPool {
    /// Start `workers` workers over a queue of `queue_capacity` requests.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(engine: Arc<ExecutionEngine>, workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        info!(
            "Starting execution pool: {} workers, queue capacity {}",
            workers, queue_capacity
        );

        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    engine.clone(),
                    receiver.clone(),
                    in_flight.clone(),
                ))
            })
            .collect();

        Self {
            engine,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            worker_count: workers,
            queue_capacity,
            in_flight,
        }
    }

    /// Queue `request`, waiting for queue space if the pool is saturated
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Submission> {
        self.submit_with_deadline(request, None).await
    }

    pub async fn submit_with_deadline(
        &self,
        request: ExecutionRequest,
        cancel_at: Option<Instant>,
    ) -> Result<Submission> {
        let sender = self.sender()?;
        let permit = sender.reserve().await.map_err(|_| EngineError::PoolClosed)?;
        Ok(self.enqueue(permit, request, cancel_at).await)
    }

    /// Queue `request` or fail with [`EngineError::QueueFull`]. A rejected
    /// request leaves no status record.
    pub async fn try_submit(&self, request: ExecutionRequest) -> Result<Submission> {
        let sender = self.sender()?;
        let permit = sender.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => EngineError::QueueFull,
            mpsc::error::TrySendError::Closed(()) => EngineError::PoolClosed,
        })?;
        Ok(self.enqueue(permit, request, None).await)
    }

    /// Stop accepting work, let the workers finish what is queued, and
    /// wait for them to exit
    pub async fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        info!("Draining execution pool");

        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Execution worker ended abnormally: {}", e);
            }
        }
        info!("Execution pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self
            .sender
            .lock()
            .as_ref()
            .map(|s| self.queue_capacity - s.capacity())
            .unwrap_or(0);
        PoolStats {
            workers: self.worker_count,
            queue_capacity: self.queue_capacity,
            queued,
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        self.sender.lock().clone().ok_or(EngineError::PoolClosed)
    }

    async fn enqueue(
        &self,
        permit: mpsc::Permit<'_, Job>,
        request: ExecutionRequest,
        cancel_at: Option<Instant>,
    ) -> Submission {
        let accepted_at = Instant::now();
        self.engine.accept(&request).await;

        let (reply, outcome) = oneshot::channel();
        let submission = Submission {
            execution_id: request.execution_id.clone(),
            outcome,
        };
        permit.send(Job {
            request,
            accepted_at,
            cancel_at,
            reply,
        });
        debug!("Queued execution {}", submission.execution_id);
        submission
    }
}

async fn worker_loop(
    worker_id: usize,
    engine: Arc<ExecutionEngine>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    in_flight: Arc<AtomicUsize>,
) {
    debug!("Execution worker {} started", worker_id);
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = engine
            .run(&job.request, job.accepted_at, job.cancel_at)
            .await;
        in_flight.fetch_sub(1, Ordering::SeqCst);

        if job.reply.send(outcome).is_err() {
            debug!(
                "Outcome of execution {} had no receiver",
                job.request.execution_id
            );
        }
    }
    debug!("Execution worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{echo_backend, fixture, RecordingSink};
    use crate::runtime::function::FunctionSpec;
    use crate::runtime::outcome::{ExecutionState, ExecutionStatus};
    use serde_json::json;
    use std::time::Duration;

    fn echo_function() -> FunctionSpec {
        FunctionSpec::new(
            "fn-echo",
            "nodejs",
            "exports.handler = (e) => ({ echo: e.value });",
        )
    }

    struct TestPool {
        pool: ExecutionPool,
        sink: Arc<RecordingSink>,
        _scratch: tempfile::TempDir,
    }

    async fn pool(delay: Duration, workers: usize, capacity: usize) -> TestPool {
        let fx = fixture(echo_backend().with_delay(delay), &[echo_function()]).await;
        TestPool {
            pool: ExecutionPool::new(Arc::new(fx.engine), workers, capacity),
            sink: fx.sink,
            _scratch: fx.scratch,
        }
    }

    fn echo_request() -> ExecutionRequest {
        ExecutionRequest::new("fn-echo", "t", json!({}))
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let TestPool { pool, _scratch, .. } = pool(Duration::ZERO, 4, 16).await;

        let submissions: Vec<_> = futures::future::try_join_all((0..8).map(|i| {
            pool.submit(ExecutionRequest::new("fn-echo", "t", json!({ "value": i })))
        }))
        .await
        .unwrap();

        for (i, submission) in submissions.into_iter().enumerate() {
            let execution_id = submission.execution_id.clone();
            let outcome = submission.wait().await.unwrap();
            assert_eq!(outcome.execution_id, execution_id);
            assert_eq!(outcome.status, ExecutionStatus::Success);
            assert_eq!(outcome.output, Some(json!({ "echo": i })));
        }

        let stats = pool.stats();
        assert_eq!(stats.workers, 4);
        assert_eq!(stats.in_flight, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_submission_is_pending() {
        let TestPool { pool, sink, _scratch } = pool(Duration::from_millis(500), 1, 4).await;

        let first = pool.submit(echo_request()).await.unwrap();
        let second = pool.submit(echo_request()).await.unwrap();
        let second_id = second.execution_id.clone();

        // The only worker is busy with the first request
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.states(&second_id), vec![ExecutionState::Pending]);
        assert_eq!(pool.stats().queued, 1);

        first.wait().await.unwrap();
        assert_eq!(second.wait().await.unwrap().status, ExecutionStatus::Success);
        assert_eq!(
            sink.states(&second_id),
            vec![
                ExecutionState::Pending,
                ExecutionState::Running,
                ExecutionState::Success
            ]
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_try_submit_queue_full() {
        let TestPool { pool, sink, _scratch } = pool(Duration::from_millis(500), 1, 1).await;

        // One job can be in the worker and one in the queue; the third
        // submission always finds the queue full
        let first = pool.try_submit(echo_request()).await.unwrap();
        let _ = pool.try_submit(echo_request()).await;
        let rejected = echo_request();
        let rejected_id = rejected.execution_id.clone();
        assert!(matches!(
            pool.try_submit(rejected).await,
            Err(EngineError::QueueFull)
        ));
        assert!(sink.states(&rejected_id).is_empty());

        assert_eq!(first.wait().await.unwrap().status, ExecutionStatus::Success);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_duration_counts_queue_wait() {
        let TestPool { pool, _scratch, .. } = pool(Duration::from_millis(300), 1, 4).await;

        let first = pool.submit(echo_request()).await.unwrap();
        let second = pool.submit(echo_request()).await.unwrap();

        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();
        assert!(first.duration_ms >= 300);
        assert!(second.duration_ms >= 550);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let TestPool { pool, _scratch, .. } = pool(Duration::from_millis(100), 2, 8).await;

        let pending: Vec<_> =
            futures::future::try_join_all((0..4).map(|_| pool.submit(echo_request())))
                .await
                .unwrap();

        pool.shutdown().await;

        for submission in pending {
            assert_eq!(submission.wait().await.unwrap().status, ExecutionStatus::Success);
        }
        assert!(matches!(
            pool.submit(echo_request()).await,
            Err(EngineError::PoolClosed)
        ));
        assert!(matches!(
            pool.try_submit(echo_request()).await,
            Err(EngineError::PoolClosed)
        ));
    }
}
