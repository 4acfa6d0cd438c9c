// src/main.rs
//! Voltrun execution engine
//!
//! Reads JSON-lines commands on stdin and writes one JSON line per result
//! on stdout:
//!
//! ```text
//! {"op":"register","function":{"id":"hello","runtime":"nodejs","code":"..."}}
//! {"op":"invoke","function_id":"hello","caller":"cli","input":{"value":42}}
//! {"op":"status","execution_id":"01J..."}
//! {"op":"sandboxes"}
//! ```
//!
//! Stops on EOF or Ctrl-C after the queued executions have finished.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use voltrun_engine::engine::{ExecutionEngine, ExecutionPool};
use voltrun_engine::isolation::{IsolationManager, ProcessBackend};
use voltrun_engine::observability::{init_metrics, init_tracing};
use voltrun_engine::runner::RunnerRegistry;
use voltrun_engine::runtime::function::{ExecutionRequest, FunctionSpec};
use voltrun_engine::runtime::process_manager::ProcessManager;
use voltrun_engine::runtime::resource_limiter::CgroupLimiter;
use voltrun_engine::store::SqliteStore;
use voltrun_engine::utils::config::EngineConfig;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    Register {
        function: FunctionSpec,
    },
    Invoke {
        function_id: String,
        #[serde(default = "default_caller")]
        caller: String,
        #[serde(default)]
        input: Value,
    },
    Status {
        execution_id: String,
    },
    Sandboxes,
}

fn default_caller() -> String {
    "anonymous".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    info!("Starting Voltrun engine v{}", voltrun_engine::VERSION);
    debug!("Configuration loaded: {:?}", config);

    let store = Arc::new(SqliteStore::open(&config.storage.database_path).await?);
    let swept = store.sweep_orphans(config.runtime.orphan_grace()).await?;
    if swept > 0 {
        info!("Recovered {} orphaned executions", swept);
    }

    let processes = Arc::new(ProcessManager::new(
        config.runtime.kill_grace(),
        config.runtime.max_output_bytes,
    ));
    let mut backend = ProcessBackend::new(processes);
    if let Some(root) = &config.isolation.cgroup_root {
        info!("Applying cgroup budgets under {}", root.display());
        backend = backend.with_cgroups(CgroupLimiter::new(root));
    }
    let isolation = Arc::new(IsolationManager::new(Arc::new(backend)));

    let runners = RunnerRegistry::from_config(&config);
    info!("Runtimes available: {}", runners.runtimes().join(", "));

    let engine = Arc::new(
        ExecutionEngine::new(store.clone(), store.clone(), isolation.clone(), runners)
            .with_cpu_share(config.runtime.cpu_share),
    );
    let pool = ExecutionPool::new(engine, config.runtime.workers, config.runtime.queue_capacity);

    // Single writer so concurrent results never interleave within a line
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(value) = out_rx.recv().await {
            let mut line = value.to_string();
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!("Failed to write result: {}", e);
                break;
            }
            if let Err(e) = stdout.flush().await {
                error!("Failed to flush results: {}", e);
                break;
            }
        }
    });

    let mut waiting = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = &mut shutdown_signal => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match serde_json::from_str::<Command>(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring malformed command: {}", e);
                let error = format!("invalid command: {}", e);
                let _ = out_tx.send(json!({ "ok": false, "error": error }));
                continue;
            }
        };

        match command {
            Command::Register { function } => {
                let reply = match store.put_function(&function).await {
                    Ok(()) => json!({ "ok": true, "registered": function.id }),
                    Err(e) => json!({ "ok": false, "error": e.to_string() }),
                };
                let _ = out_tx.send(reply);
            }
            Command::Invoke {
                function_id,
                caller,
                input,
            } => {
                let request = ExecutionRequest::new(function_id, caller, input);
                match pool.submit(request).await {
                    Ok(submission) => {
                        let out_tx = out_tx.clone();
                        waiting.spawn(async move {
                            let reply = match submission.wait().await {
                                Ok(outcome) => json!({ "ok": true, "outcome": outcome }),
                                Err(e) => json!({ "ok": false, "error": e.to_string() }),
                            };
                            let _ = out_tx.send(reply);
                        });
                    }
                    Err(e) => {
                        let _ = out_tx.send(json!({ "ok": false, "error": e.to_string() }));
                    }
                }
            }
            Command::Status { execution_id } => {
                let reply = match store.get_execution(&execution_id).await {
                    Ok(Some(record)) => json!({ "ok": true, "execution": record }),
                    Ok(None) => {
                        let error = format!("execution not found: {}", execution_id);
                        json!({ "ok": false, "error": error })
                    }
                    Err(e) => json!({ "ok": false, "error": e.to_string() }),
                };
                let _ = out_tx.send(reply);
            }
            Command::Sandboxes => {
                let _ = out_tx.send(json!({ "ok": true, "sandboxes": isolation.list() }));
            }
        }
    }

    pool.shutdown().await;
    while waiting.join_next().await.is_some() {}
    drop(out_tx);
    if let Err(e) = writer.await {
        error!("Result writer failed: {}", e);
    }

    info!("Engine stopped");
    Ok(())
}
