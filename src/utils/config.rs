// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file (`voltrun.toml`, or the path in `VOLTRUN_CONFIG`), then environment
//! variables of the form `VOLTRUN__RUNTIME__WORKERS=32`.

use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: RuntimeSettings,
    pub runners: RunnerSettings,
    pub isolation: IsolationSettings,
    pub storage: StorageSettings,
    pub observability: ObservabilitySettings,
}

/// Execution runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Number of pool workers (concurrent executions)
    pub workers: usize,

    /// Accepted requests waiting for a worker
    pub queue_capacity: usize,

    /// Directory under which per-execution scratch workspaces are created
    pub scratch_dir: PathBuf,

    /// Time between SIGTERM and SIGKILL when a deadline expires
    pub kill_grace_ms: u64,

    /// Per-stream cap on captured output bytes
    pub max_output_bytes: usize,

    /// CPU share requested for every sandbox
    pub cpu_share: f64,

    /// Extra time past a function's timeout before a `running` record is
    /// considered orphaned
    pub orphan_grace_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_capacity: 256,
            scratch_dir: std::env::temp_dir(),
            kill_grace_ms: 200,
            max_output_bytes: 1024 * 1024,
            cpu_share: 1.0,
            orphan_grace_secs: 30,
        }
    }
}

impl RuntimeSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

/// Interpreter binaries used by the runners
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub node_bin: String,
    pub python_bin: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            node_bin: "node".to_string(),
            python_bin: "python3".to_string(),
        }
    }
}

/// Isolation backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationSettings {
    /// cgroup v2 directory under which per-sandbox groups are created.
    /// Unset disables cgroup budgets.
    pub cgroup_root: Option<PathBuf>,
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("voltrun.db"),
        }
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,

    /// Emit logs as JSON lines
    pub json_logs: bool,

    /// Prometheus scrape address, e.g. `0.0.0.0:9000`
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("VOLTRUN_CONFIG").unwrap_or_else(|_| "voltrun".to_string());
        Self::load_from(&path)
    }

    /// Load configuration using `path` as the (optional) config file
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&EngineConfig::default())?)
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("VOLTRUN")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
