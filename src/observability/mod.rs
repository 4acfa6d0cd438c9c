// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Metric names emitted by the engine:
//!
//! - `voltrun_executions_total{status}`: terminal outcomes
//! - `voltrun_execution_duration_ms`: wall-clock duration histogram
//! - `voltrun_sandboxes_active`: sandboxes currently tracked by the manager
//! - `voltrun_sandbox_acquire_failures_total`

use crate::utils::config::ObservabilitySettings;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const EXECUTIONS_TOTAL: &str = "voltrun_executions_total";
pub const EXECUTION_DURATION_MS: &str = "voltrun_execution_duration_ms";
pub const SANDBOXES_ACTIVE: &str = "voltrun_sandboxes_active";
pub const ACQUIRE_FAILURES_TOTAL: &str = "voltrun_sandbox_acquire_failures_total";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Logs go to
/// stderr; stdout carries the command protocol.
pub fn init_tracing(settings: &ObservabilitySettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if settings.json_logs {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    installed.map_err(|e| {
        EngineError::Config(format!("Failed to install tracing subscriber: {}", e))
    })
}

/// Install the Prometheus recorder if a scrape address is configured.
///
/// Without an address the `metrics` macros are no-ops.
pub fn init_metrics(settings: &ObservabilitySettings) -> Result<()> {
    let Some(addr) = &settings.metrics_addr else {
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| EngineError::Config(format!("Invalid metrics address '{}': {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Config(format!("Failed to install metrics exporter: {}", e)))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_addr() {
        let settings = ObservabilitySettings::default();
        assert!(init_metrics(&settings).is_ok());
    }

    #[test]
    fn test_invalid_metrics_addr() {
        let settings = ObservabilitySettings {
            metrics_addr: Some("not-an-address".to_string()),
            ..Default::default()
        };
        assert!(matches!(init_metrics(&settings), Err(EngineError::Config(_))));
    }
}
