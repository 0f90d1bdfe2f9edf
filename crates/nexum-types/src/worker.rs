//! Worker lifecycle state and configuration.
//!
//! `WorkerConfig` and `TracingConfig` are usually loaded from a `worker.toml`
//! (see `nexum-infra::config`). All fields have defaults so an empty file is
//! valid.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a worker.
///
/// Transitions: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Stopped => "STOPPED",
            WorkerState::Starting => "STARTING",
            WorkerState::Running => "RUNNING",
            WorkerState::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

/// Configuration for one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Address of the remote coordinator (`host:port`).
    #[serde(default = "default_coordinator_address")]
    pub coordinator_address: String,

    /// Explicit worker id. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Maximum number of task dispatches in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Sleep after a poll round that found no task.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Sleep after a transport error while polling.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Interval between execution status checks in `run_until_complete`.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

fn default_coordinator_address() -> String {
    "localhost:50051".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_error_backoff_ms() -> u64 {
    1000
}

fn default_status_interval_ms() -> u64 {
    500
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_address: default_coordinator_address(),
            worker_id: None,
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

impl WorkerConfig {
    /// Concurrency bound actually enforced. A configured 0 still allows one task.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// The configured worker id, or a fresh `worker-<uuid v7>`.
    pub fn resolved_worker_id(&self) -> String {
        match &self.worker_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("worker-{}", Uuid::now_v7()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Period between execution status checks. Never zero.
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// TracingConfig
// ---------------------------------------------------------------------------

/// Logging settings, read from the `[tracing]` table of `worker.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingConfig {
    /// `EnvFilter` directives. `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Log a line with the duration of every closed span (one per dispatch).
    #[serde(default = "default_span_timing")]
    pub span_timing: bool,

    /// Also export spans to stdout through OpenTelemetry.
    #[serde(default)]
    pub otel_stdout: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_span_timing() -> bool {
    true
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            span_timing: default_span_timing(),
            otel_stdout: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.coordinator_address, "localhost:50051");
        assert!(config.worker_id.is_none());
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.error_backoff(), Duration::from_secs(1));
        assert_eq!(config.status_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_tracing_config_defaults() {
        let config: TracingConfig = toml::from_str("otel_stdout = true").unwrap();
        assert_eq!(config.filter, "info");
        assert!(config.span_timing);
        assert!(config.otel_stdout);
        assert_eq!(
            toml::from_str::<TracingConfig>("").unwrap(),
            TracingConfig::default()
        );
    }

    #[test]
    fn test_zero_status_interval_is_clamped() {
        let config: WorkerConfig = toml::from_str("status_interval_ms = 0").unwrap();
        assert_eq!(config.status_interval_ms, 0);
        assert_eq!(config.status_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_worker_config_deserialize_empty() {
        let config: WorkerConfig = toml::from_str("").unwrap();
        assert_eq!(config, WorkerConfig::default());
    }

    #[test]
    fn test_worker_config_deserialize_with_values() {
        let toml_str = r#"
coordinator_address = "coord.internal:7000"
worker_id = "billing-1"
concurrency = 16
poll_interval_ms = 50
"#;
        let config: WorkerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.coordinator_address, "coord.internal:7000");
        assert_eq!(config.resolved_worker_id(), "billing-1");
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.error_backoff_ms, 1000);
    }

    #[test]
    fn test_concurrency_floor() {
        let config = WorkerConfig {
            concurrency: 0,
            ..WorkerConfig::default()
        };
        assert_eq!(config.effective_concurrency(), 1);
    }

    #[test]
    fn test_generated_worker_id() {
        let config = WorkerConfig::default();
        let a = config.resolved_worker_id();
        let b = config.resolved_worker_id();
        assert!(a.starts_with("worker-"));
        assert_ne!(a, b);

        let blank = WorkerConfig {
            worker_id: Some("  ".to_string()),
            ..WorkerConfig::default()
        };
        assert!(blank.resolved_worker_id().starts_with("worker-"));
    }

    #[test]
    fn test_worker_state_display() {
        assert_eq!(WorkerState::default(), WorkerState::Stopped);
        assert_eq!(WorkerState::Stopping.to_string(), "STOPPING");
    }
}
