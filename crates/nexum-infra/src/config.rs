//! Worker configuration loader.
//!
//! Reads a `worker.toml` and deserializes its top-level keys into
//! [`WorkerConfig`], then applies `NEXUM_*` environment overrides. The
//! optional `[tracing]` table becomes a [`TracingConfig`]. A missing or
//! malformed file falls back to defaults so a worker can always start.

use std::path::Path;

use nexum_types::worker::{TracingConfig, WorkerConfig};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Overrides `coordinator_address`.
pub const ENV_ADDRESS: &str = "NEXUM_ADDRESS";
/// Overrides `worker_id`.
pub const ENV_WORKER_ID: &str = "NEXUM_WORKER_ID";
/// Overrides `concurrency`.
pub const ENV_CONCURRENCY: &str = "NEXUM_CONCURRENCY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse worker config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Parse a TOML document into a [`WorkerConfig`]. Missing fields take defaults.
pub fn parse_worker_config(content: &str) -> Result<WorkerConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

#[derive(Deserialize)]
struct TracingSection {
    #[serde(default)]
    tracing: TracingConfig,
}

/// Parse the `[tracing]` table of a TOML document. An absent table gives defaults.
pub fn parse_tracing_config(content: &str) -> Result<TracingConfig, ConfigError> {
    let section: TracingSection = toml::from_str(content)?;
    Ok(section.tracing)
}

/// Load worker configuration from `path`.
///
/// - Missing file: returns [`WorkerConfig::default()`].
/// - Unreadable or malformed file: logs a warning and returns the default.
pub async fn load_worker_config(path: &Path) -> WorkerConfig {
    load_or_default(path, parse_worker_config).await
}

/// Load the `[tracing]` table from `path`, with the same fallbacks as
/// [`load_worker_config`].
pub async fn load_tracing_config(path: &Path) -> TracingConfig {
    load_or_default(path, parse_tracing_config).await
}

async fn load_or_default<T, F>(path: &Path, parse: F) -> T
where
    T: DeserializeOwned + Default,
    F: Fn(&str) -> Result<T, ConfigError>,
{
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No worker config at {}, using defaults", path.display());
            return T::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return T::default();
        }
    };

    match parse(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            T::default()
        }
    }
}

/// Apply `NEXUM_*` overrides read through `lookup`.
///
/// Blank values are ignored. A non-numeric or zero `NEXUM_CONCURRENCY` is an error.
pub fn apply_env_overrides<F>(mut config: WorkerConfig, lookup: F) -> Result<WorkerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

    if let Some(address) = get(ENV_ADDRESS) {
        config.coordinator_address = address.trim().to_string();
    }
    if let Some(worker_id) = get(ENV_WORKER_ID) {
        config.worker_id = Some(worker_id.trim().to_string());
    }
    if let Some(raw) = get(ENV_CONCURRENCY) {
        config.concurrency = match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ConfigError::InvalidEnv {
                    var: ENV_CONCURRENCY,
                    value: raw,
                });
            }
        };
    }
    Ok(config)
}

/// Load `path` and apply overrides from the process environment.
pub async fn resolve_worker_config(path: &Path) -> Result<WorkerConfig, ConfigError> {
    let config = load_worker_config(path).await;
    apply_env_overrides(config, |var| std::env::var(var).ok())
}
