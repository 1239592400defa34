//! Orchestrator configuration from environment variables or a TOML file.
//!
//! Invalid or out-of-range values fall back to defaults or are clamped;
//! loading never fails for the environment source.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_CTX_WORKER_THREADS` | 0 | Worker threads (0 = auto, at least 4) |
//! | `GG_CTX_WORKER_QUEUE` | 1024 | Max units waiting for a worker |
//! | `GG_CTX_CONTEXT_LIMIT` | -1 | Max live contexts (-1 = unlimited) |
//! | `GG_CTX_SHUTDOWN_GRACE` | 5 | Shutdown grace period (secs) |
//! | `GG_CTX_STOP_TIMEOUT_MS` | 0 | Default `stop_and_wait` bound (0 = unbounded) |
//! | `GG_CTX_PROGRESS_EVERY` | 1 | Load progress step in percent (1..=100) |
//! | `GG_CTX_LOG_FORMAT` | json | `json` or `pretty` |
//! | `GG_CTX_LOG_LEVEL` | info | Log filter directive |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::UNLIMITED;
use crate::scheduler::WorkerPoolConfig;
use crate::telemetry::{LogConfig, LogFormat};

pub const ENV_WORKER_THREADS: &str = "GG_CTX_WORKER_THREADS";
pub const ENV_WORKER_QUEUE: &str = "GG_CTX_WORKER_QUEUE";
pub const ENV_CONTEXT_LIMIT: &str = "GG_CTX_CONTEXT_LIMIT";
pub const ENV_SHUTDOWN_GRACE: &str = "GG_CTX_SHUTDOWN_GRACE";
pub const ENV_STOP_TIMEOUT_MS: &str = "GG_CTX_STOP_TIMEOUT_MS";
pub const ENV_PROGRESS_EVERY: &str = "GG_CTX_PROGRESS_EVERY";
pub const ENV_LOG_FORMAT: &str = "GG_CTX_LOG_FORMAT";
pub const ENV_LOG_LEVEL: &str = "GG_CTX_LOG_LEVEL";

/// Every variable read by [`load`].
pub const ENV_KEYS: &[&str] = &[
    ENV_WORKER_THREADS,
    ENV_WORKER_QUEUE,
    ENV_CONTEXT_LIMIT,
    ENV_SHUTDOWN_GRACE,
    ENV_STOP_TIMEOUT_MS,
    ENV_PROGRESS_EVERY,
    ENV_LOG_FORMAT,
    ENV_LOG_LEVEL,
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// 0 = auto-detect.
    pub worker_threads: usize,
    pub worker_queue: usize,
    /// -1 = unlimited.
    pub context_limit: i64,
    pub shutdown_grace_secs: u64,
    /// 0 = wait without bound.
    pub stop_timeout_ms: u64,
    /// Default load progress step for contexts that don't set one.
    pub progress_every: u32,
    pub log_format: LogFormat,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            worker_queue: 1024,
            context_limit: UNLIMITED,
            shutdown_grace_secs: 5,
            stop_timeout_ms: 0,
            progress_every: 1,
            log_format: LogFormat::Json,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub worker_threads: usize,
    pub worker_queue: usize,
    pub context_limit: i64,
    pub shutdown_grace_secs: u64,
    pub stop_timeout_ms: u64,
    pub progress_every: u32,
    pub log_format: &'static str,
    pub log_level: String,
}

impl OrchestratorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// `None` means unbounded.
    pub fn stop_timeout(&self) -> Option<Duration> {
        (self.stop_timeout_ms > 0).then(|| Duration::from_millis(self.stop_timeout_ms))
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_threads: self.worker_threads,
            queue_size: self.worker_queue,
            ..Default::default()
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: self.log_format,
            level: self.log_level.clone(),
            output_path: self.log_file.clone(),
        }
    }

    /// Apply floors and clamps.
    pub fn normalized(mut self) -> Self {
        self.worker_queue = self.worker_queue.max(1);
        if self.context_limit < UNLIMITED {
            self.context_limit = UNLIMITED;
        }
        self.shutdown_grace_secs = self.shutdown_grace_secs.max(1);
        self.progress_every = self.progress_every.clamp(1, 100);
        if self.log_level.trim().is_empty() {
            self.log_level = "info".to_string();
        }
        self
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            worker_threads: self.worker_pool().resolved_threads(),
            worker_queue: self.worker_queue,
            context_limit: self.context_limit,
            shutdown_grace_secs: self.shutdown_grace_secs,
            stop_timeout_ms: self.stop_timeout_ms,
            progress_every: self.progress_every,
            log_format: self.log_format.as_str(),
            log_level: self.log_level.clone(),
        }
    }
}

/// Parse an env var, returning `default` on missing or invalid.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load configuration from environment variables.
///
/// Missing or invalid values fall back to defaults without panicking.
pub fn load() -> OrchestratorConfig {
    let defaults = OrchestratorConfig::default();
    let log_format = std::env::var(ENV_LOG_FORMAT)
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or(defaults.log_format);
    let log_level = std::env::var(ENV_LOG_LEVEL).unwrap_or(defaults.log_level);

    OrchestratorConfig {
        worker_threads: parse_env(ENV_WORKER_THREADS, defaults.worker_threads),
        worker_queue: parse_env(ENV_WORKER_QUEUE, defaults.worker_queue),
        context_limit: parse_env(ENV_CONTEXT_LIMIT, defaults.context_limit),
        shutdown_grace_secs: parse_env(ENV_SHUTDOWN_GRACE, defaults.shutdown_grace_secs),
        stop_timeout_ms: parse_env(ENV_STOP_TIMEOUT_MS, defaults.stop_timeout_ms),
        progress_every: parse_env(ENV_PROGRESS_EVERY, defaults.progress_every),
        log_format,
        log_level,
        log_file: None,
    }
    .normalized()
}

/// Load configuration from a TOML file. Missing keys take defaults.
pub fn load_file(path: impl AsRef<Path>) -> Result<OrchestratorConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: OrchestratorConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(config.normalized())
}

/// Serializes tests that mutate process environment.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn clear_env_vars() {
    for k in ENV_KEYS {
        std::env::remove_var(k);
    }
}
