//! Server configuration.
//!
//! Every value has a default, so an empty (or missing) file is a valid config.
//! Durations are plain integers in the file, named by their unit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "BLOCKGATE_CONFIG";
pub const BIND_ENV: &str = "BLOCKGATE_BIND";
pub const RATE_LIMIT_ENV: &str = "BLOCKGATE_RATE_LIMIT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub admission: AdmissionConfig,
    pub resilience: ResilienceConfig,
    pub batch: BatchConfig,
    pub limits: Limits,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_in_flight: usize,
    pub max_message_bytes: usize,
    pub shutdown_grace_ms: u64,
}
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:14711".to_owned(),
            max_in_flight: 64,
            max_message_bytes: 64 * 1024,
            shutdown_grace_ms: 5_000,
        }
    }
}
impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Requests admitted per identity per window.
    pub limit: u32,
    pub window_ms: u64,
    pub idle_eviction_secs: u64,
    pub sweep_interval_secs: u64,
}
impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window_ms: 1_000,
            idle_eviction_secs: 5 * 60,
            sweep_interval_secs: 60,
        }
    }
}
impl AdmissionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BreakerOverride {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub command_timeout_ms: u64,
    /// Per operation name, e.g. `[resilience.breakers."world.setBlock"]`.
    pub breakers: BTreeMap<String, BreakerOverride>,
}
impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            command_timeout_ms: 5_000,
            breakers: BTreeMap::new(),
        }
    }
}
impl ResilienceConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub chunk_size: usize,
    /// Applied mutations between two region flushes.
    pub flush_threshold: usize,
    pub run_timeout_ms: u64,
}
impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            flush_threshold: 10_000,
            run_timeout_ms: 30_000,
        }
    }
}
impl BatchConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_fill_volume: u64,
    pub max_radius: i32,
    pub max_wall_height: i32,
}
impl Default for Limits {
    fn default() -> Self {
        Self {
            max_fill_volume: 10_000,
            max_radius: 50,
            max_wall_height: 50,
        }
    }
}

impl Config {
    pub fn from_toml(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.admission.limit == 0, "admission.limit must be at least 1"),
            (self.admission.window_ms == 0, "admission.window_ms must be positive"),
            (
                self.admission.sweep_interval_secs == 0,
                "admission.sweep_interval_secs must be positive",
            ),
            (
                self.resilience.failure_threshold == 0,
                "resilience.failure_threshold must be at least 1",
            ),
            (self.batch.chunk_size == 0, "batch.chunk_size must be at least 1"),
            (self.batch.flush_threshold == 0, "batch.flush_threshold must be at least 1"),
            (self.server.max_in_flight == 0, "server.max_in_flight must be at least 1"),
            (self.server.max_message_bytes == 0, "server.max_message_bytes must be positive"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ConfigError::Invalid((*msg).to_owned())),
            None => Ok(()),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var(BIND_ENV) {
            self.server.bind = bind;
        }
        if let Ok(limit) = std::env::var(RATE_LIMIT_ENV) {
            match limit.parse() {
                Ok(limit) => self.admission.limit = limit,
                Err(e) => log::warn!("ignoring {RATE_LIMIT_ENV}={limit:?}: {e}"),
            }
        }
    }
}

/// Loads `path`, falling back to `$BLOCKGATE_CONFIG`, then to defaults.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            log::info!("loaded configuration from {}", path.display());
            Config::from_toml(&path, &contents)?
        }
        None => Config::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
