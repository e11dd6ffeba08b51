//! Engine configuration
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: `with_*` methods applied after loading
//! 2. **Environment variables**: `LATENT_*`
//! 3. **Config file**: TOML, see [`EngineConfig::from_file`]
//! 4. **Defaults**: [`EngineConfig::default()`]
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `LATENT_WORKERS` | `usize` | `workers` |
//! | `LATENT_BATCHING` | `bool` | `batching` |
//! | `LATENT_MAX_BATCH` | `usize` | `max_batch` |
//! | `LATENT_DEFAULT_TIMEOUT_MS` | `u64` | `default_timeout_ms` |
//! | `LATENT_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_WORKERS: &str = "LATENT_WORKERS";
pub const ENV_BATCHING: &str = "LATENT_BATCHING";
pub const ENV_MAX_BATCH: &str = "LATENT_MAX_BATCH";
pub const ENV_DEFAULT_TIMEOUT_MS: &str = "LATENT_DEFAULT_TIMEOUT_MS";
pub const ENV_THREAD_NAME_PREFIX: &str = "LATENT_THREAD_NAME_PREFIX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker threads in the shared pool
    pub workers: usize,
    /// Resolve independent group siblings in parallel
    pub batching: bool,
    /// Upper bound on promises running concurrently for one access
    pub max_batch: usize,
    /// Deadline for functions that do not declare their own timeout
    pub default_timeout_ms: Option<u64>,
    pub thread_name_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            batching: true,
            max_batch: 16,
            default_timeout_ms: None,
            thread_name_prefix: "latent-worker".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Defaults, then the optional file, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply `LATENT_*` overrides read through `lookup`. Only variables that
    /// are set are applied.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup(ENV_WORKERS) {
            self.workers = parse_usize(ENV_WORKERS, &val)?;
        }
        if let Some(val) = lookup(ENV_BATCHING) {
            self.batching = parse_bool(ENV_BATCHING, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_BATCH) {
            self.max_batch = parse_usize(ENV_MAX_BATCH, &val)?;
        }
        if let Some(val) = lookup(ENV_DEFAULT_TIMEOUT_MS) {
            self.default_timeout_ms = match val.trim() {
                "" | "none" => None,
                other => Some(parse_u64(ENV_DEFAULT_TIMEOUT_MS, other)?),
            };
        }
        if let Some(val) = lookup(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.max_batch == 0 {
            return Err(ConfigError::Invalid("max_batch must be at least 1".into()));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_batching(mut self, batching: bool) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        expected: "unsigned integer",
        value: val.to_string(),
    })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        expected: "milliseconds",
        value: val.to_string(),
    })
}

fn parse_bool(var: &'static str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            expected: "bool (true/false/1/0/yes/no)",
            value: val.to_string(),
        }),
    }
}
