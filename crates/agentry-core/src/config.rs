//! Engine configuration: TOML file plus `AGENTRY_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use agentry_state::ResourceLimits;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for the execution core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Live agent instances kept by the registry. `0` disables caching.
    pub cache_capacity: usize,
    /// Concurrency bound for calls of one step under the parallel strategy.
    pub max_parallel_calls: usize,
    /// Turn budget for model-driven agents.
    pub max_model_turns: u32,
    /// How long to wait past a function's deadline for its thread to stop.
    pub timeout_grace_ms: u64,
    /// Limits applied when a function is stored without explicit ones.
    pub default_limits: ResourceLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 64,
            max_parallel_calls: 4,
            max_model_turns: 8,
            timeout_grace_ms: 250,
            default_limits: ResourceLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Load `path` (if given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `AGENTRY_CACHE_CAPACITY`, `AGENTRY_MAX_PARALLEL_CALLS`,
    /// `AGENTRY_MAX_MODEL_TURNS`, `AGENTRY_TIMEOUT_GRACE_MS`,
    /// `AGENTRY_DEFAULT_MEMORY_MB`, and `AGENTRY_DEFAULT_TIMEOUT_SECS`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("AGENTRY_CACHE_CAPACITY") {
            self.cache_capacity = parse("AGENTRY_CACHE_CAPACITY", v)?;
        }
        if let Some(v) = lookup("AGENTRY_MAX_PARALLEL_CALLS") {
            self.max_parallel_calls = parse("AGENTRY_MAX_PARALLEL_CALLS", v)?;
        }
        if let Some(v) = lookup("AGENTRY_MAX_MODEL_TURNS") {
            self.max_model_turns = parse("AGENTRY_MAX_MODEL_TURNS", v)?;
        }
        if let Some(v) = lookup("AGENTRY_TIMEOUT_GRACE_MS") {
            self.timeout_grace_ms = parse("AGENTRY_TIMEOUT_GRACE_MS", v)?;
        }
        if let Some(v) = lookup("AGENTRY_DEFAULT_MEMORY_MB") {
            self.default_limits.memory_limit_mb = parse("AGENTRY_DEFAULT_MEMORY_MB", v)?;
        }
        if let Some(v) = lookup("AGENTRY_DEFAULT_TIMEOUT_SECS") {
            self.default_limits.timeout_seconds = parse("AGENTRY_DEFAULT_TIMEOUT_SECS", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_calls == 0 {
            return Err(ConfigError::Invalid("max_parallel_calls must be at least 1".into()));
        }
        if self.max_model_turns == 0 {
            return Err(ConfigError::Invalid("max_model_turns must be at least 1".into()));
        }
        if self.default_limits.memory_limit_mb == 0
            || self.default_limits.timeout_seconds.is_nan()
            || self.default_limits.timeout_seconds <= 0.0
        {
            return Err(ConfigError::Invalid(
                "default_limits must allow some memory and time".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout_grace(&self) -> Duration {
        Duration::from_millis(self.timeout_grace_ms)
    }
}
