//! Engine configuration
//!
//! Sources, in increasing precedence: built-in defaults, a TOML file, then
//! `INFERENCE_*` environment variables.

pub mod error;
pub mod types;

pub use error::ConfigError;
pub use types::{ArenaConfig, AttentionConfig, CacheConfig, EngineConfig, KernelConfig, KernelPreference};

use std::path::Path;
use std::{env, fs};

/// Environment variable overriding `kernels.preference`
pub const ENV_KERNEL: &str = "INFERENCE_KERNEL";
/// Environment variable overriding `arena.initial_bytes`
pub const ENV_ARENA_BYTES: &str = "INFERENCE_ARENA_BYTES";
/// Environment variable overriding `cache.capacity`
pub const ENV_CACHE_CAPACITY: &str = "INFERENCE_CACHE_CAPACITY";

impl EngineConfig {
    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file; a missing file yields the defaults
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::warn!("Config file not found: {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `INFERENCE_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| env::var(key).ok())
    }

    /// Apply overrides through an arbitrary lookup, so callers and tests can
    /// supply their own environment.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_KERNEL) {
            self.kernels.preference = v.parse()?;
        }
        if let Some(v) = lookup(ENV_ARENA_BYTES) {
            self.arena.initial_bytes = parse_env_usize(ENV_ARENA_BYTES, &v)?;
        }
        if let Some(v) = lookup(ENV_CACHE_CAPACITY) {
            self.cache.capacity = parse_env_usize(ENV_CACHE_CAPACITY, &v)?;
        }
        self.validate()
    }

    /// Reject configurations no session could be built from
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena.initial_bytes == 0 {
            return Err(ConfigError::invalid_value("arena.initial_bytes", "must be non-zero"));
        }
        if self.attention.num_heads == 0 {
            return Err(ConfigError::invalid_value("attention.num_heads", "must be non-zero"));
        }
        if self.attention.head_dim == 0 {
            return Err(ConfigError::invalid_value("attention.head_dim", "must be non-zero"));
        }
        if self.attention.hidden_size().is_none() {
            return Err(ConfigError::invalid_value(
                "attention.num_heads",
                "num_heads x head_dim overflows",
            ));
        }
        if let Some(scale) = self.attention.scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(ConfigError::invalid_value(
                    "attention.scale",
                    "must be finite and positive",
                ));
            }
        }
        if self.cache.num_layers == 0 {
            return Err(ConfigError::invalid_value("cache.num_layers", "must be non-zero"));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::invalid_value("cache.capacity", "must be non-zero"));
        }
        Ok(())
    }
}

fn parse_env_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvVar {
        key: String::from(key),
        value: String::from(value),
    })
}
