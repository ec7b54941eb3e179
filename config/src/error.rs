// Error types for engine configuration

use thiserror::Error;

/// Errors produced while loading or validating an engine configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Unknown kernel preference: {0}")]
    UnknownKernel(String),

    #[error("Invalid environment variable {key}={value}")]
    InvalidEnvVar { key: String, value: String },
}

impl ConfigError {
    pub fn invalid_value(key: &str, reason: &str) -> Self {
        ConfigError::InvalidValue {
            key: String::from(key),
            reason: String::from(reason),
        }
    }
}
