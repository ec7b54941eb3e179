//! Configuration types for the inference engine
//!
//! Every section has a `Default` so a partial TOML file only needs to name
//! the values it changes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main configuration structure for an engine session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub arena: ArenaConfig,
    pub kernels: KernelConfig,
    pub attention: AttentionConfig,
    pub cache: CacheConfig,
}

/// Scratch arena sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Size of the first backing block in bytes
    pub initial_bytes: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_bytes: 1024 * 1024,
        }
    }
}

/// Kernel variant selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub preference: KernelPreference,
}

/// Which matmul implementation to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelPreference {
    /// Best variant the host supports
    #[default]
    Auto,
    /// Portable reference kernel
    Scalar,
    Avx2,
    Avx512,
    Neon,
}

impl KernelPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelPreference::Auto => "auto",
            KernelPreference::Scalar => "scalar",
            KernelPreference::Avx2 => "avx2",
            KernelPreference::Avx512 => "avx512",
            KernelPreference::Neon => "neon",
        }
    }
}

impl fmt::Display for KernelPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelPreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(KernelPreference::Auto),
            "scalar" | "fallback" => Ok(KernelPreference::Scalar),
            "avx2" => Ok(KernelPreference::Avx2),
            "avx512" => Ok(KernelPreference::Avx512),
            "neon" => Ok(KernelPreference::Neon),
            other => Err(ConfigError::UnknownKernel(String::from(other))),
        }
    }
}

/// Multi-head attention geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub num_heads: usize,
    pub head_dim: usize,
    /// Score scale; `1 / sqrt(head_dim)` when unset
    pub scale: Option<f32>,
}

impl AttentionConfig {
    /// `num_heads * head_dim`, `None` on overflow
    pub fn hidden_size(&self) -> Option<usize> {
        self.num_heads.checked_mul(self.head_dim)
    }

    pub fn effective_scale(&self) -> f32 {
        self.scale
            .unwrap_or_else(|| 1.0 / (self.head_dim.max(1) as f32).sqrt())
    }
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: 12,
            head_dim: 64,
            scale: None,
        }
    }
}

/// Key/value cache geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub num_layers: usize,
    /// Maximum number of cached positions per layer
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_layers: 12,
            capacity: 2048,
        }
    }
}
