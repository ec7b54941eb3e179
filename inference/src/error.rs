// Error types for the compute engine

use engine_config::ConfigError;
use thiserror::Error;

use crate::dtype::DType;

/// Errors raised by tensors, the arena, the codec, kernels and attention.
///
/// Every error is raised before the destination of the failing operation is
/// written; nothing is retried internally.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("DType mismatch: expected {expected}, got {actual}")]
    DTypeMismatch { expected: String, actual: DType },

    #[error("Unsupported access: {0}")]
    UnsupportedAccess(String),

    #[error("Shape mismatch in {op}: {detail}")]
    ShapeMismatch { op: &'static str, detail: String },

    #[error("Invalid quantization scale {scale} for row {row}")]
    InvalidScale { row: usize, scale: f32 },

    #[error("Out of memory: could not reserve {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Stale arena handle: generation {handle} but arena is at {current}")]
    StaleHandle { handle: u64, current: u64 },

    #[error("KV cache full: {len} + {adding} positions exceeds capacity {capacity}")]
    CacheFull {
        len: usize,
        adding: usize,
        capacity: usize,
    },

    #[error("Layer {layer} out of range for {layers} cached layers")]
    LayerOutOfRange { layer: usize, layers: usize },

    #[error("Tensor not found: {0}")]
    MissingTensor(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub(crate) fn shape_mismatch(op: &'static str, detail: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            op,
            detail: detail.into(),
        }
    }

    pub(crate) fn dtype_mismatch(expected: impl Into<String>, actual: DType) -> Self {
        Error::DTypeMismatch {
            expected: expected.into(),
            actual,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
