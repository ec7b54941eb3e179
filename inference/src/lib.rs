//! Numeric compute engine for on-device transformer inference
//!
//! Tensors with aligned owned storage, a generation-checked scratch arena,
//! a row-wise 4-bit weight codec, scalar and SIMD matrix kernels selected at
//! runtime, and causal self-attention over a key/value cache.
//!
//! Everything runs synchronously on the calling thread. Model-file parsing,
//! tokenization and request scheduling live outside this crate; a loader
//! hands tensors over through [`WeightMap`].

mod aligned;
pub mod arena;
pub mod attention;
pub mod dtype;
pub mod error;
pub mod kernels;
pub mod kv_cache;
pub mod linear;
pub mod ops;
pub mod quant;
pub mod session;
pub mod tensor;
pub mod weights;

pub use arena::{Arena, ArenaHandle, ArenaStats, Region};
pub use attention::{softmax_in_place, CausalAttention};
pub use dtype::{DType, Element};
pub use error::{Error, Result};
pub use kernels::{
    default_kernel, matmul, matmul_with, matvec, matvec_with, select_kernel, KernelManager,
    KernelProvider, ScalarKernel,
};
pub use kv_cache::{KvCache, LayerCache};
pub use linear::{Linear, Weight};
pub use quant::{dequantize, matvec_q4, pack, row_scales, QuantizedMatrix};
pub use session::Session;
pub use tensor::{Shape, Tensor};
pub use weights::WeightMap;

pub use engine_config::{EngineConfig, KernelPreference};
