//! Key/value cache for autoregressive generation
//!
//! One [`LayerCache`] per transformer layer. Each cached position holds a key
//! and a value tensor of shape `[batch, hidden]`; keys and values always have
//! the same length.

use engine_config::CacheConfig;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Cached keys and values of one layer
#[derive(Debug)]
pub struct LayerCache {
    keys: Vec<Tensor>,
    values: Vec<Tensor>,
    capacity: usize,
}

impl LayerCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            capacity,
        }
    }

    /// Number of cached positions
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn keys(&self) -> &[Tensor] {
        &self.keys
    }

    pub fn values(&self) -> &[Tensor] {
        &self.values
    }

    pub fn key(&self, pos: usize) -> Option<&Tensor> {
        self.keys.get(pos)
    }

    pub fn value(&self, pos: usize) -> Option<&Tensor> {
        self.values.get(pos)
    }

    /// `[batch, hidden]` of the cached entries, `None` while empty
    pub fn entry_dims(&self) -> Option<(usize, usize)> {
        self.keys.first().and_then(|k| match k.dims() {
            &[batch, hidden] => Some((batch, hidden)),
            _ => None,
        })
    }

    /// Fail with `CacheFull` unless `adding` more positions fit
    pub fn ensure_room(&self, adding: usize) -> Result<()> {
        let len = self.len();
        match len.checked_add(adding) {
            Some(total) if total <= self.capacity => Ok(()),
            _ => Err(Error::CacheFull {
                len,
                adding,
                capacity: self.capacity,
            }),
        }
    }

    /// Append one position
    pub fn append(&mut self, key: Tensor, value: Tensor) -> Result<()> {
        self.ensure_room(1)?;
        if key.dtype() != DType::F32 {
            return Err(Error::dtype_mismatch("FP32", key.dtype()));
        }
        if value.dtype() != DType::F32 {
            return Err(Error::dtype_mismatch("FP32", value.dtype()));
        }
        if key.dims() != value.dims() || key.rank() != 2 {
            return Err(Error::shape_mismatch(
                "kv_cache",
                format!("key {} and value {} must be equal [batch, hidden]", key.shape(), value.shape()),
            ));
        }
        if let Some((batch, hidden)) = self.entry_dims() {
            if key.dims() != [batch, hidden] {
                return Err(Error::shape_mismatch(
                    "kv_cache",
                    format!("entry {} does not match cached [{}, {}]", key.shape(), batch, hidden),
                ));
            }
        }
        self.keys.push(key);
        self.values.push(value);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
    }
}

/// Per-layer caches of one generation session
#[derive(Debug)]
pub struct KvCache {
    layers: Vec<LayerCache>,
}

impl KvCache {
    pub fn new(num_layers: usize, capacity: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| LayerCache::new(capacity)).collect(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.num_layers, config.capacity)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer: usize) -> Result<&LayerCache> {
        let num_layers = self.layers.len();
        self.layers.get(layer).ok_or_else(|| layer_out_of_range(layer, num_layers))
    }

    pub fn layer_mut(&mut self, layer: usize) -> Result<&mut LayerCache> {
        let num_layers = self.layers.len();
        self.layers
            .get_mut(layer)
            .ok_or_else(|| layer_out_of_range(layer, num_layers))
    }

    /// Length of the first layer's cache
    pub fn current_len(&self) -> usize {
        self.layers.first().map_or(0, LayerCache::len)
    }

    /// Empty every layer for a new session
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
        log::debug!("kv cache cleared: {} layers", self.layers.len());
    }
}

fn layer_out_of_range(layer: usize, layers: usize) -> Error {
    Error::LayerOutOfRange { layer, layers }
}
