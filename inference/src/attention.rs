//! Causal multi-head self-attention
//!
//! Inputs are `[batch, seq, hidden]` with `hidden = num_heads * head_dim`.
//! Each head works on its own `head_dim` slice of the hidden vector and
//! writes back into the same slice of the output; heads never mix.
//!
//! With a [`LayerCache`] the cached positions come first: query `s` of the
//! current step sees every cached position plus new positions `0..=s`. The
//! new keys and values are appended once the step has been computed. Without
//! a cache everything is recomputed from the given sequence.

use engine_config::{AttentionConfig, ConfigError};

use crate::arena::Arena;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kv_cache::LayerCache;
use crate::ops::{axpy, dot, softmax};
use crate::tensor::Tensor;

/// Normalize attention scores in place, see [`crate::ops::softmax`]
pub fn softmax_in_place(scores: &mut [f32]) {
    softmax(scores);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CausalAttention {
    num_heads: usize,
    head_dim: usize,
    hidden: usize,
    scale: f32,
}

#[derive(Debug, Clone, Copy)]
struct Dims {
    batch: usize,
    seq: usize,
    hidden: usize,
}

impl CausalAttention {
    pub fn new(num_heads: usize, head_dim: usize, scale: f32) -> Result<Self> {
        if num_heads == 0 || head_dim == 0 {
            return Err(Error::InvalidShape(format!(
                "attention needs at least one head of non-zero width, got {} x {}",
                num_heads, head_dim
            )));
        }
        let hidden = num_heads.checked_mul(head_dim).ok_or_else(|| {
            Error::InvalidShape(format!(
                "attention hidden size {} x {} overflows",
                num_heads, head_dim
            ))
        })?;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ConfigError::invalid_value("attention.scale", "must be finite and positive").into());
        }
        Ok(Self {
            num_heads,
            head_dim,
            hidden,
            scale,
        })
    }

    /// Scale `1 / sqrt(head_dim)`
    pub fn with_default_scale(num_heads: usize, head_dim: usize) -> Result<Self> {
        Self::new(num_heads, head_dim, 1.0 / (head_dim.max(1) as f32).sqrt())
    }

    pub fn from_config(config: &AttentionConfig) -> Result<Self> {
        Self::new(config.num_heads, config.head_dim, config.effective_scale())
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    /// Attention output `[batch, seq, hidden]` with a heap score buffer
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let dims = self.validate(q, k, v, cache.as_deref())?;
        let past = cache.as_deref().map_or(0, LayerCache::len);
        let mut scores = vec![0.0f32; past + dims.seq];
        let out = self.compute(q, k, v, cache.as_deref(), &mut scores, dims)?;
        if let Some(cache) = cache {
            append_step(cache, k, v, dims)?;
        }
        Ok(out)
    }

    /// Like [`forward`](Self::forward) with the score buffer taken from
    /// `arena`. The region stays allocated until the arena is reset, so
    /// repeated decode steps should reuse one buffer through
    /// [`forward_with_scores`](Self::forward_with_scores) instead.
    pub fn forward_with_scratch(
        &self,
        arena: &mut Arena,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let dims = self.validate(q, k, v, cache.as_deref())?;
        let past = cache.as_deref().map_or(0, LayerCache::len);
        let handle = arena.allocate_for::<f32>(past + dims.seq)?;
        let scores = arena.slice_mut::<f32>(&handle)?;
        let out = self.compute(q, k, v, cache.as_deref(), scores, dims)?;
        if let Some(cache) = cache {
            append_step(cache, k, v, dims)?;
        }
        Ok(out)
    }

    /// Like [`forward`](Self::forward) with a caller-owned score buffer of
    /// at least `cached + seq` elements.
    pub fn forward_with_scores(
        &self,
        scores: &mut [f32],
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let dims = self.validate(q, k, v, cache.as_deref())?;
        let past = cache.as_deref().map_or(0, LayerCache::len);
        let visible = past.checked_add(dims.seq).unwrap_or(usize::MAX);
        if scores.len() < visible {
            return Err(Error::shape_mismatch(
                "attention",
                format!(
                    "score buffer holds {} positions, step needs {}",
                    scores.len(),
                    visible
                ),
            ));
        }
        let out = self.compute(q, k, v, cache.as_deref(), &mut scores[..visible], dims)?;
        if let Some(cache) = cache {
            append_step(cache, k, v, dims)?;
        }
        Ok(out)
    }

    fn validate(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cache: Option<&LayerCache>,
    ) -> Result<Dims> {
        for t in [q, k, v] {
            if t.dtype() != DType::F32 {
                return Err(Error::dtype_mismatch("FP32", t.dtype()));
            }
        }
        let (batch, seq, hidden) = match q.dims() {
            &[b, s, h] => (b, s, h),
            other => {
                return Err(Error::shape_mismatch(
                    "attention",
                    format!("query must be [batch, seq, hidden], got {:?}", other),
                ))
            }
        };
        if k.dims() != q.dims() || v.dims() != q.dims() {
            return Err(Error::shape_mismatch(
                "attention",
                format!("query {}, key {} and value {} differ", q.shape(), k.shape(), v.shape()),
            ));
        }
        if hidden != self.hidden_size() {
            return Err(Error::shape_mismatch(
                "attention",
                format!(
                    "hidden size {} != {} heads x {}",
                    hidden, self.num_heads, self.head_dim
                ),
            ));
        }

        if let Some(cache) = cache {
            if let Some(cached) = cache.entry_dims() {
                if cached != (batch, hidden) {
                    return Err(Error::shape_mismatch(
                        "attention",
                        format!(
                            "cache holds [{}, {}] entries, step is [{}, {}]",
                            cached.0, cached.1, batch, hidden
                        ),
                    ));
                }
            }
            cache.ensure_room(seq)?;
        }

        Ok(Dims { batch, seq, hidden })
    }

    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cache: Option<&LayerCache>,
        scores: &mut [f32],
        dims: Dims,
    ) -> Result<Tensor> {
        let Dims { batch, seq, hidden } = dims;
        let hd = self.head_dim;

        let (cached_keys, cached_values) = match cache {
            Some(cache) => (
                cache
                    .keys()
                    .iter()
                    .map(|t| t.as_slice::<f32>())
                    .collect::<Result<Vec<_>>>()?,
                cache
                    .values()
                    .iter()
                    .map(|t| t.as_slice::<f32>())
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => (Vec::new(), Vec::new()),
        };
        let past = cached_keys.len();

        let qd = q.as_slice::<f32>()?;
        let kd = k.as_slice::<f32>()?;
        let vd = v.as_slice::<f32>()?;
        let mut out = Tensor::new(&[batch, seq, hidden], DType::F32)?;
        let od = out.as_mut_slice::<f32>()?;

        for b in 0..batch {
            for head in 0..self.num_heads {
                let off = head * hd;
                for s in 0..seq {
                    let visible = past + s + 1;
                    let base = (b * seq + s) * hidden + off;
                    let query = &qd[base..base + hd];

                    let row = &mut scores[..visible];
                    for (t, score) in row.iter_mut().enumerate() {
                        let key = head_row(&cached_keys, kd, t, b, seq, hidden, off, hd);
                        *score = dot(query, key) * self.scale;
                    }
                    softmax(row);

                    let dst = &mut od[base..base + hd];
                    for (t, &weight) in row.iter().enumerate() {
                        let value = head_row(&cached_values, vd, t, b, seq, hidden, off, hd);
                        axpy(weight, value, dst);
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Head slice of position `t` for batch `b`. Positions below
/// `cached.len()` come from the cache, the rest from the step tensor.
#[allow(clippy::too_many_arguments)]
#[inline]
fn head_row<'a>(
    cached: &[&'a [f32]],
    step: &'a [f32],
    t: usize,
    b: usize,
    seq: usize,
    hidden: usize,
    off: usize,
    hd: usize,
) -> &'a [f32] {
    let past = cached.len();
    if t < past {
        let base = b * hidden + off;
        &cached[t][base..base + hd]
    } else {
        let base = (b * seq + t - past) * hidden + off;
        &step[base..base + hd]
    }
}

/// Store the step's keys and values, one `[batch, hidden]` entry per position
fn append_step(cache: &mut LayerCache, k: &Tensor, v: &Tensor, dims: Dims) -> Result<()> {
    let Dims { batch, seq, hidden } = dims;
    let kd = k.as_slice::<f32>()?;
    let vd = v.as_slice::<f32>()?;

    let mut key = vec![0.0f32; batch * hidden];
    let mut value = vec![0.0f32; batch * hidden];
    for s in 0..seq {
        for b in 0..batch {
            let src = (b * seq + s) * hidden;
            key[b * hidden..(b + 1) * hidden].copy_from_slice(&kd[src..src + hidden]);
            value[b * hidden..(b + 1) * hidden].copy_from_slice(&vd[src..src + hidden]);
        }
        cache.append(
            Tensor::from_f32(&[batch, hidden], &key)?,
            Tensor::from_f32(&[batch, hidden], &value)?,
        )?;
    }
    log::debug!("kv cache append: {} positions, length {}", seq, cache.len());
    Ok(())
}
