//! One generation session: arena, key/value cache, kernel and attention
//! geometry bundled together.
//!
//! A session is not `Sync`-shared; a batching layer creates one per worker.

use engine_config::EngineConfig;

use crate::arena::{Arena, ArenaHandle, ArenaStats};
use crate::attention::CausalAttention;
use crate::error::Result;
use crate::kernels::{self, KernelProvider};
use crate::kv_cache::KvCache;
use crate::linear::Linear;
use crate::tensor::Tensor;

pub struct Session {
    arena: Arena,
    cache: KvCache,
    kernel: &'static dyn KernelProvider,
    attention: CausalAttention,
    /// Attention score buffer sized for a full cache, reissued after an
    /// arena reset
    scores: Option<ArenaHandle>,
    max_positions: usize,
}

impl Session {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let kernel = kernels::select_kernel(config.kernels.preference);
        let session = Self {
            arena: Arena::new(config.arena.initial_bytes)?,
            cache: KvCache::from_config(&config.cache),
            kernel,
            attention: CausalAttention::from_config(&config.attention)?,
            scores: None,
            max_positions: config.cache.capacity,
        };
        log::info!(
            "session: kernel {}, {} heads x {}, {} layers, cache capacity {}",
            kernel.name(),
            session.attention.num_heads(),
            session.attention.head_dim(),
            config.cache.num_layers,
            config.cache.capacity
        );
        Ok(session)
    }

    pub fn kernel(&self) -> &'static dyn KernelProvider {
        self.kernel
    }

    pub fn attention(&self) -> &CausalAttention {
        &self.attention
    }

    pub fn arena(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// Cached positions so far
    pub fn position(&self) -> usize {
        self.cache.current_len()
    }

    /// Causal attention for `layer` against the session cache.
    ///
    /// Scores go to one arena buffer of cache capacity shared by every layer
    /// and step, so a decode loop does not grow the arena.
    pub fn attend(&mut self, layer: usize, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let cache = self.cache.layer_mut(layer)?;
        let handle = match self.scores {
            Some(handle) if handle.generation() == self.arena.generation() => handle,
            _ => {
                let handle = self.arena.allocate_for::<f32>(self.max_positions)?;
                self.scores = Some(handle);
                handle
            }
        };
        let scores = self.arena.slice_mut::<f32>(&handle)?;
        self.attention.forward_with_scores(scores, q, k, v, Some(cache))
    }

    pub fn linear(&self, layer: &Linear, input: &Tensor) -> Result<Tensor> {
        layer.forward_with(self.kernel, input)
    }

    /// Prepare for an independent generation run: scratch is recycled and
    /// the cache emptied. Reserved arena memory is kept.
    pub fn reset(&mut self) {
        self.arena.reset();
        self.scores = None;
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::linear::Weight;
    use engine_config::KernelPreference;

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.arena.initial_bytes = 512;
        config.attention.num_heads = 2;
        config.attention.head_dim = 2;
        config.cache.num_layers = 2;
        config.cache.capacity = 4;
        config
    }

    #[test]
    fn test_attend_grows_cache_per_layer() {
        let mut session = Session::new(&small_config()).unwrap();
        let x = Tensor::from_f32(&[1, 1, 4], &[0.1, 0.2, 0.3, 0.4]).unwrap();

        let out = session.attend(0, &x, &x, &x).unwrap();
        // a single position attends only to itself
        assert_eq!(out.as_slice::<f32>().unwrap(), x.as_slice::<f32>().unwrap());
        assert_eq!(session.position(), 1);
        assert_eq!(session.cache().layer(1).unwrap().len(), 0);

        session.attend(1, &x, &x, &x).unwrap();
        assert_eq!(session.cache().layer(1).unwrap().len(), 1);
        assert!(session.arena_stats().used_bytes > 0);

        assert!(matches!(
            session.attend(2, &x, &x, &x),
            Err(Error::LayerOutOfRange { layer: 2, layers: 2 })
        ));
    }

    #[test]
    fn test_reset_clears_cache_and_scratch() {
        let mut session = Session::new(&small_config()).unwrap();
        let x = Tensor::from_f32(&[1, 2, 4], &[0.0; 8]).unwrap();
        session.attend(0, &x, &x, &x).unwrap();
        let generation = session.arena_stats().generation;

        session.reset();
        assert_eq!(session.position(), 0);
        let stats = session.arena_stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.generation, generation + 1);
    }

    #[test]
    fn test_cache_capacity_from_config() {
        let mut session = Session::new(&small_config()).unwrap();
        let x = Tensor::from_f32(&[1, 3, 4], &[0.0; 12]).unwrap();
        session.attend(0, &x, &x, &x).unwrap();
        assert!(matches!(session.attend(0, &x, &x, &x), Err(Error::CacheFull { .. })));
        assert_eq!(session.position(), 3);
    }

    #[test]
    fn test_linear_uses_session_kernel() {
        let mut config = small_config();
        config.kernels.preference = KernelPreference::Scalar;
        let session = Session::new(&config).unwrap();
        assert_eq!(session.kernel().name(), "scalar");

        let w = Tensor::from_f32(&[2, 1], &[2.0, 3.0]).unwrap();
        let layer = Linear::new("p", Weight::Dense(w), None).unwrap();
        let y = session
            .linear(&layer, &Tensor::from_f32(&[2], &[1.0, 1.0]).unwrap())
            .unwrap();
        assert_eq!(y.as_slice::<f32>().unwrap(), &[5.0]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = small_config();
        config.cache.capacity = 0;
        assert!(matches!(Session::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_decode_loop_reuses_score_buffer() {
        let mut config = small_config();
        config.arena.initial_bytes = 4096;
        config.cache.num_layers = 4;
        config.cache.capacity = 512;
        let mut session = Session::new(&config).unwrap();

        let mut data = [0.0f32; 4];
        let mut after_first = None;
        for step in 0..512 {
            crate::ops::fill_uniform(&mut data, step as u64 + 1);
            let x = Tensor::from_f32(&[1, 1, 4], &data).unwrap();
            for layer in 0..4 {
                session.attend(layer, &x, &x, &x).unwrap();
            }
            let stats = session.arena_stats();
            match after_first {
                None => after_first = Some(stats),
                Some(first) => {
                    assert_eq!(stats.reserved_bytes, first.reserved_bytes, "step {}", step);
                    assert_eq!(stats.growth_events, first.growth_events, "step {}", step);
                    assert_eq!(stats.used_bytes, first.used_bytes, "step {}", step);
                }
            }
        }
        assert_eq!(session.position(), 512);
        assert_eq!(session.arena_stats().used_bytes, 512 * 4);
    }

    #[test]
    fn test_score_buffer_reissued_after_arena_reset() {
        let mut session = Session::new(&small_config()).unwrap();
        let x = Tensor::from_f32(&[1, 1, 4], &[0.5; 4]).unwrap();
        session.attend(0, &x, &x, &x).unwrap();

        // resetting the arena directly invalidates the held buffer
        session.arena().reset();
        session.attend(0, &x, &x, &x).unwrap();
        assert_eq!(session.position(), 2);

        session.reset();
        session.attend(0, &x, &x, &x).unwrap();
        assert_eq!(session.position(), 1);
        // four scores round up to one aligned line
        assert_eq!(session.arena_stats().used_bytes, 32);
    }
}
