//! Search-driver facade.

use latentkv_engine::{LatentEncoder, Positions, SequenceModel};

use crate::engine::{CacheEngine, EnvState, InferenceOutput};
use crate::error::CacheResult;
use crate::stats::CacheStats;

/// What a tree search talks to: encodes observations, then runs the cache
/// engine.
pub struct SearchSession<M, E> {
    engine: CacheEngine<M>,
    encoder: E,
}

impl<M: SequenceModel, E: LatentEncoder> SearchSession<M, E> {
    pub fn new(engine: CacheEngine<M>, encoder: E) -> Self {
        Self { engine, encoder }
    }

    /// Evaluate search roots from raw observations.
    ///
    /// `last_observations` are the observations the previous roots were built
    /// from (the current ones on the first step); `actions` were taken from
    /// them, all `None` on the first step.
    pub fn initial_inference(
        &mut self,
        last_observations: &[E::Observation],
        actions: &[Option<usize>],
        current_observations: Option<&[E::Observation]>,
        start: &Positions,
    ) -> CacheResult<InferenceOutput> {
        let last = self.encoder.encode_batch(last_observations)?;
        let current = current_observations
            .map(|obs| self.encoder.encode_batch(obs))
            .transpose()?;
        self.engine
            .initial_inference(&last, actions, current.as_deref(), start)
    }

    pub fn recurrent_inference(
        &mut self,
        latents: &[Vec<f32>],
        actions: &[usize],
        start: &Positions,
    ) -> CacheResult<InferenceOutput> {
        self.engine.recurrent_inference(latents, actions, start)
    }

    pub fn clear_caches(&mut self) {
        self.engine.clear_caches();
    }

    pub fn reset_env(&mut self, env: usize) -> CacheResult<()> {
        self.engine.reset_env(env)
    }

    pub fn stats(&self) -> &CacheStats {
        self.engine.stats()
    }

    pub fn env_state(&self, env: usize) -> CacheResult<EnvState> {
        self.engine.env_state(env)
    }

    pub fn engine(&self) -> &CacheEngine<M> {
        &self.engine
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }
}
