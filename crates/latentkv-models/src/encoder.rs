//! Reference observation encoder.

use latentkv_engine::{EngineError, LatentEncoder, Result};

use crate::ops::matvec;
use crate::rng::XorShift64;

/// Fixed random projection followed by `tanh`.
///
/// Observations are flat `f32` vectors of length `obs_dim`.
#[derive(Debug, Clone)]
pub struct ProjectionEncoder {
    obs_dim: usize,
    latent_dim: usize,
    // [obs_dim, latent_dim]
    weights: Vec<f32>,
}

impl ProjectionEncoder {
    pub fn new(obs_dim: usize, latent_dim: usize, seed: u64) -> Self {
        let mut rng = XorShift64::new(seed);
        let scale = 1.0 / (obs_dim.max(1) as f32).sqrt();
        Self {
            obs_dim,
            latent_dim,
            weights: rng.fill(obs_dim * latent_dim, scale),
        }
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }
}

impl LatentEncoder for ProjectionEncoder {
    type Observation = Vec<f32>;

    fn encode(&self, observation: &Vec<f32>) -> Result<Vec<f32>> {
        if observation.len() != self.obs_dim {
            return Err(EngineError::InvalidInput(format!(
                "observation of length {} for obs_dim {}",
                observation.len(),
                self.obs_dim
            )));
        }
        Ok(matvec(observation, &self.weights, self.obs_dim, self.latent_dim)
            .into_iter()
            .map(f32::tanh)
            .collect())
    }
}
