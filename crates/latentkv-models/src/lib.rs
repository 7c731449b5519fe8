//! # latentkv-models
//!
//! Deterministic reference implementations of the model-side traits.
//!
//! Provides:
//! - **TinyWorldModel**: multi-layer attention world model over latent and
//!   action tokens, absolute or rotary positions
//! - **ProjectionEncoder**: fixed random projection from observations to latents
//! - **XorShift64**: seeded generator used for weights and simulated workloads
//!
//! These are fixtures for exercising the cache engine end to end, not
//! trained networks.

mod encoder;
pub mod ops;
mod rng;
mod world;

pub use encoder::ProjectionEncoder;
pub use rng::XorShift64;
pub use world::{TinyWorldModel, TinyWorldModelConfig};

use latentkv_engine::EngineError;

/// Errors from model construction.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        EngineError::InvalidInput(err.to_string())
    }
}
