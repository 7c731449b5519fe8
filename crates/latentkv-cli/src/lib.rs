//! # latentkv-cli
//!
//! Simulated tree search over parallel environments, driving the cache engine
//! the way a search driver would.
//!
//! Each episode step evaluates the roots, expands `simulations` random
//! (node, action) pairs per environment, then takes one action and moves to a
//! fresh observation. Re-expanding a node that was already evaluated is what
//! produces cache hits.

use std::path::PathBuf;

use latentkv_cache::{
    CacheConfig, CacheEngine, CacheError, CacheStats, EnvState, SearchSession,
};
use latentkv_engine::{PositionEncoding, Positions};
use latentkv_models::{
    ModelError, ProjectionEncoder, TinyWorldModel, TinyWorldModelConfig, XorShift64,
};
use serde::Serialize;
use tracing::{debug, info};

/// Errors from the simulation driver.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
}

/// Observation width fed to the encoder.
const OBS_DIM: usize = 8;

/// Knobs for one simulation run. `None` fields fall back to the config file,
/// then to defaults.
#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    pub envs: Option<usize>,
    pub simulations: Option<usize>,
    pub context_length: Option<usize>,
    pub episodes: usize,
    pub steps: usize,
    pub seed: u64,
    pub rotary: bool,
    pub config: Option<PathBuf>,
}

/// JSON summary printed by `latentkv simulate`.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub envs: usize,
    pub simulations: usize,
    pub episodes: usize,
    pub steps: usize,
    pub context_length: usize,
    pub positions: PositionEncoding,
    pub stats: CacheStats,
    pub hit_rate: f64,
    pub root_hit_rate: f64,
    pub recurrent_entries: usize,
    pub memory_bytes: usize,
    pub final_states: Vec<EnvState>,
}

impl SimulationOptions {
    fn cache_config(&self) -> Result<CacheConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_json_file(path)?,
            None => CacheConfig::new().with_env_count(2).with_num_simulations(8),
        };
        if let Some(envs) = self.envs {
            config = config.with_env_count(envs);
        }
        if let Some(simulations) = self.simulations {
            config = config.with_num_simulations(simulations);
        }
        if let Some(length) = self.context_length {
            config = config.with_context_length(length);
        }
        config.validate()?;
        Ok(config)
    }
}

fn observations(rng: &mut XorShift64, n: usize) -> Vec<Vec<f32>> {
    (0..n).map(|_| rng.fill(OBS_DIM, 1.0)).collect()
}

/// Run the simulated search and collect cache statistics.
pub fn simulate(opts: &SimulationOptions) -> Result<SimulationReport, CliError> {
    if opts.episodes == 0 || opts.steps == 0 {
        return Err(CliError::InvalidArgs(
            "episodes and steps must be at least 1".into(),
        ));
    }
    let config = opts.cache_config()?;
    let (envs, simulations) = (config.env_count, config.num_simulations);

    let positions = if opts.rotary {
        PositionEncoding::Rotary { theta: 10_000.0 }
    } else {
        PositionEncoding::Absolute
    };
    let model_config = TinyWorldModelConfig::default()
        .with_positions(positions)
        .with_seed(opts.seed.wrapping_add(1));
    let model = TinyWorldModel::new(model_config.clone())?;
    let encoder = ProjectionEncoder::new(
        OBS_DIM,
        model_config.latent_dim,
        opts.seed.wrapping_add(2),
    );
    let engine = CacheEngine::new(model, config)?;
    let context_length = engine.context_length();
    info!(engine = %engine.id(), envs, simulations, "starting simulation");

    let mut session = SearchSession::new(engine, encoder);
    let mut rng = XorShift64::new(opts.seed);
    let actions = model_config.action_space;

    for episode in 0..opts.episodes {
        let mut last_obs = observations(&mut rng, envs);
        let mut taken: Vec<Option<usize>> = vec![None; envs];
        let mut current_obs = last_obs.clone();

        for step in 0..opts.steps {
            let start = Positions::new(vec![step; envs]);
            let root = session.initial_inference(
                &last_obs,
                &taken,
                Some(current_obs.as_slice()),
                &start,
            )?;

            // Per-environment search tree, as the latents of expanded nodes.
            let mut trees: Vec<Vec<Vec<f32>>> =
                root.latents.iter().map(|z| vec![z.clone()]).collect();
            for _ in 0..simulations {
                let (latents, chosen): (Vec<Vec<f32>>, Vec<usize>) = trees
                    .iter()
                    .map(|tree| (tree[rng.below(tree.len())].clone(), rng.below(actions)))
                    .unzip();
                let child = session.recurrent_inference(&latents, &chosen, &start)?;
                for (tree, z) in trees.iter_mut().zip(child.latents) {
                    tree.push(z);
                }
            }

            taken = root
                .policy_logits
                .iter()
                .map(|logits| {
                    let best = logits
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .map_or(0, |(a, _)| a);
                    Some(best)
                })
                .collect();
            last_obs = std::mem::replace(&mut current_obs, observations(&mut rng, envs));
            debug!(episode, step, hits = session.stats().hits, "step complete");
        }

        for env in 0..envs {
            session.reset_env(env)?;
        }
    }

    let stats = session.stats().clone();
    let engine = session.engine();
    Ok(SimulationReport {
        envs,
        simulations,
        episodes: opts.episodes,
        steps: opts.steps,
        context_length,
        positions,
        hit_rate: stats.hit_rate(),
        root_hit_rate: stats.root_hit_rate(),
        recurrent_entries: engine.recurrent_entries(),
        memory_bytes: engine.memory_bytes(),
        final_states: (0..envs)
            .map(|env| engine.env_state(env))
            .collect::<Result<_, _>>()?,
        stats,
    })
}
