//! Memoized inference over pooled contexts.

use std::fmt;
use std::sync::Arc;

use latentkv_engine::{ForwardInput, ModelGeometry, Positions, SequenceModel};
use latentkv_kv::ContextCache;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::align::{AlignmentEngine, WINDOW_KEEP_FROM};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::hash::{hash_state, StateHash};
use crate::index::{SlotRef, StateHashIndex};
use crate::pool::{Pool, PoolClass};
use crate::posdelta::PositionalDeltaTable;
use crate::stats::CacheStats;
use crate::telemetry::{LookupOutcome, NoopTelemetry, StepKind, StepTimer, TelemetryHook};

/// Cache lifecycle of one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvState {
    /// No root context recorded for the current episode.
    Uninitialized,
    /// The last step stored a root context.
    RootCached,
    /// The last step stored a simulation context.
    InternalCached,
}

impl fmt::Display for EnvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvState::Uninitialized => write!(f, "uninitialized"),
            EnvState::RootCached => write!(f, "root_cached"),
            EnvState::InternalCached => write!(f, "internal_cached"),
        }
    }
}

/// Predictions returned to the search driver, one row per environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceOutput {
    /// Latent state of the node being expanded.
    pub latents: Vec<Vec<f32>>,
    pub reward_logits: Vec<Vec<f32>>,
    pub policy_logits: Vec<Vec<f32>>,
    pub value_logits: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateMode {
    /// Store under the next latent in the shared recurrent pool, trimming
    /// the front padding.
    Internal,
    /// Store under the current latent in the environment's init pool.
    Root,
}

/// Owns every pool and index and runs the model through them.
///
/// One engine serves `env_count` environments; batch item `i` of every call is
/// environment `i`. Methods take `&mut self`, so a step runs to completion
/// before the next can start.
pub struct CacheEngine<M> {
    id: Uuid,
    model: M,
    config: CacheConfig,
    geometry: ModelGeometry,
    align: AlignmentEngine,
    init_pools: Vec<Pool>,
    init_indices: Vec<StateHashIndex>,
    recur_pool: Pool,
    recur_index: StateHashIndex,
    staging: Pool,
    working: ContextCache,
    scratch: ContextCache,
    env_states: Vec<EnvState>,
    stats: CacheStats,
    telemetry: Arc<dyn TelemetryHook>,
}

impl<M: SequenceModel> CacheEngine<M> {
    pub fn new(model: M, config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let geometry = model.geometry();
        let context_length = config.context_length.unwrap_or(geometry.max_tokens);
        if context_length > geometry.max_tokens {
            return Err(CacheError::InvalidConfig(format!(
                "context_length {context_length} exceeds the model window of {}",
                geometry.max_tokens
            )));
        }

        let deltas = if context_length > WINDOW_KEEP_FROM {
            PositionalDeltaTable::build(&model, WINDOW_KEEP_FROM, context_length - 1)?
        } else {
            None
        };
        let align = AlignmentEngine::new(context_length, deltas);

        let init_pools = (0..config.env_count)
            .map(|_| Pool::new(PoolClass::Init, config.init_pool_size))
            .collect::<CacheResult<Vec<_>>>()?;
        let recur_pool = Pool::new(PoolClass::Recurrent, config.recurrent_pool_size())?;
        let staging = Pool::new(PoolClass::Staging, config.env_count)?;
        let working = model.generate_empty_context(config.env_count, geometry.max_tokens);
        let scratch = model.generate_empty_context(1, geometry.max_tokens);

        let id = Uuid::new_v4();
        info!(
            engine = %id,
            env_count = config.env_count,
            recurrent_slots = recur_pool.capacity(),
            init_slots = config.init_pool_size,
            context_length,
            position_correction = align.corrects_positions(),
            device = %working.device(),
            "cache engine ready"
        );

        Ok(Self {
            id,
            init_indices: vec![StateHashIndex::new(); config.env_count],
            env_states: vec![EnvState::Uninitialized; config.env_count],
            model,
            geometry,
            align,
            init_pools,
            recur_pool,
            recur_index: StateHashIndex::new(),
            staging,
            working,
            scratch,
            stats: CacheStats::default(),
            telemetry: Arc::new(NoopTelemetry),
            config,
        })
    }

    /// Route lookup, store and step events to `hook`.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn geometry(&self) -> &ModelGeometry {
        &self.geometry
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn context_length(&self) -> usize {
        self.align.context_length()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn env_state(&self, env: usize) -> CacheResult<EnvState> {
        self.check_env(env)?;
        Ok(self.env_states[env])
    }

    pub fn recurrent_entries(&self) -> usize {
        self.recur_index.len()
    }

    pub fn root_entries(&self, env: usize) -> CacheResult<usize> {
        self.check_env(env)?;
        Ok(self.init_indices[env].len())
    }

    /// The root context recorded for `latent` in `env`'s init index, if any.
    pub fn root_context(&self, env: usize, latent: &[f32]) -> CacheResult<Option<&ContextCache>> {
        self.check_env(env)?;
        match self.init_indices[env].get(hash_state(latent)) {
            Some(entry) => self.init_pools[env].load(entry.slot).map(Some),
            None => Ok(None),
        }
    }

    /// Bytes held by every pool plus the working buffers.
    pub fn memory_bytes(&self) -> usize {
        self.init_pools.iter().map(Pool::memory_bytes).sum::<usize>()
            + self.recur_pool.memory_bytes()
            + self.staging.memory_bytes()
            + self.working.memory_bytes()
            + self.scratch.memory_bytes()
    }

    /// Evaluate the roots of a new search.
    ///
    /// `last_latents` are the environments' previous root latents and
    /// `actions` the actions taken from them; all `None` marks the first step
    /// of an episode. With `current_latents` absent the batch is evaluated
    /// from an empty context and no pool is written. The recurrent index is
    /// cleared afterwards since a new search begins.
    pub fn initial_inference(
        &mut self,
        last_latents: &[Vec<f32>],
        actions: &[Option<usize>],
        current_latents: Option<&[Vec<f32>]>,
        start: &Positions,
    ) -> CacheResult<InferenceOutput> {
        let width = last_latents.len();
        self.check_width(width, start)?;
        if actions.len() != width {
            return Err(CacheError::InvalidRequest(format!(
                "{} actions for {width} environments",
                actions.len()
            )));
        }

        let Some(current) = current_latents else {
            debug!(width, "uncached root evaluation");
            let mut ctx = self.model.generate_empty_context(width, self.geometry.max_tokens);
            let out = self
                .model
                .forward(ForwardInput::Latents(last_latents), &mut ctx, None, start)?;
            self.recur_index.clear();
            return Ok(InferenceOutput {
                latents: last_latents.to_vec(),
                reward_logits: out.reward_logits,
                policy_logits: out.policy_logits,
                value_logits: out.value_logits,
            });
        };
        if current.len() != width {
            return Err(CacheError::InvalidRequest(format!(
                "{} current latents for {width} environments",
                current.len()
            )));
        }

        let mut timer = StepTimer::new(
            StepKind::Initial,
            self.working.device(),
            width,
            Arc::clone(&self.telemetry),
        );
        self.resize_working(width);

        let out = if actions.iter().all(Option::is_none) {
            debug!(width, "first step of episode");
            self.working.reset();
            let out = self
                .model
                .forward(ForwardInput::Latents(current), &mut self.working, None, start)?;
            let sizes = vec![self.working.size(); width];
            self.update_cache_context(UpdateMode::Root, current, &sizes)?;
            out
        } else {
            let taken = actions
                .iter()
                .map(|a| {
                    a.ok_or_else(|| {
                        CacheError::InvalidRequest(
                            "continuing step needs an action for every environment".into(),
                        )
                    })
                })
                .collect::<CacheResult<Vec<usize>>>()?;

            let mut staged = Vec::with_capacity(width);
            for (env, latent) in last_latents.iter().enumerate() {
                let (slot, outcome) = self.stage_context(StepKind::Initial, env, latent, start)?;
                timer.record(env, outcome);
                staged.push(slot);
            }
            let mut sizes = self.assemble(&staged)?;

            self.model.forward(
                ForwardInput::Actions(&taken),
                &mut self.working,
                Some(sizes.as_slice()),
                start,
            )?;
            sizes.iter_mut().for_each(|s| *s += 1);
            let out = self.model.forward(
                ForwardInput::Latents(current),
                &mut self.working,
                Some(sizes.as_slice()),
                start,
            )?;
            sizes.iter_mut().for_each(|s| *s += 1);

            self.update_cache_context(UpdateMode::Root, current, &sizes)?;
            out
        };

        self.recur_index.clear();
        trace!("recurrent index cleared for new search");
        timer.finish();

        Ok(InferenceOutput {
            latents: current.to_vec(),
            reward_logits: out.reward_logits,
            policy_logits: out.policy_logits,
            value_logits: out.value_logits,
        })
    }

    /// Expand one simulation step per environment: apply `actions` to
    /// `latents` and predict the resulting states.
    pub fn recurrent_inference(
        &mut self,
        latents: &[Vec<f32>],
        actions: &[usize],
        start: &Positions,
    ) -> CacheResult<InferenceOutput> {
        let width = latents.len();
        self.check_width(width, start)?;
        if actions.len() != width {
            return Err(CacheError::InvalidRequest(format!(
                "{} actions for {width} environments",
                actions.len()
            )));
        }

        let mut timer = StepTimer::new(
            StepKind::Recurrent,
            self.working.device(),
            width,
            Arc::clone(&self.telemetry),
        );
        self.resize_working(width);

        let mut staged = Vec::with_capacity(width);
        for (env, latent) in latents.iter().enumerate() {
            let (slot, outcome) = self.stage_context(StepKind::Recurrent, env, latent, start)?;
            timer.record(env, outcome);
            staged.push(slot);
        }
        let mut sizes = self.assemble(&staged)?;

        let transition = self.model.forward(
            ForwardInput::Actions(actions),
            &mut self.working,
            Some(sizes.as_slice()),
            start,
        )?;
        sizes.iter_mut().for_each(|s| *s += 1);
        let next_latents = transition.next_latents;
        let prediction = self.model.forward(
            ForwardInput::Latents(&next_latents),
            &mut self.working,
            Some(sizes.as_slice()),
            start,
        )?;
        sizes.iter_mut().for_each(|s| *s += 1);

        self.update_cache_context(UpdateMode::Internal, &next_latents, &sizes)?;
        timer.finish();

        Ok(InferenceOutput {
            latents: next_latents,
            reward_logits: transition.reward_logits,
            policy_logits: prediction.policy_logits,
            value_logits: prediction.value_logits,
        })
    }

    /// Drop every root and recurrent index entry. Pool contents stay
    /// allocated and are overwritten as new contexts arrive.
    pub fn clear_caches(&mut self) {
        for index in &mut self.init_indices {
            index.clear();
        }
        self.recur_index.clear();
        self.env_states.fill(EnvState::Uninitialized);
        info!(engine = %self.id, "cleared all cache indices");
    }

    /// Forget the root contexts of `env` at the end of its episode.
    pub fn reset_env(&mut self, env: usize) -> CacheResult<()> {
        self.check_env(env)?;
        self.init_indices[env].clear();
        self.env_states[env] = EnvState::Uninitialized;
        debug!(env, "environment reset");
        Ok(())
    }

    fn check_env(&self, env: usize) -> CacheResult<()> {
        if env >= self.config.env_count {
            return Err(CacheError::EnvOutOfRange {
                env,
                env_count: self.config.env_count,
            });
        }
        Ok(())
    }

    fn check_width(&self, width: usize, start: &Positions) -> CacheResult<()> {
        if width == 0 {
            return Err(CacheError::InvalidRequest("empty batch".into()));
        }
        if !start.fits(width) {
            return Err(CacheError::InvalidRequest(format!(
                "{} start positions for {width} environments",
                start.len()
            )));
        }
        if width > self.config.env_count {
            return Err(CacheError::EnvOutOfRange {
                env: width - 1,
                env_count: self.config.env_count,
            });
        }
        Ok(())
    }

    fn resize_working(&mut self, width: usize) {
        if self.working.batch_width() != width {
            trace!(from = self.working.batch_width(), to = width, "reallocating working context");
            self.working = self.model.generate_empty_context(width, self.geometry.max_tokens);
        }
    }

    /// Find the slot recorded for `hash` in `index`, honoring the stale check.
    fn resolve(&mut self, class: PoolClass, env: usize, hash: StateHash) -> Option<SlotRef> {
        let (index, pool) = match class {
            PoolClass::Init => (&self.init_indices[env], &self.init_pools[env]),
            PoolClass::Recurrent => (&self.recur_index, &self.recur_pool),
            PoolClass::Staging => return None,
        };
        let slot = index.get(hash)?;
        if self.config.detect_stale_hits && !pool.is_current(slot) {
            warn!(env, %hash, pool = %class, slot = slot.slot, "rejecting entry for reused slot");
            self.stats.stale_rejections += 1;
            return None;
        }
        Some(slot)
    }

    /// Copy the context memoized for `latent` into staging, or build a fresh
    /// one from an empty context on a miss. Returns the staging slot.
    fn stage_context(
        &mut self,
        kind: StepKind,
        env: usize,
        latent: &Vec<f32>,
        start: &Positions,
    ) -> CacheResult<(SlotRef, LookupOutcome)> {
        let hash = hash_state(latent);
        let rejections = self.stats.stale_rejections;

        let found = match kind {
            StepKind::Initial => {
                self.stats.root_queries += 1;
                self.resolve(PoolClass::Init, env, hash)
                    .map(|slot| (PoolClass::Init, slot))
            }
            StepKind::Recurrent => {
                self.stats.total_queries += 1;
                if self.config.reanalyze {
                    return self.generate(env, latent, start, hash);
                }
                self.resolve(PoolClass::Init, env, hash)
                    .map(|slot| (PoolClass::Init, slot))
                    .or_else(|| {
                        self.resolve(PoolClass::Recurrent, env, hash)
                            .map(|slot| (PoolClass::Recurrent, slot))
                    })
            }
        };

        let (staged, outcome) = match found {
            Some((class, slot)) => {
                let src = match class {
                    PoolClass::Init => self.init_pools[env].load(slot.slot)?,
                    _ => self.recur_pool.load(slot.slot)?,
                };
                let size = src.size();
                let staged = self.staging.store(src)?;
                match kind {
                    StepKind::Initial => self.stats.root_hits += 1,
                    StepKind::Recurrent => self.stats.hits += 1,
                }
                debug!(env, %hash, pool = %class, slot = slot.slot, size, "context hit");
                let outcome = match class {
                    PoolClass::Init => LookupOutcome::InitHit,
                    _ => LookupOutcome::RecurrentHit,
                };
                (staged, outcome)
            }
            None => {
                let (staged, miss) = self.generate(env, latent, start, hash)?;
                let outcome = if self.stats.stale_rejections > rejections {
                    LookupOutcome::StaleMiss
                } else {
                    miss
                };
                (staged, outcome)
            }
        };

        Ok((staged, outcome))
    }

    /// Run `latent` through the model from an empty context and stage the result.
    fn generate(
        &mut self,
        env: usize,
        latent: &Vec<f32>,
        start: &Positions,
        hash: StateHash,
    ) -> CacheResult<(SlotRef, LookupOutcome)> {
        self.scratch.reset();
        self.model.forward(
            ForwardInput::Latents(std::slice::from_ref(latent)),
            &mut self.scratch,
            None,
            &start.select(&[env]),
        )?;
        let staged = self.staging.store(&self.scratch)?;
        debug!(env, %hash, reanalyze = self.config.reanalyze, "context miss");
        Ok((staged, LookupOutcome::Miss))
    }

    /// Trim-and-pad the staged contexts into the working batch.
    fn assemble(&mut self, staged: &[SlotRef]) -> CacheResult<Vec<usize>> {
        let sources = staged
            .iter()
            .map(|slot| self.staging.load(slot.slot))
            .collect::<CacheResult<Vec<_>>>()?;
        self.align.trim_and_pad(&sources, &mut self.working)
    }

    /// Store each environment's row of the working batch for later reuse.
    fn update_cache_context(
        &mut self,
        mode: UpdateMode,
        latents: &[Vec<f32>],
        sizes: &[usize],
    ) -> CacheResult<()> {
        if self.align.context_length() <= WINDOW_KEEP_FROM {
            trace!("context window too short to cache");
            return Ok(());
        }

        let batch_size = self.working.size();
        let max_size = sizes.iter().copied().max().unwrap_or(0);
        for (env, latent) in latents.iter().enumerate() {
            let (trim, size) = match mode {
                UpdateMode::Internal => (max_size - sizes[env], sizes[env]),
                UpdateMode::Root => (0, batch_size),
            };
            let shrunk = self
                .align
                .extract(&self.working, env, trim, size, &mut self.scratch)?;
            if shrunk {
                self.stats.window_shrinks += 1;
                self.telemetry.on_window_shrink(env);
                debug!(env, size = self.scratch.size(), "context window shrunk");
            }

            let hash = hash_state(latent);
            let (class, slot) = match mode {
                UpdateMode::Internal => {
                    let slot = self.recur_pool.store(&self.scratch)?;
                    self.recur_index.insert(hash, slot);
                    self.env_states[env] = EnvState::InternalCached;
                    (PoolClass::Recurrent, slot)
                }
                UpdateMode::Root => {
                    let slot = self.init_pools[env].store(&self.scratch)?;
                    self.init_indices[env].insert(hash, slot);
                    self.env_states[env] = EnvState::RootCached;
                    (PoolClass::Init, slot)
                }
            };
            self.stats.stores += 1;
            self.telemetry.on_store(class, slot);
            debug!(
                env,
                %hash,
                pool = %class,
                slot = slot.slot,
                size = self.scratch.size(),
                "context stored"
            );
        }
        Ok(())
    }
}
