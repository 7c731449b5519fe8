//! Tiny deterministic world model.

use latentkv_engine::{
    EngineError, ForwardInput, ForwardOutput, ModelGeometry, PositionEncoding,
    PositionalProjection, Positions, Result, SequenceModel,
};
use latentkv_kv::{ContextCache, Device};
use serde::{Deserialize, Serialize};

use crate::ops::{matvec, rms_norm, softmax, Rope};
use crate::rng::XorShift64;
use crate::{ModelError, ModelResult};

/// Configuration for the reference world model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TinyWorldModelConfig {
    pub latent_dim: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub num_layers: usize,
    /// Context window in positions.
    pub max_tokens: usize,
    pub action_space: usize,
    /// Reward and value heads predict `2 * support_size + 1` logits.
    pub support_size: usize,
    pub positions: PositionEncoding,
    pub seed: u64,
    pub norm_eps: f32,
}

impl Default for TinyWorldModelConfig {
    fn default() -> Self {
        Self {
            latent_dim: 16,
            num_heads: 2,
            head_dim: 8,
            num_layers: 2,
            max_tokens: 10,
            action_space: 4,
            support_size: 5,
            positions: PositionEncoding::Absolute,
            seed: 12345,
            norm_eps: 1e-5,
        }
    }
}

impl TinyWorldModelConfig {
    pub fn d_model(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_positions(mut self, positions: PositionEncoding) -> Self {
        self.positions = positions;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_action_space(mut self, action_space: usize) -> Self {
        self.action_space = action_space;
        self
    }

    pub fn validate(&self) -> ModelResult<()> {
        if self.latent_dim == 0 || self.num_heads == 0 || self.head_dim == 0 {
            return Err(ModelError::InvalidConfig(
                "latent_dim, num_heads and head_dim must be non-zero".into(),
            ));
        }
        if self.num_layers == 0 {
            return Err(ModelError::InvalidConfig("num_layers must be non-zero".into()));
        }
        if self.max_tokens == 0 {
            return Err(ModelError::InvalidConfig("max_tokens must be non-zero".into()));
        }
        if self.action_space == 0 {
            return Err(ModelError::InvalidConfig("action_space must be non-zero".into()));
        }
        if self.positions.is_rotary() && self.head_dim % 2 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "rotary positions need an even head_dim, got {}",
                self.head_dim
            )));
        }
        Ok(())
    }
}

struct AttentionLayer {
    w_q: Vec<f32>,
    w_k: Vec<f32>,
    w_v: Vec<f32>,
    w_o: Vec<f32>,
}

/// Deterministic transformer world model over latent and action tokens.
///
/// Every attention layer reads the token embedding plus (for absolute
/// encodings) the positional embedding, and the layer outputs are summed into
/// the residual stream. A layer's cached keys and values therefore depend only
/// on the token and its position, which is what lets the cache engine renumber
/// positions with an additive correction.
pub struct TinyWorldModel {
    config: TinyWorldModelConfig,
    device: Device,
    // [latent_dim, d_model]
    latent_proj: Vec<f32>,
    // [action_space, d_model]
    action_emb: Vec<f32>,
    // [max_tokens, d_model]
    pos_emb: Vec<f32>,
    layers: Vec<AttentionLayer>,
    rope: Option<Rope>,
    // [d_model, latent_dim]
    w_obs: Vec<f32>,
    // [d_model, 2 * support_size + 1]
    w_reward: Vec<f32>,
    // [d_model, action_space]
    w_policy: Vec<f32>,
    // [d_model, 2 * support_size + 1]
    w_value: Vec<f32>,
}

impl TinyWorldModel {
    pub fn new(config: TinyWorldModelConfig) -> ModelResult<Self> {
        config.validate()?;
        let mut rng = XorShift64::new(config.seed);
        let d = config.d_model();
        let support = 2 * config.support_size + 1;
        let scale = 1.0 / (d as f32).sqrt();

        let latent_proj = rng.fill(config.latent_dim * d, scale);
        let action_emb = rng.fill(config.action_space * d, 0.5);
        let pos_emb = rng.fill(config.max_tokens * d, 0.5);
        let layers = (0..config.num_layers)
            .map(|_| AttentionLayer {
                w_q: rng.fill(d * d, scale),
                w_k: rng.fill(d * d, scale),
                w_v: rng.fill(d * d, scale),
                w_o: rng.fill(d * d, scale),
            })
            .collect();
        let rope = match config.positions {
            PositionEncoding::Rotary { theta } => Some(Rope::new(config.head_dim, theta)),
            PositionEncoding::Absolute => None,
        };

        Ok(Self {
            w_obs: rng.fill(d * config.latent_dim, scale),
            w_reward: rng.fill(d * support, scale),
            w_policy: rng.fill(d * config.action_space, scale),
            w_value: rng.fill(d * support, scale),
            latent_proj,
            action_emb,
            pos_emb,
            layers,
            rope,
            device: Device::default(),
            config,
        })
    }

    /// Tag contexts produced by this model with a device.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn config(&self) -> &TinyWorldModelConfig {
        &self.config
    }

    fn embed(&self, input: &ForwardInput<'_>, b: usize) -> Result<Vec<f32>> {
        let c = &self.config;
        let d = c.d_model();
        match input {
            ForwardInput::Latents(latents) => {
                let latent = &latents[b];
                if latent.len() != c.latent_dim {
                    return Err(EngineError::InvalidInput(format!(
                        "latent of length {} for latent_dim {}",
                        latent.len(),
                        c.latent_dim
                    )));
                }
                Ok(matvec(latent, &self.latent_proj, c.latent_dim, d))
            }
            ForwardInput::Actions(actions) => {
                let a = actions[b];
                if a >= c.action_space {
                    return Err(EngineError::InvalidInput(format!(
                        "action {a} outside action space {}",
                        c.action_space
                    )));
                }
                Ok(self.action_emb[a * d..(a + 1) * d].to_vec())
            }
        }
    }

    fn add_position(&self, x: &mut [f32], position: usize) -> Result<()> {
        let d = self.config.d_model();
        if position >= self.config.max_tokens {
            return Err(EngineError::InvalidInput(format!(
                "position {position} beyond max_tokens {}",
                self.config.max_tokens
            )));
        }
        for (xi, pi) in x.iter_mut().zip(&self.pos_emb[position * d..(position + 1) * d]) {
            *xi += pi;
        }
        Ok(())
    }

    /// Place one item's `[heads, head_dim]` row into a batch-major step buffer.
    fn scatter(dst: &mut [f32], src: &[f32], item: usize) {
        let n = src.len();
        dst[item * n..(item + 1) * n].copy_from_slice(src);
    }
}

impl SequenceModel for TinyWorldModel {
    fn geometry(&self) -> ModelGeometry {
        let c = &self.config;
        ModelGeometry {
            num_layers: c.num_layers,
            num_heads: c.num_heads,
            head_dim: c.head_dim,
            max_tokens: c.max_tokens,
            latent_dim: c.latent_dim,
            action_space: c.action_space,
            positions: c.positions,
        }
    }

    fn generate_empty_context(&self, batch_width: usize, max_length: usize) -> ContextCache {
        let mut shape = self.geometry().kv_shape(batch_width);
        shape.capacity = max_length;
        ContextCache::new(self.config.num_layers, shape, self.device)
    }

    fn forward(
        &self,
        input: ForwardInput<'_>,
        context: &mut ContextCache,
        valid_lengths: Option<&[usize]>,
        start: &Positions,
    ) -> Result<ForwardOutput> {
        let c = &self.config;
        let d = c.d_model();
        let width = context.batch_width();
        if input.width() != width {
            return Err(EngineError::InvalidInput(format!(
                "{} tokens for a batch of width {width}",
                input.width()
            )));
        }
        if !start.fits(width) {
            return Err(EngineError::InvalidInput(format!(
                "{} start positions for a batch of width {width}",
                start.len()
            )));
        }
        if let Some(lengths) = valid_lengths {
            if lengths.len() != width {
                return Err(EngineError::InvalidInput(format!(
                    "{} valid lengths for a batch of width {width}",
                    lengths.len()
                )));
            }
            if let Some(&bad) = lengths.iter().find(|&&l| l > context.size()) {
                return Err(EngineError::InvalidInput(format!(
                    "valid length {bad} exceeds context size {}",
                    context.size()
                )));
            }
        }
        context.ensure_room(1)?;

        let prior = context.size();
        let history: Vec<usize> = (0..width)
            .map(|b| valid_lengths.map_or(prior, |l| l[b]))
            .collect();

        // Per-item layer inputs, then Q/K/V for every layer.
        let mut inputs = Vec::with_capacity(width);
        let mut queries = vec![Vec::with_capacity(width); c.num_layers];
        let mut k_steps = vec![vec![0.0; width * d]; c.num_layers];
        let mut v_steps = vec![vec![0.0; width * d]; c.num_layers];
        for b in 0..width {
            let mut x = self.embed(&input, b)?;
            let position = history[b];
            if self.rope.is_none() {
                self.add_position(&mut x, position)?;
            }
            for (l, layer) in self.layers.iter().enumerate() {
                let mut q = matvec(&x, &layer.w_q, d, d);
                let mut k = matvec(&x, &layer.w_k, d, d);
                let v = matvec(&x, &layer.w_v, d, d);
                if let Some(rope) = &self.rope {
                    let absolute = start.at(b) + position;
                    rope.rotate(&mut q, c.num_heads, absolute);
                    rope.rotate(&mut k, c.num_heads, absolute);
                }
                Self::scatter(&mut k_steps[l], &k, b);
                Self::scatter(&mut v_steps[l], &v, b);
                queries[l].push(q);
            }
            inputs.push(x);
        }

        let k_refs: Vec<&[f32]> = k_steps.iter().map(Vec::as_slice).collect();
        let v_refs: Vec<&[f32]> = v_steps.iter().map(Vec::as_slice).collect();
        context.append_step(&k_refs, &v_refs)?;

        let size = context.size();
        let support = 2 * c.support_size + 1;
        let scale = 1.0 / (c.head_dim as f32).sqrt();
        let mut out = ForwardOutput::default();
        for b in 0..width {
            // Rows are right-aligned: only the trailing history + 1 positions are real.
            let first = size - (history[b] + 1);
            let mut residual = inputs[b].clone();
            for (l, layer) in self.layers.iter().enumerate() {
                let cache = context
                    .for_layer(l)
                    .ok_or_else(|| EngineError::Inference(format!("missing layer {l}")))?;
                let q = &queries[l][b];
                let mut attn = vec![0.0; d];
                for h in 0..c.num_heads {
                    let qh = &q[h * c.head_dim..(h + 1) * c.head_dim];
                    let mut scores: Vec<f32> = (first..size)
                        .map(|p| {
                            let kh = cache.key_at(b, h, p);
                            qh.iter().zip(kh).map(|(a, k)| a * k).sum::<f32>() * scale
                        })
                        .collect();
                    softmax(&mut scores);
                    let out_h = &mut attn[h * c.head_dim..(h + 1) * c.head_dim];
                    for (w, p) in scores.iter().zip(first..size) {
                        for (o, vh) in out_h.iter_mut().zip(cache.value_at(b, h, p)) {
                            *o += w * vh;
                        }
                    }
                }
                let proj = matvec(&attn, &layer.w_o, d, d);
                for (r, p) in residual.iter_mut().zip(&proj) {
                    *r += p;
                }
            }

            let hidden = rms_norm(&residual, c.norm_eps);
            out.next_latents.push(
                matvec(&hidden, &self.w_obs, d, c.latent_dim)
                    .into_iter()
                    .map(f32::tanh)
                    .collect(),
            );
            out.reward_logits.push(matvec(&hidden, &self.w_reward, d, support));
            out.policy_logits.push(matvec(&hidden, &self.w_policy, d, c.action_space));
            out.value_logits.push(matvec(&hidden, &self.w_value, d, support));
        }

        Ok(out)
    }

    fn positional_projection(&self, layer: usize) -> Option<PositionalProjection> {
        if self.rope.is_some() {
            return None;
        }
        let layer = self.layers.get(layer)?;
        let c = &self.config;
        let d = c.d_model();
        let n = c.max_tokens;
        let mut keys = vec![0.0; n * d];
        let mut values = vec![0.0; n * d];
        for t in 0..n {
            let pe = &self.pos_emb[t * d..(t + 1) * d];
            let k = matvec(pe, &layer.w_k, d, d);
            let v = matvec(pe, &layer.w_v, d, d);
            for h in 0..c.num_heads {
                let dst = (h * n + t) * c.head_dim;
                let src = h * c.head_dim;
                keys[dst..dst + c.head_dim].copy_from_slice(&k[src..src + c.head_dim]);
                values[dst..dst + c.head_dim].copy_from_slice(&v[src..src + c.head_dim]);
            }
        }
        Some(PositionalProjection {
            heads: c.num_heads,
            positions: n,
            head_dim: c.head_dim,
            keys,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latent(seed: u64, dim: usize) -> Vec<f32> {
        XorShift64::new(seed).fill(dim, 1.0)
    }

    #[test]
    fn forward_appends_one_position() {
        let model = TinyWorldModel::new(TinyWorldModelConfig::default()).unwrap();
        let mut ctx = model.generate_empty_context(2, 10);
        let z = vec![latent(1, 16), latent(2, 16)];
        let out = model
            .forward(ForwardInput::Latents(&z), &mut ctx, None, &Positions::zeros(2))
            .unwrap();
        assert_eq!(ctx.size(), 1);
        assert_eq!(out.width(), 2);
        assert_eq!(out.next_latents[0].len(), 16);
        assert_eq!(out.reward_logits[0].len(), 11);
        assert_eq!(out.policy_logits[0].len(), 4);
    }

    #[test]
    fn deterministic_across_instances() {
        let a = TinyWorldModel::new(TinyWorldModelConfig::default()).unwrap();
        let b = TinyWorldModel::new(TinyWorldModelConfig::default()).unwrap();
        let z = vec![latent(3, 16)];
        let mut ca = a.generate_empty_context(1, 10);
        let mut cb = b.generate_empty_context(1, 10);
        let start = Positions::scalar(0);
        let oa = a.forward(ForwardInput::Latents(&z), &mut ca, None, &start).unwrap();
        let ob = b.forward(ForwardInput::Latents(&z), &mut cb, None, &start).unwrap();
        assert_eq!(oa, ob);
    }

    #[test]
    fn front_padding_is_masked() {
        let model = TinyWorldModel::new(TinyWorldModelConfig::default()).unwrap();
        let start = Positions::scalar(0);
        let z = vec![latent(4, 16)];

        let mut plain = model.generate_empty_context(1, 10);
        model
            .forward(ForwardInput::Latents(&z), &mut plain, None, &start)
            .unwrap();
        let expected = model
            .forward(ForwardInput::Actions(&[1]), &mut plain, None, &start)
            .unwrap();

        // Same history shifted right behind two zeroed positions.
        let mut padded = model.generate_empty_context(1, 10);
        let mut once = model.generate_empty_context(1, 10);
        model
            .forward(ForwardInput::Latents(&z), &mut once, None, &start)
            .unwrap();
        padded.copy_item_from(0, &once, 0, 2).unwrap();
        padded.set_size(3).unwrap();
        let got = model
            .forward(ForwardInput::Actions(&[1]), &mut padded, Some(&[1]), &start)
            .unwrap();

        for (a, b) in expected.next_latents[0].iter().zip(&got.next_latents[0]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_wrong_latent_length() {
        let model = TinyWorldModel::new(TinyWorldModelConfig::default()).unwrap();
        let mut ctx = model.generate_empty_context(1, 10);
        let err = model
            .forward(
                ForwardInput::Latents(&[vec![0.0; 3]]),
                &mut ctx,
                None,
                &Positions::scalar(0),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(ctx.size(), 0);
    }

    #[test]
    fn rejects_start_positions_of_wrong_width() {
        let config = TinyWorldModelConfig::default()
            .with_positions(PositionEncoding::Rotary { theta: 10_000.0 });
        let model = TinyWorldModel::new(config).unwrap();
        let z = vec![latent(1, 16), latent(2, 16)];
        let mut ctx = model.generate_empty_context(2, 10);
        for start in [Positions::new(vec![3, 4, 5]), Positions::new(vec![])] {
            let err = model
                .forward(ForwardInput::Latents(&z), &mut ctx, None, &start)
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)));
        }
        assert_eq!(ctx.size(), 0);

        model
            .forward(ForwardInput::Latents(&z), &mut ctx, None, &Positions::scalar(3))
            .unwrap();
        assert_eq!(ctx.size(), 1);
    }

    #[test]
    fn rejects_action_outside_space() {
        let model = TinyWorldModel::new(TinyWorldModelConfig::default()).unwrap();
        let mut ctx = model.generate_empty_context(1, 10);
        let err = model
            .forward(ForwardInput::Actions(&[9]), &mut ctx, None, &Positions::scalar(0))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn full_context_reports_capacity() {
        let model = TinyWorldModel::new(TinyWorldModelConfig::default()).unwrap();
        let mut ctx = model.generate_empty_context(1, 1);
        let start = Positions::scalar(0);
        model
            .forward(ForwardInput::Actions(&[0]), &mut ctx, None, &start)
            .unwrap();
        let err = model
            .forward(ForwardInput::Actions(&[0]), &mut ctx, None, &start)
            .unwrap_err();
        assert!(matches!(err, EngineError::Kv(_)));
    }

    #[test]
    fn rotary_model_has_no_projection() {
        let config = TinyWorldModelConfig::default()
            .with_positions(PositionEncoding::Rotary { theta: 10_000.0 });
        let model = TinyWorldModel::new(config).unwrap();
        assert!(model.positional_projection(0).is_none());
    }

    #[test]
    fn projection_matches_geometry() {
        let model = TinyWorldModel::new(TinyWorldModelConfig::default()).unwrap();
        let proj = model.positional_projection(1).unwrap();
        assert_eq!(proj.positions, 10);
        assert_eq!(proj.keys.len(), 2 * 10 * 8);
        assert!(model.positional_projection(2).is_none());
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = TinyWorldModelConfig::default();
        config.num_layers = 0;
        assert!(TinyWorldModel::new(config).is_err());

        let mut config = TinyWorldModelConfig::default()
            .with_positions(PositionEncoding::Rotary { theta: 10_000.0 });
        config.head_dim = 3;
        assert!(TinyWorldModel::new(config).is_err());
    }
}
