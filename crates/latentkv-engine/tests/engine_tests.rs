//! Integration tests for the model traits, using a minimal summing model.

use latentkv_engine::*;
use latentkv_kv::{ContextCache, Device};

/// One layer, one head, head_dim 1. Caches the token scalar as both key and
/// value; predicts the sum of the valid cached keys.
struct SummingModel;

impl SummingModel {
    fn token(input: &ForwardInput<'_>, b: usize) -> f32 {
        match input {
            ForwardInput::Latents(l) => l[b].iter().sum(),
            ForwardInput::Actions(a) => a[b] as f32,
        }
    }
}

impl SequenceModel for SummingModel {
    fn geometry(&self) -> ModelGeometry {
        ModelGeometry {
            num_layers: 1,
            num_heads: 1,
            head_dim: 1,
            max_tokens: 8,
            latent_dim: 2,
            action_space: 4,
            positions: PositionEncoding::Absolute,
        }
    }

    fn generate_empty_context(&self, batch_width: usize, max_length: usize) -> ContextCache {
        let mut shape = self.geometry().kv_shape(batch_width);
        shape.capacity = max_length;
        ContextCache::new(1, shape, Device::Cpu)
    }

    fn forward(
        &self,
        input: ForwardInput<'_>,
        context: &mut ContextCache,
        valid_lengths: Option<&[usize]>,
        _start: &Positions,
    ) -> Result<ForwardOutput> {
        let width = context.batch_width();
        if input.width() != width {
            return Err(EngineError::InvalidInput(format!(
                "expected {width} tokens, got {}",
                input.width()
            )));
        }
        let step: Vec<f32> = (0..width).map(|b| Self::token(&input, b)).collect();
        context.append_step(&[&step], &[&step])?;

        let size = context.size();
        let layer = context.for_layer(0).expect("one layer");
        let mut out = ForwardOutput::default();
        for b in 0..width {
            let valid = valid_lengths.map_or(size - 1, |v| v[b]) + 1;
            let sum: f32 = (size - valid..size).map(|p| layer.key_at(b, 0, p)[0]).sum();
            out.next_latents.push(vec![sum, 0.0]);
        }
        Ok(out)
    }

    fn positional_projection(&self, _layer: usize) -> Option<PositionalProjection> {
        None
    }
}

struct IdentityEncoder;

impl LatentEncoder for IdentityEncoder {
    type Observation = Vec<f32>;

    fn encode(&self, observation: &Vec<f32>) -> Result<Vec<f32>> {
        Ok(observation.clone())
    }
}

// ===========================================================================
// Forward contract
// ===========================================================================

#[test]
fn forward_appends_exactly_one_position() {
    let model = SummingModel;
    let mut ctx = model.generate_empty_context(2, 8);
    let start = Positions::zeros(2);

    model
        .forward(ForwardInput::Actions(&[1, 2]), &mut ctx, None, &start)
        .unwrap();
    assert_eq!(ctx.size(), 1);

    let out = model
        .forward(
            ForwardInput::Latents(&[vec![1.0, 1.0], vec![0.5, 0.5]]),
            &mut ctx,
            None,
            &start,
        )
        .unwrap();
    assert_eq!(ctx.size(), 2);
    assert_eq!(out.width(), 2);
    assert_eq!(out.next_latents[0][0], 3.0);
    assert_eq!(out.next_latents[1][0], 3.0);
}

#[test]
fn valid_lengths_exclude_front_padding() {
    let model = SummingModel;
    let mut ctx = model.generate_empty_context(1, 8);
    let start = Positions::scalar(0);

    model
        .forward(ForwardInput::Actions(&[3]), &mut ctx, None, &start)
        .unwrap();
    // Only the newest position counts when the row reports no prior history.
    let out = model
        .forward(ForwardInput::Actions(&[2]), &mut ctx, Some(&[0]), &start)
        .unwrap();
    assert_eq!(out.next_latents[0][0], 2.0);
}

#[test]
fn forward_surfaces_capacity_error() {
    let model = SummingModel;
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
fn models_are_usable_as_trait_objects() {
    let model: Box<dyn SequenceModel> = Box::new(SummingModel);
    assert_eq!(model.geometry().num_layers, 1);
    assert!(model.positional_projection(0).is_none());
}

// ===========================================================================
// Encoder
// ===========================================================================

#[test]
fn encode_batch_preserves_order() {
    let enc = IdentityEncoder;
    let latents = enc
        .encode_batch(&[vec![1.0], vec![2.0], vec![3.0]])
        .unwrap();
    assert_eq!(latents, vec![vec![1.0], vec![2.0], vec![3.0]]);
}
