//! # latentkv-engine
//!
//! The "narrow waist" between the cache engine and the world model. Defines the
//! [`SequenceModel`] and [`LatentEncoder`] traits and the types that cross them.
//! The cache engine depends on *model behavior*, not on how the model computes.
//!
//! ## Design Notes
//!
//! ### One position per forward
//! Every [`SequenceModel::forward`] call consumes one token per batch item and
//! appends exactly one position to the context it is given. The cache engine
//! relies on this to keep per-item valid lengths in step with the context size.
//!
//! ### Front padding
//! When the engine batches contexts of different lengths it right-aligns them,
//! leaving zeroed padding at the front. `valid_lengths` tells the model how many
//! trailing positions of each row are real, so padding can be masked out.

use latentkv_kv::{ContextCache, KvError, KvShape};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error type for model operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("kv cache error: {0}")]
    Kv(#[from] KvError),
    #[error("invalid model input: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// How the model injects position information.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEncoding {
    /// Learned table added to the input embedding. Cached keys depend on the
    /// absolute position, so elided prefixes need a delta correction.
    Absolute,
    /// Rotary encoding driven by the per-item start position.
    Rotary { theta: f32 },
}

impl PositionEncoding {
    pub fn is_rotary(&self) -> bool {
        matches!(self, PositionEncoding::Rotary { .. })
    }
}

/// Static shape information the cache engine needs from a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelGeometry {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    /// Context window in positions; also the capacity of every context.
    pub max_tokens: usize,
    pub latent_dim: usize,
    pub action_space: usize,
    pub positions: PositionEncoding,
}

impl ModelGeometry {
    /// Buffer geometry of a context of the given batch width.
    pub fn kv_shape(&self, batch_width: usize) -> KvShape {
        KvShape::new(batch_width, self.num_heads, self.max_tokens, self.head_dim)
    }
}

/// Per-item start positions of a batched call. Width 1 broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Positions(Vec<usize>);

impl Positions {
    pub fn new(starts: Vec<usize>) -> Self {
        Self(starts)
    }

    /// A single start position shared by every item.
    pub fn scalar(start: usize) -> Self {
        Self(vec![start])
    }

    pub fn zeros(width: usize) -> Self {
        Self(vec![0; width])
    }

    /// Start position of item `i`.
    pub fn at(&self, i: usize) -> usize {
        match self.0.as_slice() {
            [] => 0,
            [only] => *only,
            many => many.get(i).copied().unwrap_or(0),
        }
    }

    /// Whether these positions can serve a batch of `width` items: one shared
    /// start, or exactly one per item.
    pub fn fits(&self, width: usize) -> bool {
        self.0.len() == 1 || self.0.len() == width
    }

    /// Positions for a subset of items, in the given order.
    pub fn select(&self, items: &[usize]) -> Self {
        Self(items.iter().map(|&i| self.at(i)).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for Positions {
    fn from(starts: Vec<usize>) -> Self {
        Self(starts)
    }
}

/// One token per batch item.
#[derive(Debug, Clone, Copy)]
pub enum ForwardInput<'a> {
    Latents(&'a [Vec<f32>]),
    Actions(&'a [usize]),
}

impl ForwardInput<'_> {
    pub fn width(&self) -> usize {
        match self {
            ForwardInput::Latents(l) => l.len(),
            ForwardInput::Actions(a) => a.len(),
        }
    }
}

/// Predictions for the token just consumed, one row per batch item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardOutput {
    /// Predicted next latent state.
    pub next_latents: Vec<Vec<f32>>,
    pub reward_logits: Vec<Vec<f32>>,
    pub policy_logits: Vec<Vec<f32>>,
    pub value_logits: Vec<Vec<f32>>,
}

impl ForwardOutput {
    pub fn width(&self) -> usize {
        self.next_latents.len()
    }
}

/// Key and value projections of a layer's positional embedding table,
/// laid out `[heads, positions, head_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionalProjection {
    pub heads: usize,
    pub positions: usize,
    pub head_dim: usize,
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
}

impl PositionalProjection {
    fn offset(&self, head: usize, pos: usize) -> usize {
        (head * self.positions + pos) * self.head_dim
    }

    pub fn key(&self, head: usize, pos: usize) -> &[f32] {
        let o = self.offset(head, pos);
        &self.keys[o..o + self.head_dim]
    }

    pub fn value(&self, head: usize, pos: usize) -> &[f32] {
        let o = self.offset(head, pos);
        &self.values[o..o + self.head_dim]
    }
}

/// The autoregressive world model whose contexts are cached.
pub trait SequenceModel: Send + Sync {
    fn geometry(&self) -> ModelGeometry;

    /// Fresh, empty context of the given batch width.
    fn generate_empty_context(&self, batch_width: usize, max_length: usize) -> ContextCache;

    /// Consume one token per item, appending one position to `context`.
    ///
    /// `valid_lengths[b]` is the number of trailing real positions of row `b`
    /// before this call; `None` means every row is fully valid. `start` carries
    /// each item's absolute start position for rotary encodings.
    fn forward(
        &self,
        input: ForwardInput<'_>,
        context: &mut ContextCache,
        valid_lengths: Option<&[usize]>,
        start: &Positions,
    ) -> Result<ForwardOutput>;

    /// Projection of the positional table for `layer`; `None` when positions
    /// are not baked into cached keys (rotary).
    fn positional_projection(&self, layer: usize) -> Option<PositionalProjection>;
}

/// Turns raw observations into latent state vectors.
pub trait LatentEncoder: Send + Sync {
    type Observation;

    fn encode(&self, observation: &Self::Observation) -> Result<Vec<f32>>;

    fn encode_batch(&self, observations: &[Self::Observation]) -> Result<Vec<Vec<f32>>> {
        observations.iter().map(|o| self.encode(o)).collect()
    }
}
