//! Positional corrections for renumbered cache windows.

use latentkv_engine::SequenceModel;
use latentkv_kv::ContextCache;

use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone)]
struct LayerDelta {
    // [heads, len, head_dim]
    keys: Vec<f32>,
    values: Vec<f32>,
}

/// Per-layer `P(j) - P(start + j)` for `j` in `[0, end - start)`, where `P`
/// is the layer's key (resp. value) projection of the positional table.
///
/// Adding the table to positions `[0, end - start)` of a context whose window
/// `[start, end)` was moved to the front makes the cached entries equal to
/// ones computed at the new positions.
#[derive(Debug, Clone)]
pub struct PositionalDeltaTable {
    start: usize,
    end: usize,
    layers: Vec<LayerDelta>,
}

impl PositionalDeltaTable {
    /// Build the table for window `[start, end)`.
    ///
    /// Returns `Ok(None)` when the model does not bake positions into its
    /// cached keys.
    pub fn build<M: SequenceModel + ?Sized>(
        model: &M,
        start: usize,
        end: usize,
    ) -> CacheResult<Option<Self>> {
        let geometry = model.geometry();
        if geometry.positions.is_rotary() {
            return Ok(None);
        }
        if start > end {
            return Err(CacheError::InvalidConfig(format!(
                "delta window [{start}, {end}) is inverted"
            )));
        }

        let len = end - start;
        let mut layers = Vec::with_capacity(geometry.num_layers);
        for layer in 0..geometry.num_layers {
            let Some(proj) = model.positional_projection(layer) else {
                return Ok(None);
            };
            if end > proj.positions {
                return Err(CacheError::InvalidConfig(format!(
                    "delta window end {end} beyond {} positional entries",
                    proj.positions
                )));
            }

            let hd = proj.head_dim;
            let mut keys = Vec::with_capacity(proj.heads * len * hd);
            let mut values = Vec::with_capacity(proj.heads * len * hd);
            for head in 0..proj.heads {
                for j in 0..len {
                    let (to, from) = (j, start + j);
                    keys.extend(
                        proj.key(head, to)
                            .iter()
                            .zip(proj.key(head, from))
                            .map(|(a, b)| a - b),
                    );
                    values.extend(
                        proj.value(head, to)
                            .iter()
                            .zip(proj.value(head, from))
                            .map(|(a, b)| a - b),
                    );
                }
            }
            layers.push(LayerDelta { keys, values });
        }

        Ok(Some(Self { start, end, layers }))
    }

    /// The `(start, end)` window this table corrects.
    pub fn window(&self) -> (usize, usize) {
        (self.start, self.end)
    }

    /// Add the correction to row `item` of every layer of `ctx`.
    pub fn apply(&self, ctx: &mut ContextCache, item: usize) -> CacheResult<()> {
        if ctx.num_layers() != self.layers.len() {
            return Err(CacheError::InvalidRequest(format!(
                "delta table has {} layers, context has {}",
                self.layers.len(),
                ctx.num_layers()
            )));
        }
        for (layer, delta) in self.layers.iter().enumerate() {
            if let Some(cache) = ctx.for_layer_mut(layer) {
                cache.add_to_prefix(item, &delta.keys, &delta.values)?;
            }
        }
        Ok(())
    }
}
