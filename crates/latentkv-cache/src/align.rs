//! Batch alignment and window management.

use latentkv_kv::ContextCache;
use tracing::trace;

use crate::error::{CacheError, CacheResult};
use crate::posdelta::PositionalDeltaTable;

/// First position kept when the context window is shrunk.
pub const WINDOW_KEEP_FROM: usize = 2;

/// Reconciles per-environment contexts of different lengths into one batch
/// and keeps stored contexts inside the window.
#[derive(Debug, Clone)]
pub struct AlignmentEngine {
    context_length: usize,
    deltas: Option<PositionalDeltaTable>,
}

impl AlignmentEngine {
    /// `deltas` must cover the window `[2, context_length - 1)` when present.
    pub fn new(context_length: usize, deltas: Option<PositionalDeltaTable>) -> Self {
        Self {
            context_length,
            deltas,
        }
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn corrects_positions(&self) -> bool {
        self.deltas.is_some()
    }

    /// Right-align `sources` (width-1 contexts) into `working`.
    ///
    /// Row `i` receives source `i` shifted right by `max - s_i` with zeroed
    /// front padding; the working context reports `max` positions. Returns
    /// the per-row valid lengths.
    pub fn trim_and_pad(
        &self,
        sources: &[&ContextCache],
        working: &mut ContextCache,
    ) -> CacheResult<Vec<usize>> {
        if sources.len() != working.batch_width() {
            return Err(CacheError::InvalidRequest(format!(
                "{} contexts for a working batch of width {}",
                sources.len(),
                working.batch_width()
            )));
        }

        let sizes: Vec<usize> = sources.iter().map(|s| s.size()).collect();
        let max_size = sizes.iter().copied().max().unwrap_or(0);
        for (item, (src, &size)) in sources.iter().zip(&sizes).enumerate() {
            let pad = max_size - size;
            trace!(item, size, pad, "aligning context");
            working.copy_item_from(item, src, 0, pad as isize)?;
        }
        working.set_size(max_size)?;

        Ok(sizes)
    }

    /// Shrink a width-1 context that reached `context_length - 1` positions.
    ///
    /// Keeps `[2, context_length - 1)` at the front, applies the positional
    /// correction if one is configured, and leaves `context_length - 3`
    /// positions. Returns whether the context was shrunk.
    pub fn shrink_window(&self, ctx: &mut ContextCache) -> CacheResult<bool> {
        if self.context_length <= WINDOW_KEEP_FROM {
            return Ok(false);
        }
        let limit = self.context_length - 1;
        if ctx.size() < limit {
            return Ok(false);
        }

        let kept = ctx.retain_window(WINDOW_KEEP_FROM, limit)?;
        if let Some(deltas) = &self.deltas {
            deltas.apply(ctx, 0)?;
        }
        trace!(kept, corrected = self.deltas.is_some(), "shrank context window");
        Ok(true)
    }

    /// Copy row `item` of `working` into the width-1 `scratch`, shifted left by
    /// `trim`, with `size` valid positions, then shrink it if needed.
    ///
    /// Returns whether the window was shrunk.
    pub fn extract(
        &self,
        working: &ContextCache,
        item: usize,
        trim: usize,
        size: usize,
        scratch: &mut ContextCache,
    ) -> CacheResult<bool> {
        scratch.copy_item_from(0, working, item, -(trim as isize))?;
        scratch.set_size(size)?;
        self.shrink_window(scratch)
    }
}
