//! Multi-layer context cache.

use crate::{Device, KvError, KvResult, KvShape, LayerCache};

/// Accumulated key/value history of one inference context, one
/// [`LayerCache`] per model layer.
///
/// Every layer holds the same number of positions after a coherent update
/// (layers advance together per forward step). [`ContextCache::check_coherent`]
/// reports a violation instead of panicking.
#[derive(Debug, Clone)]
pub struct ContextCache {
    layers: Vec<LayerCache>,
    device: Device,
}

impl ContextCache {
    /// Create an empty, zero-filled context.
    ///
    /// # Panics
    /// If `num_layers == 0`.
    pub fn new(num_layers: usize, shape: KvShape, device: Device) -> Self {
        assert!(num_layers > 0, "ContextCache requires num_layers > 0");
        let layers = (0..num_layers).map(|_| LayerCache::new(shape)).collect();
        Self { layers, device }
    }

    /// Allocate an empty context with the same geometry and locality.
    pub fn zeros_like(&self) -> Self {
        Self::new(self.layers.len(), self.shape(), self.device)
    }

    pub fn shape(&self) -> KvShape {
        self.layers[0].shape()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn batch_width(&self) -> usize {
        self.shape().batch
    }

    pub fn capacity(&self) -> usize {
        self.shape().capacity
    }

    /// Current fill size, read from the first layer.
    pub fn size(&self) -> usize {
        self.layers[0].size()
    }

    pub fn remaining(&self) -> usize {
        self.layers[0].remaining()
    }

    /// Verify all layers share one fill size and return it.
    pub fn check_coherent(&self) -> KvResult<usize> {
        let expected = self.layers[0].size();
        for (layer, cache) in self.layers.iter().enumerate().skip(1) {
            if cache.size() != expected {
                return Err(KvError::IncoherentLayers {
                    layer,
                    expected,
                    got: cache.size(),
                });
            }
        }
        Ok(expected)
    }

    pub fn for_layer(&self, layer: usize) -> Option<&LayerCache> {
        self.layers.get(layer)
    }

    /// Mutable access to one layer.
    ///
    /// Callers that append to individual layers must bring every layer to the
    /// same size before the context is used again.
    pub fn for_layer_mut(&mut self, layer: usize) -> Option<&mut LayerCache> {
        self.layers.get_mut(layer)
    }

    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    /// Fail with `CapacityExceeded` unless `positions` more fit.
    pub fn ensure_room(&self, positions: usize) -> KvResult<()> {
        let size = self.size();
        if size + positions > self.capacity() {
            return Err(KvError::CapacityExceeded {
                requested: size + positions,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Append one step of K/V to every layer.
    ///
    /// Inputs are validated for all layers before any layer is written, so a
    /// rejected step leaves the context untouched.
    pub fn append_step(&mut self, k_steps: &[&[f32]], v_steps: &[&[f32]]) -> KvResult<()> {
        if k_steps.len() != self.layers.len() || v_steps.len() != self.layers.len() {
            let got = if k_steps.len() != self.layers.len() {
                k_steps.len()
            } else {
                v_steps.len()
            };
            return Err(KvError::ShapeMismatch {
                expected: format!("{} layers", self.layers.len()),
                got: format!("{got} layers"),
            });
        }

        let per_position = self.shape().position_elements();
        let positions = k_steps[0].len() / per_position.max(1);
        for (k, v) in k_steps.iter().zip(v_steps) {
            if k.len() != v.len() || k.len() != positions * per_position {
                return Err(KvError::ShapeMismatch {
                    expected: format!("{} elements", positions * per_position),
                    got: format!("{} / {} elements", k.len(), v.len()),
                });
            }
        }
        self.ensure_room(positions)?;

        for (layer, (k, v)) in self.layers.iter_mut().zip(k_steps.iter().zip(v_steps)) {
            layer.append(k, v)?;
        }
        Ok(())
    }

    /// Deep-copy into an existing context of identical geometry.
    pub fn clone_into(&self, dst: &mut ContextCache) -> KvResult<()> {
        if dst.layers.len() != self.layers.len() {
            return Err(KvError::ShapeMismatch {
                expected: format!("{} layers", self.layers.len()),
                got: format!("{} layers", dst.layers.len()),
            });
        }
        if dst.shape() != self.shape() {
            return Err(KvError::ShapeMismatch {
                expected: self.shape().to_string(),
                got: dst.shape().to_string(),
            });
        }

        for (src, dst) in self.layers.iter().zip(dst.layers.iter_mut()) {
            src.clone_into(dst)?;
        }
        dst.device = self.device;
        Ok(())
    }

    /// Copy batch row `src_item` of `src` into row `dst_item` of every layer,
    /// shifted by `offset` positions (see [`LayerCache::copy_item_from`]).
    pub fn copy_item_from(
        &mut self,
        dst_item: usize,
        src: &ContextCache,
        src_item: usize,
        offset: isize,
    ) -> KvResult<()> {
        if src.layers.len() != self.layers.len() {
            return Err(KvError::ShapeMismatch {
                expected: format!("{} layers", self.layers.len()),
                got: format!("{} layers", src.layers.len()),
            });
        }
        for (dst, src) in self.layers.iter_mut().zip(&src.layers) {
            dst.copy_item_from(dst_item, src, src_item, offset)?;
        }
        Ok(())
    }

    /// Copy batch row `item` into a width-1 context, which takes this
    /// context's fill size.
    pub fn extract_item(&self, item: usize, dst: &mut ContextCache) -> KvResult<()> {
        dst.copy_item_from(0, self, item, 0)?;
        dst.set_size(self.size())?;
        dst.device = self.device;
        Ok(())
    }

    /// Write row 0 of `src` into batch row `item`. The fill size is unchanged.
    pub fn insert_item(&mut self, item: usize, src: &ContextCache) -> KvResult<()> {
        self.copy_item_from(item, src, 0, 0)
    }

    /// Set the fill size of every layer.
    pub fn set_size(&mut self, size: usize) -> KvResult<()> {
        for layer in &mut self.layers {
            layer.set_size(size)?;
        }
        Ok(())
    }

    /// Keep positions `[start, end)` of every layer, moved to the front.
    pub fn retain_window(&mut self, start: usize, end: usize) -> KvResult<usize> {
        let mut len = 0;
        for layer in &mut self.layers {
            len = layer.retain_window(start, end)?;
        }
        Ok(len)
    }

    /// Zero every layer.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.reset();
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.memory_bytes()).sum()
    }

    pub fn active_memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.active_memory_bytes()).sum()
    }
}
