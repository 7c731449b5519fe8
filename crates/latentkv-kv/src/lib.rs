//! # latentkv-kv
//!
//! Key/value cache buffers for latentkv.
//!
//! Supports:
//! - **Append**: Writes K/V for one or more positions at the current fill size
//! - **Overwrite**: Replaces a whole buffer pair (used by restoration and alignment)
//! - **Clone into**: Copies a cache into an existing buffer of the same shape, no allocation
//! - **Batch rows**: Moves one batch item between caches with a positional shift
//! - **Multi-layer**: [`ContextCache`] keeps every layer at the same fill size
//! - **Memory tracking**: Byte accounting for allocated and active memory

mod context;

pub use context::ContextCache;

use std::fmt;

/// Buffer geometry: `[batch, heads, capacity, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KvShape {
    pub batch: usize,
    pub heads: usize,
    pub capacity: usize,
    pub head_dim: usize,
}

impl KvShape {
    pub fn new(batch: usize, heads: usize, capacity: usize, head_dim: usize) -> Self {
        Self {
            batch,
            heads,
            capacity,
            head_dim,
        }
    }

    /// Same geometry with a different batch width.
    pub fn with_batch(self, batch: usize) -> Self {
        Self { batch, ..self }
    }

    pub fn total_elements(&self) -> usize {
        self.batch * self.heads * self.capacity * self.head_dim
    }

    /// Elements occupied by one position across the whole batch.
    pub fn position_elements(&self) -> usize {
        self.batch * self.heads * self.head_dim
    }

    pub fn capacity_bytes(&self, bytes_per_element: usize) -> usize {
        self.total_elements() * bytes_per_element
    }

    /// True when both shapes describe rows that can be copied into each other.
    pub fn row_compatible(&self, other: &KvShape) -> bool {
        self.heads == other.heads
            && self.capacity == other.capacity
            && self.head_dim == other.head_dim
    }
}

impl fmt::Display for KvShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[batch:{}, heads:{}, seq:{}, dim:{}]",
            self.batch, self.heads, self.capacity, self.head_dim
        )
    }
}

/// Locality tag carried by every context cache.
///
/// Buffers live in host memory; the tag travels with copies so pooled slots
/// inherit the locality of the context they were filled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Metal,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Metal => write!(f, "metal"),
        }
    }
}

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("KV cache capacity exceeded: {requested} > {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("layer sizes diverged: layer 0 holds {expected} positions, layer {layer} holds {got}")]
    IncoherentLayers {
        layer: usize,
        expected: usize,
        got: usize,
    },

    #[error("batch item {index} out of range for batch width {width}")]
    ItemOutOfRange { index: usize, width: usize },
}

impl KvError {
    fn shape(expected: impl fmt::Display, got: impl fmt::Display) -> Self {
        KvError::ShapeMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Key and value buffers for one model layer.
///
/// # Invariants
/// - `size <= capacity`, shared by every batch item
/// - Positions at or beyond `size` are zero
/// - K and V buffers always have the same length
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// K buffer, flattened `[batch, heads, capacity, head_dim]`
    k: Vec<f32>,
    /// V buffer, same layout as `k`
    v: Vec<f32>,
    shape: KvShape,
    /// Number of valid positions along the sequence axis
    size: usize,
}

impl LayerCache {
    /// Create a zero-filled, empty layer cache.
    pub fn new(shape: KvShape) -> Self {
        let buf_len = shape.total_elements();
        Self {
            k: vec![0.0; buf_len],
            v: vec![0.0; buf_len],
            shape,
            size: 0,
        }
    }

    pub fn shape(&self) -> KvShape {
        self.shape
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.shape.capacity
    }

    pub fn remaining(&self) -> usize {
        self.shape.capacity - self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Full key buffer, including the invalid tail.
    pub fn keys(&self) -> &[f32] {
        &self.k
    }

    /// Full value buffer, including the invalid tail.
    pub fn values(&self) -> &[f32] {
        &self.v
    }

    fn row_offset(&self, item: usize, head: usize, pos: usize) -> usize {
        ((item * self.shape.heads + head) * self.shape.capacity + pos) * self.shape.head_dim
    }

    fn check_item(&self, item: usize) -> KvResult<()> {
        if item >= self.shape.batch {
            return Err(KvError::ItemOutOfRange {
                index: item,
                width: self.shape.batch,
            });
        }
        Ok(())
    }

    /// Key vector of one head at one position.
    pub fn key_at(&self, item: usize, head: usize, pos: usize) -> &[f32] {
        let offset = self.row_offset(item, head, pos);
        &self.k[offset..offset + self.shape.head_dim]
    }

    /// Value vector of one head at one position.
    pub fn value_at(&self, item: usize, head: usize, pos: usize) -> &[f32] {
        let offset = self.row_offset(item, head, pos);
        &self.v[offset..offset + self.shape.head_dim]
    }

    /// Append K/V for `t` new positions at the current fill size.
    ///
    /// Deltas are laid out `[batch, heads, t, head_dim]` (flattened).
    ///
    /// # Errors
    /// - `ShapeMismatch`: K/V lengths differ or are not a whole number of positions
    /// - `CapacityExceeded`: `size + t > capacity`
    pub fn append(&mut self, k_delta: &[f32], v_delta: &[f32]) -> KvResult<()> {
        let per_position = self.shape.position_elements();

        if k_delta.len() != v_delta.len() {
            return Err(KvError::shape(k_delta.len(), v_delta.len()));
        }
        if per_position == 0 || k_delta.len() % per_position != 0 {
            return Err(KvError::shape(
                format!("a multiple of {per_position} elements"),
                k_delta.len(),
            ));
        }

        let t = k_delta.len() / per_position;
        if self.size + t > self.shape.capacity {
            return Err(KvError::CapacityExceeded {
                requested: self.size + t,
                capacity: self.shape.capacity,
            });
        }

        let hd = self.shape.head_dim;
        for item in 0..self.shape.batch {
            for head in 0..self.shape.heads {
                let src = ((item * self.shape.heads + head) * t) * hd;
                let dst = self.row_offset(item, head, self.size);
                self.k[dst..dst + t * hd].copy_from_slice(&k_delta[src..src + t * hd]);
                self.v[dst..dst + t * hd].copy_from_slice(&v_delta[src..src + t * hd]);
            }
        }
        self.size += t;

        Ok(())
    }

    /// Replace both buffers wholesale.
    ///
    /// Inputs must already be shaped to the full buffer, so only the shape
    /// and `size <= capacity` are checked.
    pub fn overwrite(&mut self, k: &[f32], v: &[f32], size: usize) -> KvResult<()> {
        let expected = self.shape.total_elements();
        if k.len() != expected || v.len() != expected {
            let got = if k.len() != expected { k.len() } else { v.len() };
            return Err(KvError::shape(expected, got));
        }
        if size > self.shape.capacity {
            return Err(KvError::CapacityExceeded {
                requested: size,
                capacity: self.shape.capacity,
            });
        }

        self.k.copy_from_slice(k);
        self.v.copy_from_slice(v);
        self.size = size;
        Ok(())
    }

    /// Copy buffers and fill size into an existing cache of identical shape.
    pub fn clone_into(&self, dst: &mut LayerCache) -> KvResult<()> {
        if dst.shape != self.shape {
            return Err(KvError::shape(self.shape, dst.shape));
        }
        dst.k.copy_from_slice(&self.k);
        dst.v.copy_from_slice(&self.v);
        dst.size = self.size;
        Ok(())
    }

    /// Set the fill size after a row-level rewrite.
    pub fn set_size(&mut self, size: usize) -> KvResult<()> {
        if size > self.shape.capacity {
            return Err(KvError::CapacityExceeded {
                requested: size,
                capacity: self.shape.capacity,
            });
        }
        self.size = size;
        Ok(())
    }

    /// Copy batch row `src_item` of `src` into row `dst_item`, shifted along the
    /// sequence axis by `offset` positions.
    ///
    /// Destination position `t` receives source position `t - offset`; positions
    /// whose source falls outside `[0, capacity)` are zeroed. A positive offset
    /// front-pads, a negative one drops leading positions. The fill size is left
    /// untouched.
    pub fn copy_item_from(
        &mut self,
        dst_item: usize,
        src: &LayerCache,
        src_item: usize,
        offset: isize,
    ) -> KvResult<()> {
        if !self.shape.row_compatible(&src.shape) {
            return Err(KvError::shape(self.shape, src.shape));
        }
        self.check_item(dst_item)?;
        src.check_item(src_item)?;

        let cap = self.shape.capacity as isize;
        let hd = self.shape.head_dim;
        for head in 0..self.shape.heads {
            let dst_base = self.row_offset(dst_item, head, 0);
            let src_base = src.row_offset(src_item, head, 0);

            let dst_start = offset.clamp(0, cap) as usize;
            let dst_end = (cap + offset).clamp(0, cap) as usize;

            self.k[dst_base..dst_base + dst_start * hd].fill(0.0);
            self.v[dst_base..dst_base + dst_start * hd].fill(0.0);

            if dst_end > dst_start {
                let len = (dst_end - dst_start) * hd;
                let from = src_base + ((dst_start as isize - offset) as usize) * hd;
                let to = dst_base + dst_start * hd;
                self.k[to..to + len].copy_from_slice(&src.k[from..from + len]);
                self.v[to..to + len].copy_from_slice(&src.v[from..from + len]);
            }

            let tail = dst_end.max(dst_start);
            let cap = self.shape.capacity;
            self.k[dst_base + tail * hd..dst_base + cap * hd].fill(0.0);
            self.v[dst_base + tail * hd..dst_base + cap * hd].fill(0.0);
        }

        Ok(())
    }

    /// Keep positions `[start, end)` of every row, moved to the front.
    ///
    /// Everything from `end - start` onwards is zeroed and the fill size
    /// becomes `end - start`.
    pub fn retain_window(&mut self, start: usize, end: usize) -> KvResult<usize> {
        if start > end || end > self.shape.capacity {
            return Err(KvError::shape(
                format!("window within [0, {}]", self.shape.capacity),
                format!("[{start}, {end})"),
            ));
        }

        let hd = self.shape.head_dim;
        let len = end - start;
        for item in 0..self.shape.batch {
            for head in 0..self.shape.heads {
                let base = self.row_offset(item, head, 0);
                self.k
                    .copy_within(base + start * hd..base + end * hd, base);
                self.v
                    .copy_within(base + start * hd..base + end * hd, base);
                let cap = self.shape.capacity;
                self.k[base + len * hd..base + cap * hd].fill(0.0);
                self.v[base + len * hd..base + cap * hd].fill(0.0);
            }
        }
        self.size = len;

        Ok(len)
    }

    /// Add `k_delta`/`v_delta` (laid out `[heads, len, head_dim]`) elementwise to
    /// the first `len` positions of batch row `item`.
    pub fn add_to_prefix(&mut self, item: usize, k_delta: &[f32], v_delta: &[f32]) -> KvResult<()> {
        self.check_item(item)?;
        let per_head = self.shape.heads * self.shape.head_dim;
        if k_delta.len() != v_delta.len() || per_head == 0 || k_delta.len() % per_head != 0 {
            return Err(KvError::shape(
                format!("a multiple of {per_head} elements"),
                k_delta.len(),
            ));
        }

        let len = k_delta.len() / per_head;
        if len > self.shape.capacity {
            return Err(KvError::CapacityExceeded {
                requested: len,
                capacity: self.shape.capacity,
            });
        }

        let hd = self.shape.head_dim;
        for head in 0..self.shape.heads {
            let base = self.row_offset(item, head, 0);
            let src = head * len * hd;
            for (dst, add) in self.k[base..base + len * hd]
                .iter_mut()
                .zip(&k_delta[src..src + len * hd])
            {
                *dst += add;
            }
            for (dst, add) in self.v[base..base + len * hd]
                .iter_mut()
                .zip(&v_delta[src..src + len * hd])
            {
                *dst += add;
            }
        }

        Ok(())
    }

    /// Zero the buffers and reset the fill size.
    pub fn reset(&mut self) {
        self.k.fill(0.0);
        self.v.fill(0.0);
        self.size = 0;
    }

    /// Total memory allocated for K and V (in bytes).
    pub fn memory_bytes(&self) -> usize {
        (self.k.len() + self.v.len()) * std::mem::size_of::<f32>()
    }

    /// Memory holding valid positions (based on `size`, not capacity).
    pub fn active_memory_bytes(&self) -> usize {
        let used = self.size * self.shape.position_elements();
        used * 2 * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(shape: KvShape, steps: usize) -> LayerCache {
        let mut cache = LayerCache::new(shape);
        let per = shape.position_elements();
        for s in 0..steps {
            let k: Vec<f32> = (0..per).map(|i| (s * 100 + i) as f32).collect();
            let v: Vec<f32> = k.iter().map(|x| -x).collect();
            cache.append(&k, &v).unwrap();
        }
        cache
    }

    #[test]
    fn kv_shape_total_elements() {
        let shape = KvShape::new(2, 8, 128, 64);
        assert_eq!(shape.total_elements(), 2 * 8 * 128 * 64);
        assert_eq!(shape.position_elements(), 2 * 8 * 64);
    }

    #[test]
    fn layer_append_single_position() {
        let mut cache = LayerCache::new(KvShape::new(1, 2, 10, 4));
        cache.append(&[0.1; 8], &[0.2; 8]).unwrap();
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.key_at(0, 1, 0), &[0.1; 4]);
    }

    #[test]
    fn layer_append_multiple_positions_at_once() {
        let mut cache = LayerCache::new(KvShape::new(1, 2, 10, 4));
        cache.append(&[0.5; 24], &[0.5; 24]).unwrap();
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn layer_capacity_exceeded_when_full() {
        let mut cache = filled(KvShape::new(1, 1, 8, 2), 8);
        assert_eq!(cache.size(), 8);

        let result = cache.append(&[1.0; 2], &[1.0; 2]);
        assert_eq!(
            result,
            Err(KvError::CapacityExceeded {
                requested: 9,
                capacity: 8
            })
        );
        assert_eq!(cache.size(), 8);
    }

    #[test]
    fn layer_shape_mismatch_on_append() {
        let mut cache = LayerCache::new(KvShape::new(1, 2, 10, 4));
        let result = cache.append(&[0.1; 8], &[0.2; 7]);
        assert!(matches!(result, Err(KvError::ShapeMismatch { .. })));

        let result = cache.append(&[0.1; 7], &[0.2; 7]);
        assert!(matches!(result, Err(KvError::ShapeMismatch { .. })));
    }

    #[test]
    fn layer_overwrite_replaces_buffers() {
        let shape = KvShape::new(1, 1, 4, 2);
        let mut cache = LayerCache::new(shape);
        let k: Vec<f32> = (0..8).map(|i| i as f32).collect();
        cache.overwrite(&k, &k, 3).unwrap();
        assert_eq!(cache.size(), 3);
        assert_eq!(cache.keys(), k.as_slice());

        assert!(matches!(
            cache.overwrite(&k[..6], &k[..6], 1),
            Err(KvError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn layer_clone_into_copies_size_and_data() {
        let shape = KvShape::new(1, 2, 6, 2);
        let src = filled(shape, 3);
        let mut dst = LayerCache::new(shape);
        src.clone_into(&mut dst).unwrap();
        assert_eq!(dst.size(), 3);
        assert_eq!(dst.keys(), src.keys());
        assert_eq!(dst.values(), src.values());
    }

    #[test]
    fn layer_clone_into_rejects_other_shape() {
        let src = filled(KvShape::new(1, 2, 6, 2), 1);
        let mut dst = LayerCache::new(KvShape::new(1, 2, 6, 4));
        assert!(matches!(
            src.clone_into(&mut dst),
            Err(KvError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn copy_item_front_pads_with_positive_offset() {
        let shape = KvShape::new(1, 1, 5, 1);
        let src = filled(shape, 2);
        let mut dst = LayerCache::new(shape.with_batch(2));

        dst.copy_item_from(1, &src, 0, 3).unwrap();
        assert_eq!(dst.key_at(1, 0, 0), &[0.0]);
        assert_eq!(dst.key_at(1, 0, 2), &[0.0]);
        assert_eq!(dst.key_at(1, 0, 3), &[0.0]);
        assert_eq!(dst.key_at(1, 0, 4), &[100.0]);
    }

    #[test]
    fn copy_item_drops_leading_with_negative_offset() {
        let shape = KvShape::new(1, 1, 4, 1);
        let src = filled(shape, 4);
        let mut dst = LayerCache::new(shape);

        dst.copy_item_from(0, &src, 0, -2).unwrap();
        assert_eq!(dst.keys(), &[200.0, 300.0, 0.0, 0.0]);
        assert_eq!(dst.values(), &[-200.0, -300.0, 0.0, 0.0]);
    }

    #[test]
    fn copy_item_rejects_out_of_range_row() {
        let shape = KvShape::new(1, 1, 4, 1);
        let src = filled(shape, 1);
        let mut dst = LayerCache::new(shape);
        assert_eq!(
            dst.copy_item_from(1, &src, 0, 0),
            Err(KvError::ItemOutOfRange { index: 1, width: 1 })
        );
    }

    #[test]
    fn retain_window_moves_span_to_front() {
        let shape = KvShape::new(1, 1, 6, 1);
        let mut cache = filled(shape, 5);
        let len = cache.retain_window(2, 5).unwrap();
        assert_eq!(len, 3);
        assert_eq!(cache.size(), 3);
        assert_eq!(cache.keys(), &[200.0, 300.0, 400.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn add_to_prefix_accumulates() {
        let shape = KvShape::new(1, 2, 3, 1);
        let mut cache = LayerCache::new(shape);
        cache
            .add_to_prefix(0, &[1.0, 2.0, 3.0, 4.0], &[0.5; 4])
            .unwrap();
        // head 0 positions 0..2, head 1 positions 0..2
        assert_eq!(cache.keys(), &[1.0, 2.0, 0.0, 3.0, 4.0, 0.0]);
        assert_eq!(cache.values(), &[0.5, 0.5, 0.0, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn layer_reset_zeroes() {
        let mut cache = filled(KvShape::new(1, 2, 4, 2), 2);
        cache.reset();
        assert_eq!(cache.size(), 0);
        assert!(cache.keys().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn layer_memory_bytes_calculation() {
        let cache = LayerCache::new(KvShape::new(1, 2, 10, 4));
        let expected_bytes = 2 * 80 * std::mem::size_of::<f32>();
        assert_eq!(cache.memory_bytes(), expected_bytes);
    }

    #[test]
    fn layer_active_memory_bytes() {
        let cache = filled(KvShape::new(1, 2, 10, 4), 3);
        let expected = 3 * 2 * 4 * 2 * std::mem::size_of::<f32>();
        assert_eq!(cache.active_memory_bytes(), expected);
    }

    #[test]
    fn shape_display() {
        assert_eq!(
            KvShape::new(1, 4, 16, 8).to_string(),
            "[batch:1, heads:4, seq:16, dim:8]"
        );
        assert_eq!(Device::Metal.to_string(), "metal");
    }
}
