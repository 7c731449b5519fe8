//! Integration tests for latentkv-kv.
//!
//! Validates:
//! - Bulk append equals step-by-step append
//! - Capacity boundary (exactly full, one past full)
//! - Row shifting between batched and single-item caches
//! - Window retention across all layers
//! - Memory accounting

use latentkv_kv::*;
use proptest::prelude::*;

/// Deltas for `t` positions laid out `[batch, heads, t, head_dim]`, value
/// encoding `(item, head, pos, d)`.
fn positions(shape: KvShape, t: usize, first_pos: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(shape.batch * shape.heads * t * shape.head_dim);
    for item in 0..shape.batch {
        for head in 0..shape.heads {
            for pos in 0..t {
                for d in 0..shape.head_dim {
                    out.push(
                        (item * 1000 + head * 100 + (first_pos + pos) * 10 + d) as f32,
                    );
                }
            }
        }
    }
    out
}

// ===========================================================================
// Append equivalence
// ===========================================================================

#[test]
fn bulk_append_matches_sequential_append() {
    let shape = KvShape::new(2, 3, 8, 4);

    let mut bulk = LayerCache::new(shape);
    let k = positions(shape, 5, 0);
    bulk.append(&k, &k).unwrap();

    let mut sequential = LayerCache::new(shape);
    for pos in 0..5 {
        let step = positions(shape, 1, pos);
        sequential.append(&step, &step).unwrap();
    }

    assert_eq!(bulk.size(), 5);
    assert_eq!(bulk.keys(), sequential.keys());
    assert_eq!(bulk.values(), sequential.values());
}

#[test]
fn positions_beyond_size_stay_zero() {
    let shape = KvShape::new(1, 2, 6, 2);
    let mut cache = LayerCache::new(shape);
    let k = positions(shape, 3, 0);
    cache.append(&k, &k).unwrap();

    for head in 0..2 {
        for pos in 3..6 {
            assert!(cache.key_at(0, head, pos).iter().all(|&x| x == 0.0));
            assert!(cache.value_at(0, head, pos).iter().all(|&x| x == 0.0));
        }
    }
}

// ===========================================================================
// Capacity
// ===========================================================================

#[test]
fn fill_to_capacity_then_overflow() {
    let shape = KvShape::new(1, 1, 8, 2);
    let mut ctx = ContextCache::new(2, shape, Device::Cpu);
    let step = [0.5f32, 0.5];

    for _ in 0..8 {
        ctx.append_step(&[&step, &step], &[&step, &step]).unwrap();
    }
    assert_eq!(ctx.size(), 8);
    assert_eq!(ctx.remaining(), 0);

    let err = ctx
        .append_step(&[&step, &step], &[&step, &step])
        .unwrap_err();
    assert_eq!(
        err,
        KvError::CapacityExceeded {
            requested: 9,
            capacity: 8
        }
    );
    assert_eq!(ctx.size(), 8);
    assert_eq!(ctx.check_coherent(), Ok(8));
}

#[test]
fn overwrite_rejects_size_beyond_capacity() {
    let shape = KvShape::new(1, 1, 4, 1);
    let mut cache = LayerCache::new(shape);
    let buf = vec![1.0; shape.total_elements()];
    assert!(matches!(
        cache.overwrite(&buf, &buf, 5),
        Err(KvError::CapacityExceeded { .. })
    ));
    assert_eq!(cache.size(), 0);
}

// ===========================================================================
// Row movement
// ===========================================================================

#[test]
fn pad_then_unpad_restores_row() {
    let shape = KvShape::new(1, 2, 8, 2);
    let mut src = ContextCache::new(2, shape, Device::Cpu);
    for pos in 0..3 {
        let step = positions(shape, 1, pos);
        src.append_step(&[&step, &step], &[&step, &step]).unwrap();
    }

    let mut padded = src.zeros_like();
    padded.copy_item_from(0, &src, 0, 4).unwrap();
    padded.set_size(7).unwrap();

    let mut restored = src.zeros_like();
    restored.copy_item_from(0, &padded, 0, -4).unwrap();
    restored.set_size(3).unwrap();

    for layer in 0..2 {
        assert_eq!(
            restored.for_layer(layer).unwrap().keys(),
            src.for_layer(layer).unwrap().keys()
        );
    }
}

#[test]
fn copy_between_batch_widths() {
    let wide = KvShape::new(3, 1, 4, 2);
    let mut batched = ContextCache::new(1, wide, Device::Cpu);
    let step = positions(wide, 1, 0);
    batched.append_step(&[&step], &[&step]).unwrap();

    let mut single = ContextCache::new(1, wide.with_batch(1), Device::Cpu);
    batched.extract_item(2, &mut single).unwrap();
    assert_eq!(single.size(), 1);
    assert_eq!(single.for_layer(0).unwrap().key_at(0, 0, 0), &[2000.0, 2001.0]);
}

#[test]
fn copy_rejects_incompatible_rows() {
    let mut dst = ContextCache::new(1, KvShape::new(1, 2, 4, 2), Device::Cpu);
    let src = ContextCache::new(1, KvShape::new(1, 2, 6, 2), Device::Cpu);
    assert!(matches!(
        dst.copy_item_from(0, &src, 0, 0),
        Err(KvError::ShapeMismatch { .. })
    ));
}

#[test]
fn copy_rejects_out_of_range_item() {
    let shape = KvShape::new(2, 1, 4, 1);
    let mut dst = ContextCache::new(1, shape, Device::Cpu);
    let src = ContextCache::new(1, shape, Device::Cpu);
    assert_eq!(
        dst.copy_item_from(2, &src, 0, 0),
        Err(KvError::ItemOutOfRange { index: 2, width: 2 })
    );
}

// ===========================================================================
// Window retention
// ===========================================================================

#[test]
fn retain_window_applies_to_every_layer() {
    let shape = KvShape::new(1, 1, 8, 1);
    let mut ctx = ContextCache::new(3, shape, Device::Cpu);
    for pos in 0..7 {
        let step = [pos as f32];
        ctx.append_step(&[&step, &step, &step], &[&step, &step, &step])
            .unwrap();
    }

    let len = ctx.retain_window(2, 7).unwrap();
    assert_eq!(len, 5);
    assert_eq!(ctx.check_coherent(), Ok(5));
    for layer in ctx.layers() {
        assert_eq!(layer.keys(), &[2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0, 0.0]);
    }
}

#[test]
fn retain_window_rejects_inverted_range() {
    let mut ctx = ContextCache::new(1, KvShape::new(1, 1, 4, 1), Device::Cpu);
    assert!(ctx.retain_window(3, 2).is_err());
    assert!(ctx.retain_window(0, 5).is_err());
}

// ===========================================================================
// Memory accounting
// ===========================================================================

#[test]
fn memory_accounting_tracks_fill() {
    let shape = KvShape::new(1, 2, 10, 4);
    let mut ctx = ContextCache::new(2, shape, Device::Cpu);
    // 2 layers * 2 buffers * 80 elements * 4 bytes
    assert_eq!(ctx.memory_bytes(), 2 * 2 * 80 * 4);
    assert_eq!(ctx.active_memory_bytes(), 0);

    let step = vec![1.0; 8];
    ctx.append_step(&[&step, &step], &[&step, &step]).unwrap();
    assert_eq!(ctx.active_memory_bytes(), 2 * 2 * 8 * 4);

    ctx.reset();
    assert_eq!(ctx.size(), 0);
    assert_eq!(ctx.active_memory_bytes(), 0);
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #[test]
    fn shifted_copy_keeps_only_in_range_positions(size in 0usize..8, offset in -8isize..8) {
        let shape = KvShape::new(1, 1, 8, 1);
        let mut src = LayerCache::new(shape);
        let data: Vec<f32> = (1..=size).map(|p| p as f32).collect();
        src.append(&data, &data).unwrap();

        let mut dst = LayerCache::new(shape);
        dst.copy_item_from(0, &src, 0, offset).unwrap();

        for t in 0..8isize {
            let from = t - offset;
            let expected = if (0..size as isize).contains(&from) {
                (from + 1) as f32
            } else {
                0.0
            };
            prop_assert_eq!(dst.key_at(0, 0, t as usize)[0], expected);
        }
    }
}
