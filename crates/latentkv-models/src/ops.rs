//! Dense kernels for the reference model.

/// Matrix-vector multiply: `x @ W` where `W` is `[in_dim, out_dim]` row-major.
pub fn matvec(x: &[f32], w: &[f32], in_dim: usize, out_dim: usize) -> Vec<f32> {
    debug_assert_eq!(x.len(), in_dim);
    debug_assert_eq!(w.len(), in_dim * out_dim);
    let mut out = vec![0.0; out_dim];
    for (j, &xj) in x.iter().enumerate() {
        let row = &w[j * out_dim..(j + 1) * out_dim];
        for (o, &wji) in out.iter_mut().zip(row) {
            *o += xj * wji;
        }
    }
    out
}

/// Root mean square normalization with unit weight.
pub fn rms_norm(x: &[f32], eps: f32) -> Vec<f32> {
    let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len().max(1) as f32;
    let rms = (mean_sq + eps).sqrt();
    x.iter().map(|v| v / rms).collect()
}

/// Numerically stable softmax.
pub fn softmax(scores: &mut [f32]) {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        for s in scores.iter_mut() {
            *s /= sum;
        }
    }
}

/// Rotary position embedding over `(x[2i], x[2i+1])` pairs of each head.
#[derive(Debug, Clone)]
pub struct Rope {
    inv_freq: Vec<f32>,
}

impl Rope {
    /// `head_dim` must be even.
    pub fn new(head_dim: usize, theta: f32) -> Self {
        let inv_freq = (0..head_dim / 2)
            .map(|i| 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32))
            .collect();
        Self { inv_freq }
    }

    /// Rotate every head of `x` (laid out `[heads, head_dim]`) in place.
    pub fn rotate(&self, x: &mut [f32], heads: usize, position: usize) {
        let hd = self.inv_freq.len() * 2;
        for h in 0..heads {
            let base = h * hd;
            for (i, &freq) in self.inv_freq.iter().enumerate() {
                let (sin, cos) = (position as f32 * freq).sin_cos();
                let a = x[base + 2 * i];
                let b = x[base + 2 * i + 1];
                x[base + 2 * i] = a * cos - b * sin;
                x[base + 2 * i + 1] = a * sin + b * cos;
            }
        }
    }
}
