/// Numerically stable softmax: subtract the maximum, exponentiate, normalize.
///
/// A row of all `-inf` is left as zeros rather than NaN.
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        x.fill(0.0);
        return;
    }

    let mut sum = 0.0;
    for val in x.iter_mut() {
        *val = (*val - max).exp();
        sum += *val;
    }

    let inv_sum = 1.0 / sum;
    for val in x.iter_mut() {
        *val *= inv_sum;
    }
}

/// Dot product, accumulated left to right
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// `y += alpha * x`
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    for (yi, &xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

/// Simple 64-bit Xorshift random number generator
pub fn xorshift64(mut seed: u64) -> u64 {
    seed ^= seed << 13;
    seed ^= seed >> 7;
    seed ^= seed << 17;
    seed
}

/// Fill `out` with deterministic values in `[-1, 1)` from `seed`
pub fn fill_uniform(out: &mut [f32], seed: u64) {
    let mut state = seed | 1;
    for v in out.iter_mut() {
        state = xorshift64(state);
        *v = ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0;
    }
}
