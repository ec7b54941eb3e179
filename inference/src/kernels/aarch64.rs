use std::arch::aarch64::*;

use super::{blend, check_matmul, KernelProvider, ScalarKernel};
use crate::error::Result;
use crate::quant::{check_matvec_q4, nibble_at};

const LANES: usize = 4;

/// 4-wide NEON kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct NeonKernel;

impl NeonKernel {
    fn detected() -> bool {
        std::arch::is_aarch64_feature_detected!("neon")
    }
}

impl KernelProvider for NeonKernel {
    fn name(&self) -> &'static str {
        "neon"
    }

    fn is_available(&self) -> bool {
        Self::detected()
    }

    fn matmul(
        &self,
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        m: usize,
        k: usize,
        n: usize,
        alpha: f32,
        beta: f32,
    ) -> Result<()> {
        if !Self::detected() {
            return ScalarKernel.matmul(a, b, c, m, k, n, alpha, beta);
        }
        check_matmul(a, b, c, m, k, n)?;
        // SAFETY: feature checked above, slice lengths validated
        unsafe { matmul_neon(a, b, c, m, k, n, alpha, beta) };
        Ok(())
    }

    fn matvec(
        &self,
        a: &[f32],
        x: &[f32],
        y: &mut [f32],
        m: usize,
        k: usize,
        alpha: f32,
        beta: f32,
    ) -> Result<()> {
        if !Self::detected() {
            return ScalarKernel.matvec(a, x, y, m, k, alpha, beta);
        }
        check_matmul(a, x, y, m, k, 1)?;
        for (i, out) in y.iter_mut().enumerate() {
            // SAFETY: feature checked above, row and x both have k values
            let acc = unsafe { dot_product_f32_neon(&a[i * k..(i + 1) * k], x) };
            *out = blend(acc, *out, alpha, beta);
        }
        Ok(())
    }

    fn matvec_q4(
        &self,
        packed: &[u8],
        scales: &[f32],
        x: &[f32],
        y: &mut [f32],
        rows: usize,
        cols: usize,
    ) -> Result<()> {
        if !Self::detected() {
            return ScalarKernel.matvec_q4(packed, scales, x, y, rows, cols);
        }
        check_matvec_q4(packed, scales, x, y, rows, cols)?;
        let mut lanes = [0.0f32; LANES];
        for (row, out) in y.iter_mut().enumerate() {
            let base = row * cols;
            let mut sum = 0.0f32;
            let mut k = 0;
            while k + LANES <= cols {
                for (lane, slot) in lanes.iter_mut().enumerate() {
                    *slot = nibble_at(packed, base + k + lane) as f32;
                }
                // SAFETY: feature checked above, k + 4 <= cols == x.len()
                sum += unsafe { dot_product_f32_neon(&lanes, &x[k..k + LANES]) };
                k += LANES;
            }
            while k < cols {
                sum += nibble_at(packed, base + k) as f32 * x[k];
                k += 1;
            }
            *out = scales[row] * sum;
        }
        Ok(())
    }
}

#[target_feature(enable = "neon")]
#[allow(clippy::too_many_arguments)]
unsafe fn matmul_neon(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
    alpha: f32,
    beta: f32,
) {
    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        let mut j = 0;

        while j + LANES <= n {
            let mut acc = vdupq_n_f32(0.0);
            for (l, &av) in row.iter().enumerate() {
                let vb = vld1q_f32(b.as_ptr().add(l * n + j));
                acc = vfmaq_n_f32(acc, vb, av);
            }
            let dst = c.as_mut_ptr().add(i * n + j);
            let scaled = vmulq_n_f32(acc, alpha);
            let out = if beta == 0.0 {
                scaled
            } else {
                vfmaq_n_f32(scaled, vld1q_f32(dst), beta)
            };
            vst1q_f32(dst, out);
            j += LANES;
        }

        while j < n {
            let mut acc = 0.0f32;
            for (l, &av) in row.iter().enumerate() {
                acc += av * b[l * n + j];
            }
            let out = &mut c[i * n + j];
            *out = blend(acc, *out, alpha, beta);
            j += 1;
        }
    }
}

#[target_feature(enable = "neon")]
pub unsafe fn dot_product_f32_neon(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let mut sumv = vdupq_n_f32(0.0);
    let mut i = 0;

    while i + LANES <= n {
        let va = vld1q_f32(a.as_ptr().add(i));
        let vb = vld1q_f32(b.as_ptr().add(i));
        sumv = vfmaq_f32(sumv, va, vb);
        i += LANES;
    }

    let mut final_sum = vaddvq_f32(sumv);

    while i < n {
        final_sum += a[i] * b[i];
        i += 1;
    }

    final_sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fill_uniform;

    #[test]
    fn test_neon_matches_scalar() {
        if !NeonKernel.is_available() {
            return;
        }
        for (seed, &(m, k, n)) in [(2, 2, 2), (7, 9, 11), (16, 16, 16), (33, 33, 33)]
            .iter()
            .enumerate()
        {
            let mut a = vec![0.0f32; m * k];
            let mut b = vec![0.0f32; k * n];
            fill_uniform(&mut a, seed as u64 + 3);
            fill_uniform(&mut b, seed as u64 + 57);
            let mut want = vec![1.0f32; m * n];
            let mut got = want.clone();
            ScalarKernel.matmul(&a, &b, &mut want, m, k, n, 1.0, 0.25).unwrap();
            NeonKernel.matmul(&a, &b, &mut got, m, k, n, 1.0, 0.25).unwrap();
            for (g, w) in got.iter().zip(want.iter()) {
                assert!((g - w).abs() <= 1e-4 * w.abs().max(1.0), "{} vs {}", g, w);
            }
        }
    }
}
