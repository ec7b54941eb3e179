//! AVX2 and AVX-512 kernels
//!
//! Each provider checks CPU features at runtime in `is_available` and again
//! before entering `#[target_feature]` code, so calling one on a host without
//! the feature falls back to the scalar path instead of faulting.

use std::arch::x86_64::*;

use super::{blend, check_matmul, KernelProvider, ScalarKernel};
use crate::error::Result;
use crate::quant::{check_matvec_q4, nibble_at};

const LANES: usize = 8;

/// 8-wide AVX2 + FMA kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct Avx2Kernel;

impl Avx2Kernel {
    fn detected() -> bool {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }
}

impl KernelProvider for Avx2Kernel {
    fn name(&self) -> &'static str {
        "avx2"
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
        // SAFETY: features checked above, slice lengths validated
        unsafe { matmul_avx2(a, b, c, m, k, n, alpha, beta) };
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
            // SAFETY: features checked above, row and x both have k values
            let acc = unsafe { dot_product_f32_avx2(&a[i * k..(i + 1) * k], x) };
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
        // SAFETY: features checked above, buffer sizes validated
        unsafe { matvec_q4_avx2(packed, scales, x, y, rows, cols) };
        Ok(())
    }
}

#[target_feature(enable = "avx2,fma")]
#[allow(clippy::too_many_arguments)]
unsafe fn matmul_avx2(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
    alpha: f32,
    beta: f32,
) {
    let valpha = _mm256_set1_ps(alpha);
    let vbeta = _mm256_set1_ps(beta);

    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        let mut j = 0;

        while j + LANES <= n {
            let mut acc = _mm256_setzero_ps();
            for (l, &av) in row.iter().enumerate() {
                let vb = _mm256_loadu_ps(b.as_ptr().add(l * n + j));
                acc = _mm256_fmadd_ps(_mm256_set1_ps(av), vb, acc);
            }
            let dst = c.as_mut_ptr().add(i * n + j);
            let scaled = _mm256_mul_ps(acc, valpha);
            let out = if beta == 0.0 {
                scaled
            } else {
                _mm256_fmadd_ps(_mm256_loadu_ps(dst), vbeta, scaled)
            };
            _mm256_storeu_ps(dst, out);
            j += LANES;
        }

        // Remaining columns
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

#[target_feature(enable = "avx2,fma")]
pub unsafe fn dot_product_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let mut sum = _mm256_setzero_ps();
    let mut i = 0;

    while i + LANES <= n {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        sum = _mm256_fmadd_ps(va, vb, sum);
        i += LANES;
    }

    let mut res = [0.0f32; LANES];
    _mm256_storeu_ps(res.as_mut_ptr(), sum);
    let mut final_sum = res.iter().sum::<f32>();

    while i < n {
        final_sum += a[i] * b[i];
        i += 1;
    }

    final_sum
}

#[target_feature(enable = "avx2,fma")]
unsafe fn matvec_q4_avx2(
    packed: &[u8],
    scales: &[f32],
    x: &[f32],
    y: &mut [f32],
    rows: usize,
    cols: usize,
) {
    let mut lanes = [0.0f32; LANES];

    for (row, out) in y.iter_mut().enumerate().take(rows) {
        let base = row * cols;
        let mut acc = _mm256_setzero_ps();
        let mut k = 0;

        while k + LANES <= cols {
            for (lane, slot) in lanes.iter_mut().enumerate() {
                *slot = nibble_at(packed, base + k + lane) as f32;
            }
            let vq = _mm256_loadu_ps(lanes.as_ptr());
            let vx = _mm256_loadu_ps(x.as_ptr().add(k));
            acc = _mm256_fmadd_ps(vq, vx, acc);
            k += LANES;
        }

        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
        let mut sum = lanes.iter().sum::<f32>();
        while k < cols {
            sum += nibble_at(packed, base + k) as f32 * x[k];
            k += 1;
        }
        *out = scales[row] * sum;
    }
}

#[cfg(feature = "avx512")]
pub use avx512::Avx512Kernel;

#[cfg(feature = "avx512")]
mod avx512 {
    use std::arch::x86_64::*;

    use super::super::{blend, check_matmul, KernelProvider, ScalarKernel};
    use crate::error::Result;
    use crate::quant::{check_matvec_q4, nibble_at};

    const LANES: usize = 16;

    /// 16-wide AVX-512F kernel
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Avx512Kernel;

    impl Avx512Kernel {
        fn detected() -> bool {
            is_x86_feature_detected!("avx512f")
        }
    }

    impl KernelProvider for Avx512Kernel {
        fn name(&self) -> &'static str {
            "avx512"
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
            unsafe { matmul_avx512(a, b, c, m, k, n, alpha, beta) };
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
                let acc = unsafe { dot_product_f32_avx512(&a[i * k..(i + 1) * k], x) };
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
                    // SAFETY: feature checked above, k + 16 <= cols == x.len()
                    sum += unsafe { dot_product_f32_avx512(&lanes, &x[k..k + LANES]) };
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

    #[target_feature(enable = "avx512f")]
    #[allow(clippy::too_many_arguments)]
    unsafe fn matmul_avx512(
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        m: usize,
        k: usize,
        n: usize,
        alpha: f32,
        beta: f32,
    ) {
        let valpha = _mm512_set1_ps(alpha);
        let vbeta = _mm512_set1_ps(beta);

        for i in 0..m {
            let row = &a[i * k..(i + 1) * k];
            let mut j = 0;

            while j + LANES <= n {
                let mut acc = _mm512_setzero_ps();
                for (l, &av) in row.iter().enumerate() {
                    let vb = _mm512_loadu_ps(b.as_ptr().add(l * n + j));
                    acc = _mm512_fmadd_ps(_mm512_set1_ps(av), vb, acc);
                }
                let dst = c.as_mut_ptr().add(i * n + j);
                let scaled = _mm512_mul_ps(acc, valpha);
                let out = if beta == 0.0 {
                    scaled
                } else {
                    _mm512_fmadd_ps(_mm512_loadu_ps(dst), vbeta, scaled)
                };
                _mm512_storeu_ps(dst, out);
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

    #[target_feature(enable = "avx512f")]
    unsafe fn dot_product_f32_avx512(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let mut sum = _mm512_setzero_ps();
        let mut i = 0;

        while i + LANES <= n {
            let va = _mm512_loadu_ps(a.as_ptr().add(i));
            let vb = _mm512_loadu_ps(b.as_ptr().add(i));
            sum = _mm512_fmadd_ps(va, vb, sum);
            i += LANES;
        }

        let mut final_sum = _mm512_reduce_add_ps(sum);
        while i < n {
            final_sum += a[i] * b[i];
            i += 1;
        }
        final_sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fill_uniform;
    use crate::quant::QuantizedMatrix;

    const SIZES: &[(usize, usize, usize)] = &[
        (2, 2, 2),
        (8, 8, 8),
        (16, 16, 16),
        (7, 9, 11),
        (32, 32, 32),
        (33, 33, 33),
    ];

    fn parity(kernel: &dyn KernelProvider) {
        for (seed, &(m, k, n)) in SIZES.iter().enumerate() {
            let mut a = vec![0.0f32; m * k];
            let mut b = vec![0.0f32; k * n];
            let mut prev = vec![0.0f32; m * n];
            fill_uniform(&mut a, seed as u64 + 1);
            fill_uniform(&mut b, seed as u64 + 100);
            fill_uniform(&mut prev, seed as u64 + 200);

            for &(alpha, beta) in &[(1.0f32, 0.0f32), (0.5, 2.0)] {
                let mut want = prev.clone();
                let mut got = prev.clone();
                ScalarKernel.matmul(&a, &b, &mut want, m, k, n, alpha, beta).unwrap();
                kernel.matmul(&a, &b, &mut got, m, k, n, alpha, beta).unwrap();
                assert_close(&got, &want, kernel.name(), (m, k, n));
            }

            let x: Vec<f32> = b[..k].to_vec();
            let mut want = prev[..m].to_vec();
            let mut got = want.clone();
            ScalarKernel.matvec(&a, &x, &mut want, m, k, 1.0, 1.0).unwrap();
            kernel.matvec(&a, &x, &mut got, m, k, 1.0, 1.0).unwrap();
            assert_close(&got, &want, kernel.name(), (m, k, 1));

            let q = QuantizedMatrix::quantize(&a, m, k).unwrap();
            let mut want = vec![0.0f32; m];
            let mut got = vec![0.0f32; m];
            q.matvec_with(&ScalarKernel, &x, &mut want).unwrap();
            q.matvec_with(kernel, &x, &mut got).unwrap();
            assert_close(&got, &want, kernel.name(), (m, k, 1));
        }
    }

    fn assert_close(got: &[f32], want: &[f32], name: &str, dims: (usize, usize, usize)) {
        for (g, w) in got.iter().zip(want.iter()) {
            assert!(
                (g - w).abs() <= 1e-4 * w.abs().max(1.0),
                "{} {:?}: {} vs {}",
                name,
                dims,
                g,
                w
            );
        }
    }

    #[test]
    fn test_avx2_matches_scalar() {
        if !Avx2Kernel.is_available() {
            return;
        }
        parity(&Avx2Kernel);
    }

    #[cfg(feature = "avx512")]
    #[test]
    fn test_avx512_matches_scalar() {
        if !Avx512Kernel.is_available() {
            return;
        }
        parity(&Avx512Kernel);
    }

    #[test]
    fn test_dot_product_tail() {
        if !Avx2Kernel.is_available() {
            return;
        }
        let a: Vec<f32> = (0..11).map(|i| i as f32).collect();
        let b = vec![1.0f32; 11];
        let got = unsafe { dot_product_f32_avx2(&a, &b) };
        assert_eq!(got, 55.0);
    }
}
