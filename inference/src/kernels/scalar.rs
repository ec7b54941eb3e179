use super::{blend, check_matmul, KernelProvider};
use crate::error::Result;
use crate::ops::dot;
use crate::quant::{check_matvec_q4, matvec_q4_unchecked};

/// Portable reference kernel; every other variant is checked against it
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarKernel;

impl KernelProvider for ScalarKernel {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn is_available(&self) -> bool {
        true
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
        check_matmul(a, b, c, m, k, n)?;
        for i in 0..m {
            let row = &a[i * k..(i + 1) * k];
            for j in 0..n {
                let mut acc = 0.0f32;
                for (l, &av) in row.iter().enumerate() {
                    acc += av * b[l * n + j];
                }
                let out = &mut c[i * n + j];
                *out = blend(acc, *out, alpha, beta);
            }
        }
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
        check_matmul(a, x, y, m, k, 1)?;
        for (i, out) in y.iter_mut().enumerate() {
            let acc = dot(&a[i * k..(i + 1) * k], x);
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
        check_matvec_q4(packed, scales, x, y, rows, cols)?;
        matvec_q4_unchecked(packed, scales, x, y, rows, cols);
        Ok(())
    }
}
