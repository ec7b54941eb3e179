//! Row-wise 4-bit quantization
//!
//! An `M x K` matrix is stored as `M` float scales plus `ceil(M*K/2)` bytes.
//! Elements are packed in row-major order over the flattened index `i`:
//! element `i` lives in byte `i / 2`, in the low nibble when `i` is even.
//! A nibble decodes to a signed integer in `[-8, 7]` and the weight is that
//! integer times the row scale.

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernels::{self, KernelProvider};
use crate::tensor::Tensor;

pub const Q4_MIN: i8 = -8;
pub const Q4_MAX: i8 = 7;

/// Sign-extend a 4-bit value; `8..=15` map to `-8..=-1`
#[inline]
pub fn decode_nibble(nib: u8) -> i8 {
    let nib = nib & 0x0F;
    if nib & 0x08 != 0 {
        nib as i8 - 16
    } else {
        nib as i8
    }
}

/// Quantize one weight against its row scale
#[inline]
pub fn encode_nibble(weight: f32, scale: f32) -> u8 {
    let q = (weight / scale).round().clamp(Q4_MIN as f32, Q4_MAX as f32) as i8;
    (q as u8) & 0x0F
}

/// Decoded integer of flat element `index`
#[inline]
pub fn nibble_at(packed: &[u8], index: usize) -> i8 {
    let byte = packed[index / 2];
    if index % 2 == 0 {
        decode_nibble(byte)
    } else {
        decode_nibble(byte >> 4)
    }
}

pub fn packed_len(rows: usize, cols: usize) -> usize {
    (rows * cols).div_ceil(2)
}

/// Pack `weights[rows x cols]` with externally supplied per-row `scales`
pub fn pack(weights: &[f32], scales: &[f32], rows: usize, cols: usize) -> Result<Vec<u8>> {
    check_matrix("pack", weights.len(), rows, cols)?;
    check_scales(scales, rows)?;

    let mut packed = vec![0u8; packed_len(rows, cols)];
    for m in 0..rows {
        let scale = scales[m];
        for k in 0..cols {
            let i = m * cols + k;
            let nib = encode_nibble(weights[i], scale);
            if i % 2 == 0 {
                packed[i / 2] |= nib;
            } else {
                packed[i / 2] |= nib << 4;
            }
        }
    }
    Ok(packed)
}

/// Inverse of [`pack`], up to quantization error
pub fn dequantize(packed: &[u8], scales: &[f32], rows: usize, cols: usize) -> Result<Vec<f32>> {
    let mut out = vec![0.0f32; rows * cols];
    dequantize_into(packed, scales, rows, cols, &mut out)?;
    Ok(out)
}

pub fn dequantize_into(
    packed: &[u8],
    scales: &[f32],
    rows: usize,
    cols: usize,
    out: &mut [f32],
) -> Result<()> {
    check_packed("dequantize", packed.len(), scales.len(), rows, cols)?;
    check_matrix("dequantize", out.len(), rows, cols)?;

    for m in 0..rows {
        let scale = scales[m];
        for k in 0..cols {
            let i = m * cols + k;
            out[i] = nibble_at(packed, i) as f32 * scale;
        }
    }
    Ok(())
}

/// Reference quantized matrix-vector product: `y[m] = scale[m] * sum_k q[m,k] * x[k]`.
///
/// The row scale is applied once to the accumulated sum.
pub fn matvec_q4(
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

pub(crate) fn matvec_q4_unchecked(
    packed: &[u8],
    scales: &[f32],
    x: &[f32],
    y: &mut [f32],
    rows: usize,
    cols: usize,
) {
    for m in 0..rows {
        let base = m * cols;
        let mut sum = 0.0f32;
        for (k, &xk) in x.iter().enumerate() {
            sum += nibble_at(packed, base + k) as f32 * xk;
        }
        y[m] = scales[m] * sum;
    }
}

/// Per-row scale `max|w| / 7`, or `1.0` for an all-zero row
pub fn row_scales(weights: &[f32], rows: usize, cols: usize) -> Result<Vec<f32>> {
    check_matrix("row_scales", weights.len(), rows, cols)?;
    Ok((0..rows)
        .map(|m| {
            let max_abs = weights[m * cols..(m + 1) * cols]
                .iter()
                .fold(0.0f32, |acc, w| acc.max(w.abs()));
            if max_abs > 0.0 {
                max_abs / Q4_MAX as f32
            } else {
                1.0
            }
        })
        .collect())
}

pub(crate) fn check_matvec_q4(
    packed: &[u8],
    scales: &[f32],
    x: &[f32],
    y: &[f32],
    rows: usize,
    cols: usize,
) -> Result<()> {
    check_packed("matvec_q4", packed.len(), scales.len(), rows, cols)?;
    if x.len() != cols {
        return Err(Error::shape_mismatch(
            "matvec_q4",
            format!("input has {} elements, matrix has {} columns", x.len(), cols),
        ));
    }
    if y.len() != rows {
        return Err(Error::shape_mismatch(
            "matvec_q4",
            format!("output has {} elements, matrix has {} rows", y.len(), rows),
        ));
    }
    Ok(())
}

fn check_matrix(op: &'static str, len: usize, rows: usize, cols: usize) -> Result<()> {
    if rows.checked_mul(cols) != Some(len) {
        return Err(Error::shape_mismatch(
            op,
            format!("{} values for a {}x{} matrix", len, rows, cols),
        ));
    }
    Ok(())
}

fn check_packed(op: &'static str, packed: usize, scales: usize, rows: usize, cols: usize) -> Result<()> {
    let numel = rows
        .checked_mul(cols)
        .ok_or_else(|| Error::shape_mismatch(op, format!("{}x{} overflows", rows, cols)))?;
    if packed != numel.div_ceil(2) {
        return Err(Error::shape_mismatch(
            op,
            format!("{} packed bytes for a {}x{} matrix", packed, rows, cols),
        ));
    }
    if scales != rows {
        return Err(Error::shape_mismatch(
            op,
            format!("{} scales for {} rows", scales, rows),
        ));
    }
    Ok(())
}

fn check_scales(scales: &[f32], rows: usize) -> Result<()> {
    if scales.len() != rows {
        return Err(Error::shape_mismatch(
            "pack",
            format!("{} scales for {} rows", scales.len(), rows),
        ));
    }
    for (row, &scale) in scales.iter().enumerate() {
        if !scale.is_finite() || scale == 0.0 {
            return Err(Error::InvalidScale { row, scale });
        }
    }
    Ok(())
}

/// A weight matrix held in 4-bit form
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedMatrix {
    rows: usize,
    cols: usize,
    packed: Vec<u8>,
    scales: Vec<f32>,
}

impl QuantizedMatrix {
    /// Pack with caller-chosen scales
    pub fn pack(weights: &[f32], scales: &[f32], rows: usize, cols: usize) -> Result<Self> {
        let packed = pack(weights, scales, rows, cols)?;
        Ok(Self {
            rows,
            cols,
            packed,
            scales: scales.to_vec(),
        })
    }

    /// Pack with scales from [`row_scales`]
    pub fn quantize(weights: &[f32], rows: usize, cols: usize) -> Result<Self> {
        let scales = row_scales(weights, rows, cols)?;
        Self::pack(weights, &scales, rows, cols)
    }

    pub fn from_parts(rows: usize, cols: usize, packed: Vec<u8>, scales: Vec<f32>) -> Result<Self> {
        check_packed("QuantizedMatrix", packed.len(), scales.len(), rows, cols)?;
        Ok(Self {
            rows,
            cols,
            packed,
            scales,
        })
    }

    /// Assemble from a `Q4 [rows, cols]` tensor and an `FP32 [rows]` scale tensor
    pub fn from_tensors(weight: &Tensor, scales: &Tensor) -> Result<Self> {
        let (rows, cols) = match weight.dims() {
            &[rows, cols] => (rows, cols),
            other => {
                return Err(Error::shape_mismatch(
                    "QuantizedMatrix",
                    format!("weight must be 2-D, got {:?}", other),
                ))
            }
        };
        if scales.dims() != [rows] {
            return Err(Error::shape_mismatch(
                "QuantizedMatrix",
                format!("scales {} for {} rows", scales.shape(), rows),
            ));
        }
        Self::from_parts(
            rows,
            cols,
            weight.packed()?.to_vec(),
            scales.as_slice::<f32>()?.to_vec(),
        )
    }

    /// `Q4 [rows, cols]` tensor over the packed bytes
    pub fn to_tensor(&self) -> Result<Tensor> {
        Tensor::from_bytes(&[self.rows, self.cols], DType::Q4, &self.packed)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn packed(&self) -> &[u8] {
        &self.packed
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// Decoded integer at `(row, col)`
    pub fn decoded(&self, row: usize, col: usize) -> i8 {
        nibble_at(&self.packed, row * self.cols + col)
    }

    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.rows * self.cols];
        for m in 0..self.rows {
            for k in 0..self.cols {
                out[m * self.cols + k] = self.decoded(m, k) as f32 * self.scales[m];
            }
        }
        out
    }

    /// `FP32 [rows, cols]` tensor of the dequantized weights
    pub fn dequantize_tensor(&self) -> Result<Tensor> {
        Tensor::from_f32(&[self.rows, self.cols], &self.dequantize())
    }

    /// `y = W x` with the process-wide kernel
    pub fn matvec(&self, x: &[f32]) -> Result<Vec<f32>> {
        let mut y = vec![0.0f32; self.rows];
        self.matvec_with(kernels::default_kernel(), x, &mut y)?;
        Ok(y)
    }

    pub fn matvec_with(&self, kernel: &dyn KernelProvider, x: &[f32], y: &mut [f32]) -> Result<()> {
        kernel.matvec_q4(&self.packed, &self.scales, x, y, self.rows, self.cols)
    }
}
