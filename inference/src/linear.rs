//! Linear projection `y = x W + b` over dense or 4-bit weights

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernels::{self, KernelProvider};
use crate::quant::QuantizedMatrix;
use crate::tensor::Tensor;

/// Projection weights
#[derive(Debug)]
pub enum Weight {
    /// FP32 `[in, out]`
    Dense(Tensor),
    /// Row-wise 4-bit `[out, in]`, one scale per output feature
    Quantized(QuantizedMatrix),
}

impl Weight {
    pub fn in_features(&self) -> usize {
        match self {
            Weight::Dense(t) => t.dims().first().copied().unwrap_or(0),
            Weight::Quantized(q) => q.cols(),
        }
    }

    pub fn out_features(&self) -> usize {
        match self {
            Weight::Dense(t) => t.dims().get(1).copied().unwrap_or(0),
            Weight::Quantized(q) => q.rows(),
        }
    }
}

#[derive(Debug)]
pub struct Linear {
    name: String,
    weight: Weight,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(name: impl Into<String>, weight: Weight, bias: Option<Tensor>) -> Result<Self> {
        let name = name.into();
        if let Weight::Dense(w) = &weight {
            if w.dtype() != DType::F32 {
                return Err(Error::dtype_mismatch("FP32", w.dtype()));
            }
            if w.rank() != 2 {
                return Err(Error::shape_mismatch(
                    "linear",
                    format!("{}: weight must be [in, out], got {}", name, w.shape()),
                ));
            }
        }
        if let Some(b) = &bias {
            if b.dtype() != DType::F32 {
                return Err(Error::dtype_mismatch("FP32", b.dtype()));
            }
            if b.dims() != [weight.out_features()] {
                return Err(Error::shape_mismatch(
                    "linear",
                    format!(
                        "{}: bias {} does not match {} outputs",
                        name,
                        b.shape(),
                        weight.out_features()
                    ),
                ));
            }
        }
        Ok(Self { name, weight, bias })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> &Weight {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.weight.in_features()
    }

    pub fn out_features(&self) -> usize {
        self.weight.out_features()
    }

    /// Project `[in]`, `[rows, in]` or `[batch, seq, in]` with the
    /// process-wide kernel
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_with(kernels::default_kernel(), input)
    }

    pub fn forward_with(&self, kernel: &dyn KernelProvider, input: &Tensor) -> Result<Tensor> {
        if input.dtype() != DType::F32 {
            return Err(Error::dtype_mismatch("FP32", input.dtype()));
        }
        let in_f = self.in_features();
        let out_f = self.out_features();
        let dims = input.dims();
        match dims.last() {
            Some(&last) if (1..=3).contains(&dims.len()) && last == in_f => {}
            _ => {
                return Err(Error::shape_mismatch(
                    "linear",
                    format!("{}: input {} does not end in {}", self.name, input.shape(), in_f),
                ))
            }
        }
        let rows = dims[..dims.len() - 1].iter().product::<usize>();

        let mut out_dims: Vec<usize> = dims.to_vec();
        if let Some(last) = out_dims.last_mut() {
            *last = out_f;
        }
        let mut output = Tensor::new(&out_dims, DType::F32)?;

        if rows == 0 || out_f == 0 {
            return Ok(output);
        }

        let x = input.as_slice::<f32>()?;
        let y = output.as_mut_slice::<f32>()?;
        match &self.weight {
            Weight::Dense(w) => {
                kernel.matmul(x, w.as_slice::<f32>()?, y, rows, in_f, out_f, 1.0, 0.0)?;
            }
            Weight::Quantized(q) if in_f > 0 => {
                for (x_row, y_row) in x.chunks_exact(in_f).zip(y.chunks_exact_mut(out_f)) {
                    q.matvec_with(kernel, x_row, y_row)?;
                }
            }
            Weight::Quantized(_) => {}
        }

        if let Some(bias) = &self.bias {
            let b = bias.as_slice::<f32>()?;
            for y_row in y.chunks_exact_mut(out_f) {
                for (yv, bv) in y_row.iter_mut().zip(b.iter()) {
                    *yv += bv;
                }
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::ScalarKernel;
    use crate::ops::fill_uniform;

    fn dense(in_f: usize, out_f: usize, data: &[f32]) -> Weight {
        Weight::Dense(Tensor::from_f32(&[in_f, out_f], data).unwrap())
    }

    #[test]
    fn test_dense_with_bias() {
        // W = [[1, 2], [3, 4], [5, 6]] (in = 3, out = 2)
        let w = dense(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bias = Tensor::from_f32(&[2], &[0.5, -0.5]).unwrap();
        let layer = Linear::new("proj", w, Some(bias)).unwrap();

        let x = Tensor::from_f32(&[3], &[1.0, 1.0, 1.0]).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2]);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[9.5, 11.5]);
    }

    #[test]
    fn test_three_dimensional_input() {
        let w = dense(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let layer = Linear::new("identity", w, None).unwrap();
        let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let x = Tensor::from_f32(&[2, 3, 2], &data).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 3, 2]);
        assert_eq!(y.as_slice::<f32>().unwrap(), data.as_slice());
    }

    #[test]
    fn test_quantized_matches_dequantized_dense() {
        let (in_f, out_f) = (8, 5);
        let mut w_rows = vec![0.0f32; out_f * in_f];
        fill_uniform(&mut w_rows, 3);
        let q = QuantizedMatrix::quantize(&w_rows, out_f, in_f).unwrap();

        // dense equivalent is the transpose of the dequantized [out, in]
        let deq = q.dequantize();
        let mut w_dense = vec![0.0f32; in_f * out_f];
        for o in 0..out_f {
            for i in 0..in_f {
                w_dense[i * out_f + o] = deq[o * in_f + i];
            }
        }

        let quant = Linear::new("q", Weight::Quantized(q), None).unwrap();
        let reference = Linear::new("d", dense(in_f, out_f, &w_dense), None).unwrap();
        assert_eq!(quant.in_features(), in_f);
        assert_eq!(quant.out_features(), out_f);

        let mut xs = vec![0.0f32; 2 * in_f];
        fill_uniform(&mut xs, 4);
        let x = Tensor::from_f32(&[2, in_f], &xs).unwrap();
        let a = quant.forward_with(&ScalarKernel, &x).unwrap();
        let b = reference.forward_with(&ScalarKernel, &x).unwrap();
        for (p, r) in a.as_slice::<f32>().unwrap().iter().zip(b.as_slice::<f32>().unwrap()) {
            assert!((p - r).abs() < 1e-4, "{} vs {}", p, r);
        }
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let w = dense(3, 2, &[0.0; 6]);
        let bad_bias = Tensor::new(&[3], DType::F32).unwrap();
        assert!(matches!(
            Linear::new("p", w, Some(bad_bias)),
            Err(Error::ShapeMismatch { .. })
        ));

        let layer = Linear::new("p", dense(3, 2, &[0.0; 6]), None).unwrap();
        let wrong = Tensor::new(&[4], DType::F32).unwrap();
        assert!(matches!(layer.forward(&wrong), Err(Error::ShapeMismatch { .. })));
        let rank4 = Tensor::new(&[1, 1, 1, 3], DType::F32).unwrap();
        assert!(matches!(layer.forward(&rank4), Err(Error::ShapeMismatch { .. })));
        let int8 = Tensor::new(&[3], DType::I8).unwrap();
        assert!(matches!(layer.forward(&int8), Err(Error::DTypeMismatch { .. })));

        let flat = Weight::Dense(Tensor::new(&[6], DType::F32).unwrap());
        assert!(Linear::new("flat", flat, None).is_err());
    }
}
