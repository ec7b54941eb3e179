use std::fmt;

use crate::aligned::AlignedBuf;
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};

/// Ordered dimension sizes of a tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }

    /// Build from signed dimensions as loaders report them
    pub fn from_signed(dims: &[i64]) -> Result<Self> {
        let mut out = Vec::with_capacity(dims.len());
        for (axis, &dim) in dims.iter().enumerate() {
            let dim = usize::try_from(dim).map_err(|_| {
                Error::InvalidShape(format!("dimension {} is {} in {:?}", axis, dim, dims))
            })?;
            out.push(dim);
        }
        Ok(Self(out))
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Element count; an empty shape holds zero elements. `None` on overflow.
    pub fn checked_numel(&self) -> Option<usize> {
        if self.0.is_empty() {
            return Some(0);
        }
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(&dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", d)?;
        }
        f.write_str("]")
    }
}

/// Shaped, typed, exclusively owned buffer.
///
/// Tensors are move-only; [`Tensor::try_clone`] is the explicit deep copy.
/// Storage is contiguous, row-major and 32-byte aligned.
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    numel: usize,
    storage: AlignedBuf,
}

impl Tensor {
    /// Zero-filled tensor
    pub fn new(dims: &[usize], dtype: DType) -> Result<Self> {
        Self::with_shape(Shape::new(dims), dtype)
    }

    /// Zero-filled tensor from signed dimensions; negative sizes are rejected
    pub fn from_signed_dims(dims: &[i64], dtype: DType) -> Result<Self> {
        Self::with_shape(Shape::from_signed(dims)?, dtype)
    }

    pub fn with_shape(shape: Shape, dtype: DType) -> Result<Self> {
        let (numel, bytes) = Self::sizes(&shape, dtype)?;
        Ok(Self {
            shape,
            dtype,
            numel,
            storage: AlignedBuf::zeroed(bytes)?,
        })
    }

    /// FP32 tensor holding a copy of `data`
    pub fn from_f32(dims: &[usize], data: &[f32]) -> Result<Self> {
        let mut tensor = Self::new(dims, DType::F32)?;
        if data.len() != tensor.numel {
            return Err(Error::InvalidShape(format!(
                "{} values for shape {} ({} elements)",
                data.len(),
                tensor.shape,
                tensor.numel
            )));
        }
        tensor.as_mut_slice::<f32>()?.copy_from_slice(data);
        Ok(tensor)
    }

    /// Tensor over raw bytes handed over by a model loader. The byte length
    /// must match the storage size of `dims` exactly.
    pub fn from_bytes(dims: &[usize], dtype: DType, bytes: &[u8]) -> Result<Self> {
        let shape = Shape::new(dims);
        let (numel, expected) = Self::sizes(&shape, dtype)?;
        if bytes.len() != expected {
            return Err(Error::InvalidShape(format!(
                "{} bytes for {} tensor of shape {} (expected {})",
                bytes.len(),
                dtype,
                shape,
                expected
            )));
        }
        Ok(Self {
            shape,
            dtype,
            numel,
            storage: AlignedBuf::from_bytes(bytes)?,
        })
    }

    fn sizes(shape: &Shape, dtype: DType) -> Result<(usize, usize)> {
        let numel = shape
            .checked_numel()
            .ok_or_else(|| Error::InvalidShape(format!("element count of {} overflows", shape)))?;
        let bytes = dtype
            .checked_storage_bytes(numel)
            .ok_or_else(|| Error::InvalidShape(format!("byte size of {} overflows", shape)))?;
        Ok((numel, bytes))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn byte_size(&self) -> usize {
        self.storage.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_bytes()
    }

    /// New tensor with `new_dims` and a fresh copy of the same bytes
    pub fn reshape(&self, new_dims: &[usize]) -> Result<Tensor> {
        let shape = Shape::new(new_dims);
        let numel = shape
            .checked_numel()
            .ok_or_else(|| Error::InvalidShape(format!("element count of {} overflows", shape)))?;
        if numel != self.numel {
            return Err(Error::shape_mismatch(
                "reshape",
                format!(
                    "{} has {} elements, {} has {}",
                    self.shape, self.numel, shape, numel
                ),
            ));
        }
        Ok(Tensor {
            shape,
            dtype: self.dtype,
            numel,
            storage: AlignedBuf::from_bytes(self.as_bytes())?,
        })
    }

    /// Deep copy
    pub fn try_clone(&self) -> Result<Tensor> {
        self.reshape(self.shape.dims())
    }

    /// Typed view of the elements
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_typed::<T>()?;
        bytemuck::try_cast_slice(self.storage.as_bytes())
            .map_err(|e| Error::UnsupportedAccess(format!("{:?}", e)))
    }

    /// Mutable typed view of the elements
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_typed::<T>()?;
        bytemuck::try_cast_slice_mut(self.storage.as_bytes_mut())
            .map_err(|e| Error::UnsupportedAccess(format!("{:?}", e)))
    }

    fn check_typed<T: Element>(&self) -> Result<()> {
        match self.dtype.byte_width() {
            None => Err(Error::UnsupportedAccess(String::from(
                "Q4 tensors have no per-element view; use packed()",
            ))),
            Some(width) if width != T::WIDTH => Err(Error::dtype_mismatch(
                format!("{}-byte element", T::WIDTH),
                self.dtype,
            )),
            Some(_) => Ok(()),
        }
    }

    /// Packed nibble bytes of a Q4 tensor
    pub fn packed(&self) -> Result<&[u8]> {
        if !self.dtype.is_packed() {
            return Err(Error::dtype_mismatch("Q4", self.dtype));
        }
        Ok(self.storage.as_bytes())
    }

    pub fn packed_mut(&mut self) -> Result<&mut [u8]> {
        if !self.dtype.is_packed() {
            return Err(Error::dtype_mismatch("Q4", self.dtype));
        }
        Ok(self.storage.as_bytes_mut())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("numel", &self.numel)
            .field("bytes", &self.storage.len())
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, numel={})",
            self.shape, self.dtype, self.numel
        )
    }
}
