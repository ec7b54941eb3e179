//! 32-byte aligned byte storage shared by tensors and arena blocks

use crate::error::{Error, Result};

/// Alignment of every tensor buffer and arena region
pub const ALIGNMENT: usize = 32;

#[derive(Clone, Copy)]
#[repr(C, align(32))]
struct Line([u8; ALIGNMENT]);

// SAFETY: `Line` is a byte array with no padding (size == align == 32) and
// every bit pattern is valid.
unsafe impl bytemuck::Zeroable for Line {}
unsafe impl bytemuck::Pod for Line {}

/// Zero-initialised byte buffer whose first byte is 32-byte aligned
pub(crate) struct AlignedBuf {
    lines: Vec<Line>,
    len: usize,
}

impl AlignedBuf {
    pub(crate) fn zeroed(len: usize) -> Result<Self> {
        let count = len.div_ceil(ALIGNMENT);
        let mut lines = Vec::new();
        lines
            .try_reserve_exact(count)
            .map_err(|_| Error::OutOfMemory { requested: len })?;
        lines.resize(count, Line([0; ALIGNMENT]));
        Ok(Self { lines, len })
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut buf = Self::zeroed(bytes.len())?;
        buf.as_bytes_mut().copy_from_slice(bytes);
        Ok(buf)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Line, u8>(&self.lines)[..self.len]
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<Line, u8>(&mut self.lines)[..self.len]
    }
}

/// Round `size` up to the next multiple of [`ALIGNMENT`], `None` on overflow
pub(crate) const fn checked_align_up(size: usize) -> Option<usize> {
    match size.checked_add(ALIGNMENT - 1) {
        Some(padded) => Some(padded / ALIGNMENT * ALIGNMENT),
        None => None,
    }
}
