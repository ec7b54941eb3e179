use std::fmt;

use half::f16;

/// Element kinds a tensor can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    I8,
    /// Signed 4-bit values, two per byte, low nibble first
    Q4,
}

impl DType {
    /// Bytes per element, `None` for the packed 4-bit kind which has no
    /// per-element address.
    pub const fn byte_width(self) -> Option<usize> {
        match self {
            DType::F32 => Some(4),
            DType::F16 => Some(2),
            DType::I8 => Some(1),
            DType::Q4 => None,
        }
    }

    /// Storage size in bytes for `numel` elements, saturating at
    /// `usize::MAX`. Use [`DType::checked_storage_bytes`] to detect overflow.
    pub const fn storage_bytes(self, numel: usize) -> usize {
        match self.byte_width() {
            Some(width) => numel.saturating_mul(width),
            None => numel.div_ceil(2),
        }
    }

    /// Checked form of [`DType::storage_bytes`]
    pub fn checked_storage_bytes(self, numel: usize) -> Option<usize> {
        match self.byte_width() {
            Some(width) => numel.checked_mul(width),
            None => Some(numel.div_ceil(2)),
        }
    }

    pub const fn is_packed(self) -> bool {
        matches!(self, DType::Q4)
    }

    pub const fn name(self) -> &'static str {
        match self {
            DType::F32 => "FP32",
            DType::F16 => "FP16",
            DType::I8 => "INT8",
            DType::Q4 => "Q4",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Plain-old-data types usable for typed tensor and arena views.
///
/// Access is checked by width only: any element whose size equals the
/// tensor's per-element width may view it.
pub trait Element: bytemuck::Pod {
    const WIDTH: usize = std::mem::size_of::<Self>();
}

impl Element for f32 {}
impl Element for f16 {}
impl Element for i8 {}
impl Element for u8 {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_bytes() {
        assert_eq!(DType::F32.storage_bytes(6), 24);
        assert_eq!(DType::F16.storage_bytes(6), 12);
        assert_eq!(DType::I8.storage_bytes(6), 6);
        assert_eq!(DType::Q4.storage_bytes(6), 3);
        assert_eq!(DType::Q4.storage_bytes(7), 4);
        assert_eq!(DType::Q4.storage_bytes(0), 0);
    }

    #[test]
    fn test_widths() {
        assert_eq!(DType::F32.byte_width(), Some(<f32 as Element>::WIDTH));
        assert_eq!(DType::F16.byte_width(), Some(<f16 as Element>::WIDTH));
        assert_eq!(DType::I8.byte_width(), Some(<i8 as Element>::WIDTH));
        assert_eq!(DType::Q4.byte_width(), None);
        assert!(DType::Q4.is_packed());
        assert_eq!(DType::Q4.checked_storage_bytes(usize::MAX), Some(usize::MAX / 2 + 1));
        assert_eq!(DType::F32.checked_storage_bytes(usize::MAX), None);
        assert_eq!(DType::F32.storage_bytes(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_display() {
        assert_eq!(DType::F32.to_string(), "FP32");
        assert_eq!(DType::Q4.to_string(), "Q4");
    }
}
