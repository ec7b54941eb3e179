//! Matrix kernels with runtime variant selection
//!
//! Every variant implements [`KernelProvider`] over row-major `f32` slices and
//! must agree with [`ScalarKernel`] within accumulation tolerance. The
//! process-wide default is picked once from the host's CPU features; sessions
//! may instead pass an explicitly selected provider around.

use engine_config::KernelPreference;
use spin::Once;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

pub mod scalar;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

pub use scalar::ScalarKernel;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::Avx2Kernel;
#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
pub use self::x86_64::Avx512Kernel;

#[cfg(target_arch = "aarch64")]
pub use self::aarch64::NeonKernel;

/// One implementation of the compute kernels
pub trait KernelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the host CPU can run this variant
    fn is_available(&self) -> bool;

    /// `c = alpha * (a x b) + beta * c` with `a: m x k`, `b: k x n`, `c: m x n`.
    ///
    /// When `beta == 0` the previous contents of `c` are not read.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// `y = alpha * (a x) + beta * y` with `a: m x k`
    #[allow(clippy::too_many_arguments)]
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
        self.matmul(a, x, y, m, k, 1, alpha, beta)
    }

    /// Row-wise 4-bit matrix-vector product, see [`crate::quant::matvec_q4`]
    fn matvec_q4(
        &self,
        packed: &[u8],
        scales: &[f32],
        x: &[f32],
        y: &mut [f32],
        rows: usize,
        cols: usize,
    ) -> Result<()>;
}

static SCALAR: ScalarKernel = ScalarKernel;
#[cfg(target_arch = "x86_64")]
static AVX2: Avx2Kernel = Avx2Kernel;
#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
static AVX512: Avx512Kernel = Avx512Kernel;
#[cfg(target_arch = "aarch64")]
static NEON: NeonKernel = NeonKernel;

static DEFAULT_KERNEL: Once<&'static dyn KernelProvider> = Once::new();

/// Every compiled-in variant, best first, the scalar kernel last
pub fn compiled_kernels() -> Vec<&'static dyn KernelProvider> {
    let mut kernels: Vec<&'static dyn KernelProvider> = Vec::new();
    #[cfg(all(target_arch = "x86_64", feature = "avx512"))]
    kernels.push(&AVX512);
    #[cfg(target_arch = "x86_64")]
    kernels.push(&AVX2);
    #[cfg(target_arch = "aarch64")]
    kernels.push(&NEON);
    kernels.push(&SCALAR);
    kernels
}

/// Compiled-in variants the host can run, best first
pub fn available_kernels() -> Vec<&'static dyn KernelProvider> {
    compiled_kernels()
        .into_iter()
        .filter(|k| k.is_available())
        .collect()
}

/// The portable reference kernel
pub fn scalar_kernel() -> &'static dyn KernelProvider {
    &SCALAR
}

/// Ordered provider list with a cached selection
pub struct KernelManager {
    providers: Vec<&'static dyn KernelProvider>,
    preference: KernelPreference,
    selected: Once<usize>,
}

impl KernelManager {
    pub fn new() -> Self {
        Self::with_preference(KernelPreference::Auto)
    }

    pub fn with_preference(preference: KernelPreference) -> Self {
        Self {
            providers: compiled_kernels(),
            preference,
            selected: Once::new(),
        }
    }

    /// Select the preferred provider if the host supports it, else the best
    /// available one. The choice is made once per manager.
    pub fn select_best(&self) -> &'static dyn KernelProvider {
        let idx = *self.selected.call_once(|| {
            if let Some(name) = preference_name(self.preference) {
                if let Some(i) = self
                    .providers
                    .iter()
                    .position(|p| p.name() == name && p.is_available())
                {
                    log::info!("Selected kernel provider: {}", name);
                    return i;
                }
                log::warn!(
                    "Kernel '{}' is not available on this host; selecting automatically",
                    name
                );
            }
            match self.providers.iter().position(|p| p.is_available()) {
                Some(i) => {
                    log::info!("Selected kernel provider: {}", self.providers[i].name());
                    i
                }
                None => self.providers.len(),
            }
        });
        self.providers.get(idx).copied().unwrap_or(&SCALAR)
    }

    pub fn selected_provider_name(&self) -> Option<&'static str> {
        self.selected
            .get()
            .and_then(|&idx| self.providers.get(idx))
            .map(|p| p.name())
    }

    pub fn list_available_providers(&self) -> Vec<&'static str> {
        self.providers
            .iter()
            .filter(|p| p.is_available())
            .map(|p| p.name())
            .collect()
    }
}

impl Default for KernelManager {
    fn default() -> Self {
        Self::new()
    }
}

fn preference_name(preference: KernelPreference) -> Option<&'static str> {
    match preference {
        KernelPreference::Auto => None,
        other => Some(other.as_str()),
    }
}

/// Pick a kernel for `preference`. A preference the host cannot honour
/// falls back to automatic selection.
pub fn select_kernel(preference: KernelPreference) -> &'static dyn KernelProvider {
    KernelManager::with_preference(preference).select_best()
}

/// Process-wide kernel, selected on first use and kept for the process
/// lifetime
pub fn default_kernel() -> &'static dyn KernelProvider {
    *DEFAULT_KERNEL.call_once(|| select_kernel(KernelPreference::Auto))
}

/// `C = alpha * (A x B) + beta * C` with the process-wide kernel
pub fn matmul(a: &Tensor, b: &Tensor, c: &mut Tensor, alpha: f32, beta: f32) -> Result<()> {
    matmul_with(default_kernel(), a, b, c, alpha, beta)
}

/// `y = alpha * (A x) + beta * y` with the process-wide kernel
pub fn matvec(a: &Tensor, x: &Tensor, y: &mut Tensor, alpha: f32, beta: f32) -> Result<()> {
    matvec_with(default_kernel(), a, x, y, alpha, beta)
}

pub fn matmul_with(
    kernel: &dyn KernelProvider,
    a: &Tensor,
    b: &Tensor,
    c: &mut Tensor,
    alpha: f32,
    beta: f32,
) -> Result<()> {
    let (m, k) = dims2("matmul", "A", a)?;
    let (kb, n) = dims2("matmul", "B", b)?;
    let (mc, nc) = dims2("matmul", "C", c)?;
    if k != kb {
        return Err(Error::shape_mismatch(
            "matmul",
            format!("A is {}x{} but B is {}x{}", m, k, kb, n),
        ));
    }
    if mc != m || nc != n {
        return Err(Error::shape_mismatch(
            "matmul",
            format!("C is {}x{}, expected {}x{}", mc, nc, m, n),
        ));
    }
    check_f32(a)?;
    check_f32(b)?;
    check_f32(c)?;

    kernel.matmul(
        a.as_slice::<f32>()?,
        b.as_slice::<f32>()?,
        c.as_mut_slice::<f32>()?,
        m,
        k,
        n,
        alpha,
        beta,
    )
}

pub fn matvec_with(
    kernel: &dyn KernelProvider,
    a: &Tensor,
    x: &Tensor,
    y: &mut Tensor,
    alpha: f32,
    beta: f32,
) -> Result<()> {
    let (m, k) = dims2("matvec", "A", a)?;
    let kx = dims1("matvec", "x", x)?;
    let my = dims1("matvec", "y", y)?;
    if kx != k || my != m {
        return Err(Error::shape_mismatch(
            "matvec",
            format!("A is {}x{}, x has {}, y has {}", m, k, kx, my),
        ));
    }
    check_f32(a)?;
    check_f32(x)?;
    check_f32(y)?;

    kernel.matvec(
        a.as_slice::<f32>()?,
        x.as_slice::<f32>()?,
        y.as_mut_slice::<f32>()?,
        m,
        k,
        alpha,
        beta,
    )
}

fn dims2(op: &'static str, name: &str, t: &Tensor) -> Result<(usize, usize)> {
    match t.dims() {
        &[rows, cols] => Ok((rows, cols)),
        other => Err(Error::shape_mismatch(
            op,
            format!("{} must be 2-D, got {:?}", name, other),
        )),
    }
}

fn dims1(op: &'static str, name: &str, t: &Tensor) -> Result<usize> {
    match t.dims() {
        &[len] => Ok(len),
        other => Err(Error::shape_mismatch(
            op,
            format!("{} must be 1-D, got {:?}", name, other),
        )),
    }
}

fn check_f32(t: &Tensor) -> Result<()> {
    if t.dtype() != DType::F32 {
        return Err(Error::dtype_mismatch("FP32", t.dtype()));
    }
    Ok(())
}

/// Slice-length preconditions shared by every `matmul` implementation
pub(crate) fn check_matmul(a: &[f32], b: &[f32], c: &[f32], m: usize, k: usize, n: usize) -> Result<()> {
    let check = |len: usize, rows: usize, cols: usize, name: &str| -> Result<()> {
        if rows.checked_mul(cols) != Some(len) {
            return Err(Error::shape_mismatch(
                "matmul",
                format!("{} has {} values, expected {}x{}", name, len, rows, cols),
            ));
        }
        Ok(())
    };
    check(a.len(), m, k, "A")?;
    check(b.len(), k, n, "B")?;
    check(c.len(), m, n, "C")
}

/// Combine an accumulated product with the previous output value
#[inline(always)]
pub(crate) fn blend(acc: f32, prev: f32, alpha: f32, beta: f32) -> f32 {
    if beta == 0.0 {
        alpha * acc
    } else {
        alpha * acc + beta * prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fill_uniform;

    fn reference(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f32;
                for l in 0..k {
                    sum += a[i * k + l] * b[l * n + j];
                }
                out[i * n + j] = sum;
            }
        }
        out
    }

    #[test]
    fn test_scalar_is_always_available() {
        let available = available_kernels();
        assert!(!available.is_empty());
        assert_eq!(available.last().unwrap().name(), "scalar");
        assert_eq!(compiled_kernels().last().unwrap().name(), "scalar");
    }

    #[test]
    fn test_default_kernel_is_stable() {
        let first = default_kernel().name();
        for _ in 0..4 {
            assert_eq!(default_kernel().name(), first);
        }
        assert_eq!(first, available_kernels()[0].name());
    }

    #[test]
    fn test_select_preferences() {
        assert_eq!(select_kernel(KernelPreference::Scalar).name(), "scalar");
        assert_eq!(
            select_kernel(KernelPreference::Auto).name(),
            available_kernels()[0].name()
        );
        // unsupported or uncompiled preferences fall back to auto
        let avx512 = select_kernel(KernelPreference::Avx512);
        assert!(avx512.is_available());
    }

    #[test]
    fn test_manager_caches_selection() {
        let manager = KernelManager::new();
        assert_eq!(manager.selected_provider_name(), None);
        let first = manager.select_best().name();
        assert_eq!(manager.selected_provider_name(), Some(first));
        assert_eq!(manager.select_best().name(), first);
        assert!(manager.list_available_providers().contains(&"scalar"));
    }

    #[test]
    fn test_matmul_tensor_small() {
        let a = Tensor::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_f32(&[2, 1], &[1.0, 2.0]).unwrap();
        let mut c = Tensor::new(&[2, 1], DType::F32).unwrap();
        matmul(&a, &b, &mut c, 1.0, 0.0).unwrap();
        assert_eq!(c.as_slice::<f32>().unwrap(), &[5.0, 11.0]);
    }

    #[test]
    fn test_matmul_alpha_beta() {
        let a = Tensor::from_f32(&[1, 2], &[1.0, 1.0]).unwrap();
        let b = Tensor::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut c = Tensor::from_f32(&[1, 2], &[10.0, 20.0]).unwrap();
        matmul(&a, &b, &mut c, 2.0, 0.5).unwrap();
        assert_eq!(c.as_slice::<f32>().unwrap(), &[13.0, 22.0]);
    }

    #[test]
    fn test_beta_zero_ignores_previous_output() {
        let a = Tensor::from_f32(&[1, 1], &[2.0]).unwrap();
        let b = Tensor::from_f32(&[1, 1], &[3.0]).unwrap();
        let mut c = Tensor::from_f32(&[1, 1], &[f32::NAN]).unwrap();
        for kernel in available_kernels() {
            matmul_with(kernel, &a, &b, &mut c, 1.0, 0.0).unwrap();
            assert_eq!(c.as_slice::<f32>().unwrap(), &[6.0], "{}", kernel.name());
            c.as_mut_slice::<f32>().unwrap()[0] = f32::NAN;
        }
    }

    #[test]
    fn test_matmul_matches_reference_8x8x8() {
        let (m, k, n) = (8, 8, 8);
        let mut a = vec![0.0f32; m * k];
        let mut b = vec![0.0f32; k * n];
        fill_uniform(&mut a, 11);
        fill_uniform(&mut b, 29);
        let expected = reference(&a, &b, m, k, n);

        let ta = Tensor::from_f32(&[m, k], &a).unwrap();
        let tb = Tensor::from_f32(&[k, n], &b).unwrap();
        let mut tc = Tensor::new(&[m, n], DType::F32).unwrap();
        matmul(&ta, &tb, &mut tc, 1.0, 0.0).unwrap();

        for (got, want) in tc.as_slice::<f32>().unwrap().iter().zip(expected.iter()) {
            assert!((got - want).abs() <= 1e-4 * want.abs().max(1.0), "{} vs {}", got, want);
        }
    }

    #[test]
    fn test_matmul_shape_errors() {
        let a = Tensor::new(&[2, 3], DType::F32).unwrap();
        let b = Tensor::new(&[4, 2], DType::F32).unwrap();
        let mut c = Tensor::new(&[2, 2], DType::F32).unwrap();
        assert!(matches!(
            matmul(&a, &b, &mut c, 1.0, 0.0),
            Err(Error::ShapeMismatch { .. })
        ));

        let b = Tensor::new(&[3, 2], DType::F32).unwrap();
        let mut wrong_c = Tensor::new(&[3, 2], DType::F32).unwrap();
        assert!(matches!(
            matmul(&a, &b, &mut wrong_c, 1.0, 0.0),
            Err(Error::ShapeMismatch { .. })
        ));

        let flat = Tensor::new(&[6], DType::F32).unwrap();
        assert!(matches!(
            matmul(&flat, &b, &mut c, 1.0, 0.0),
            Err(Error::ShapeMismatch { .. })
        ));

        let half = Tensor::new(&[2, 3], DType::F16).unwrap();
        assert!(matches!(
            matmul(&half, &b, &mut c, 1.0, 0.0),
            Err(Error::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_failed_matmul_leaves_output_untouched() {
        let a = Tensor::from_f32(&[1, 2], &[1.0, 2.0]).unwrap();
        let b = Tensor::from_f32(&[3, 1], &[1.0, 1.0, 1.0]).unwrap();
        let mut c = Tensor::from_f32(&[1, 1], &[42.0]).unwrap();
        assert!(matmul(&a, &b, &mut c, 1.0, 0.0).is_err());
        assert_eq!(c.as_slice::<f32>().unwrap(), &[42.0]);
    }

    #[test]
    fn test_matvec_tensor() {
        let a = Tensor::from_f32(&[2, 3], &[1.0, 0.0, 2.0, 0.0, 1.0, -1.0]).unwrap();
        let x = Tensor::from_f32(&[3], &[1.0, 2.0, 3.0]).unwrap();
        let mut y = Tensor::from_f32(&[2], &[1.0, 1.0]).unwrap();
        matvec(&a, &x, &mut y, 1.0, 1.0).unwrap();
        assert_eq!(y.as_slice::<f32>().unwrap(), &[8.0, 0.0]);

        let mut wrong = Tensor::new(&[3], DType::F32).unwrap();
        assert!(matches!(
            matvec(&a, &x, &mut wrong, 1.0, 0.0),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_slice_length_checks() {
        let mut c = [0.0f32; 4];
        for kernel in available_kernels() {
            assert!(matches!(
                kernel.matmul(&[0.0; 3], &[0.0; 4], &mut c, 2, 2, 2, 1.0, 0.0),
                Err(Error::ShapeMismatch { .. })
            ));
        }
    }
}
