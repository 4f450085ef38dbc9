//! Helpers shared by the kernel entry points.

use serde::{Deserialize, Serialize};
use spad_core::{DType, Result, SpadError};
use spad_runtime::TensorRef;

/// Which implementation of a primitive to run. Both produce the same
/// results up to rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelMode {
    /// Straightforward loops; the numerical reference.
    Baseline,
    /// Unrolled and vectorised variants.
    #[default]
    Optimized,
}

impl KernelMode {
    pub fn from_baseline_flag(baseline: bool) -> Self {
        if baseline {
            KernelMode::Baseline
        } else {
            KernelMode::Optimized
        }
    }
}

/// Report a precision a kernel cannot handle and build the matching error.
pub fn unsupported_dtype(kernel: &'static str, dtype: DType) -> SpadError {
    tracing::error!(kernel, %dtype, "Unsupported data type");
    SpadError::UnsupportedDType(dtype)
}

/// Check that a main-memory tensor has the expected shape and precision.
pub fn expect_tensor(tensor: &TensorRef, dims: &[usize], dtype: DType) -> Result<()> {
    if tensor.dtype() != dtype {
        return Err(SpadError::InvalidConfig(format!(
            "tensor precision {} does not match layer precision {dtype}",
            tensor.dtype()
        )));
    }
    if tensor.shape().dims() != dims {
        return Err(SpadError::ShapeMismatch {
            expected: dims.to_vec(),
            got: tensor.shape().dims().to_vec(),
        });
    }
    Ok(())
}

/// `Err(Indivisible)` unless `divisor` divides `dividend`.
pub fn ensure_divisible(what: &'static str, dividend: usize, divisor: usize) -> Result<()> {
    if divisor == 0 || dividend % divisor != 0 {
        return Err(SpadError::Indivisible {
            what,
            dividend,
            divisor,
        });
    }
    Ok(())
}

/// `Err(InvalidConfig)` if any named dimension is zero.
pub fn ensure_nonzero(dims: &[(&str, usize)]) -> Result<()> {
    match dims.iter().find(|(_, v)| *v == 0) {
        Some((name, _)) => Err(SpadError::InvalidConfig(format!("{name} must be non-zero"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flag() {
        assert_eq!(KernelMode::from_baseline_flag(true), KernelMode::Baseline);
        assert_eq!(KernelMode::default(), KernelMode::Optimized);
        assert_eq!(serde_json::to_string(&KernelMode::Baseline).unwrap(), "\"baseline\"");
    }

    #[test]
    fn test_divisibility() {
        assert!(ensure_divisible("rows", 128, 32).is_ok());
        assert!(matches!(
            ensure_divisible("rows", 100, 32),
            Err(SpadError::Indivisible { dividend: 100, divisor: 32, .. })
        ));
        assert!(ensure_divisible("rows", 4, 0).is_err());
    }

    #[test]
    fn test_nonzero() {
        assert!(ensure_nonzero(&[("N", 4), ("d", 8)]).is_ok());
        let err = ensure_nonzero(&[("N", 4), ("d", 0)]).unwrap_err();
        assert!(err.to_string().contains("d must be non-zero"));
    }
}
