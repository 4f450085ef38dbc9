use std::fmt;
use std::str::FromStr;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::SpadError;

/// Element precisions understood by the cluster kernels.
///
/// The discriminant is the element width in bytes, which is how the
/// runtime and the DMA sizes refer to a precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 64-bit IEEE 754 double precision
    Fp64 = 8,
    /// 32-bit IEEE 754 single precision
    Fp32 = 4,
    /// 16-bit IEEE 754 half precision
    Fp16 = 2,
    /// 8-bit minifloat. Has no host element type; every kernel rejects it.
    Fp8 = 1,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        *self as usize
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether a host element type exists for this precision.
    pub fn has_host_type(&self) -> bool {
        !matches!(self, DType::Fp8)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Fp64 => write!(f, "fp64"),
            DType::Fp32 => write!(f, "fp32"),
            DType::Fp16 => write!(f, "fp16"),
            DType::Fp8 => write!(f, "fp8"),
        }
    }
}

impl FromStr for DType {
    type Err = SpadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fp64" | "f64" | "double" => Ok(DType::Fp64),
            "fp32" | "f32" | "float" => Ok(DType::Fp32),
            "fp16" | "f16" | "half" => Ok(DType::Fp16),
            "fp8" | "f8" => Ok(DType::Fp8),
            other => Err(SpadError::InvalidConfig(format!("unknown precision '{other}'"))),
        }
    }
}

/// A scalar type that can live in main memory or the scratchpad.
///
/// Arithmetic in the kernels is carried out in `f32`; narrower types are
/// widened on load and rounded on store.
pub trait Element:
    bytemuck::Pod + Default + PartialOrd + fmt::Debug + Send + Sync + 'static
{
    const DTYPE: DType;

    fn to_f32(self) -> f32;

    fn from_f32(v: f32) -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::Fp32;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::Fp64;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v as f64
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::Fp16;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::Fp64.element_size(), 8);
        assert_eq!(DType::Fp32.element_size(), 4);
        assert_eq!(DType::Fp16.element_size(), 2);
        assert_eq!(DType::Fp8.element_size(), 1);
        assert_eq!(DType::Fp16.storage_bytes(10), 20);
    }

    #[test]
    fn test_element_dtypes_match_sizes() {
        assert_eq!(std::mem::size_of::<f32>(), f32::DTYPE.element_size());
        assert_eq!(std::mem::size_of::<f64>(), f64::DTYPE.element_size());
        assert_eq!(std::mem::size_of::<f16>(), f16::DTYPE.element_size());
    }

    #[test]
    fn test_parse_and_display() {
        for dtype in [DType::Fp64, DType::Fp32, DType::Fp16, DType::Fp8] {
            assert_eq!(dtype.to_string().parse::<DType>().unwrap(), dtype);
        }
        assert_eq!("float".parse::<DType>().unwrap(), DType::Fp32);
        assert!("bf16".parse::<DType>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&DType::Fp16).unwrap();
        assert_eq!(json, "\"fp16\"");
        let back: DType = serde_json::from_str("\"fp32\"").unwrap();
        assert_eq!(back, DType::Fp32);
    }

    #[test]
    fn test_f16_roundtrip_is_lossy_but_close() {
        let v = 0.1f32;
        let h = <f16 as Element>::from_f32(v);
        assert!((Element::to_f32(h) - v).abs() < 1e-3);
    }
}
