use half::f16;
use rand::Rng;

use crate::dtype::{DType, Element};
use crate::error::SpadError;
use crate::shape::Shape;
use crate::Result;

/// A dense, row-major host tensor.
///
/// This is the host-side view of a tensor: it is what gets uploaded into
/// main memory before a kernel launch and what comes back afterwards.
/// Elements are stored as raw bytes in the precision given by `dtype`.
///
/// # Examples
///
/// ```
/// use spad_core::{DType, Tensor};
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// assert_eq!(t.shape().dims(), &[2, 2]);
/// assert_eq!(t.dtype(), DType::Fp32);
/// assert_eq!(t.nbytes(), 16);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Shape,
    data: Vec<u8>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from typed elements with the given shape.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(SpadError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape: s,
            data: bytemuck::cast_slice::<T, u8>(data).to_vec(),
        })
    }

    /// Create a tensor from f32 data with the given shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Result<Self> {
        Self::from_slice(data, shape)
    }

    /// Create a tensor of `dtype` from f32 values, rounding each element.
    pub fn from_f32_as(data: &[f32], shape: &[usize], dtype: DType) -> Result<Self> {
        match dtype {
            DType::Fp32 => Self::from_slice(data, shape),
            DType::Fp64 => Self::from_slice(&convert::<f64>(data), shape),
            DType::Fp16 => Self::from_slice(&convert::<f16>(data), shape),
            DType::Fp8 => Err(SpadError::UnsupportedDType(dtype)),
        }
    }

    /// Create a zero-filled tensor. Works for every dtype, including those
    /// without a host element type.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        let data = vec![0u8; dtype.storage_bytes(s.numel())];
        Self { dtype, shape: s, data }
    }

    /// Uniform random values in `[low, high)`.
    pub fn rand_uniform<R: Rng>(
        shape: &[usize],
        dtype: DType,
        low: f32,
        high: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let numel = Shape::new(shape).numel();
        let data: Vec<f32> = (0..numel).map(|_| rng.gen_range(low..high)).collect();
        Self::from_f32_as(&data, shape, dtype)
    }

    /// Random values from the standard normal distribution N(0,1).
    pub fn randn<R: Rng>(shape: &[usize], dtype: DType, rng: &mut R) -> Result<Self> {
        let numel = Shape::new(shape).numel();
        // Box-Muller transform for normal distribution
        let data: Vec<f32> = (0..numel)
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self::from_f32_as(&data, shape, dtype)
    }

    /// Rebuild a tensor from raw bytes in the given precision.
    pub fn from_bytes(bytes: Vec<u8>, shape: &[usize], dtype: DType) -> Result<Self> {
        let s = Shape::new(shape);
        let expected = dtype.storage_bytes(s.numel());
        if bytes.len() != expected {
            return Err(SpadError::ShapeMismatch {
                expected: vec![expected],
                got: vec![bytes.len()],
            });
        }
        Ok(Self {
            dtype,
            shape: s,
            data: bytes,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Size of the tensor payload in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy the elements out as `T`. Fails if `T` is not the tensor's dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(SpadError::UnsupportedDType(self.dtype));
        }
        Ok(bytemuck::allocation::pod_collect_to_vec(&self.data))
    }

    /// Copy the elements out, widened to f32.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self.dtype {
            DType::Fp32 => self.to_vec::<f32>(),
            DType::Fp64 => Ok(widen(&self.to_vec::<f64>()?)),
            DType::Fp16 => Ok(widen(&self.to_vec::<f16>()?)),
            DType::Fp8 => Err(SpadError::UnsupportedDType(self.dtype)),
        }
    }
}

fn convert<T: Element>(data: &[f32]) -> Vec<T> {
    data.iter().map(|&v| T::from_f32(v)).collect()
}

fn widen<T: Element>(data: &[T]) -> Vec<f32> {
    data.iter().map(|&v| v.to_f32()).collect()
}
