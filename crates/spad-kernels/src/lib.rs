//! # spad-kernels
//!
//! Fixed-contract compute primitives for scratchpad tiles, shared by the
//! attention and normalisation kernels.
//!
//! Provides:
//! - [`gemm`]: `C = alpha * op(A) * op(B) + beta * C` with per-operand
//!   transpose flags, in baseline and optimized variants
//! - [`transpose`] / [`transpose_rows`]: whole or per-core partial transposes
//! - [`TransposeLayer`]: a standalone DMA → transpose → DMA cluster kernel
//! - Runtime SIMD capability detection

pub mod gemm;
pub mod layer;
pub mod simd;
pub mod transpose;
pub mod transpose_layer;

pub use gemm::gemm;
pub use layer::{ensure_divisible, ensure_nonzero, expect_tensor, unsupported_dtype, KernelMode};
pub use simd::SimdCapability;
pub use transpose::{transpose, transpose_rows};
pub use transpose_layer::TransposeLayer;
