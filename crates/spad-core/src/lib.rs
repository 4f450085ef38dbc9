//! # spad-core
//!
//! Shared foundation for the spad cluster kernels.
//!
//! Provides:
//! - `DType` precision selector and the `Element` trait (fp64, fp32, fp16)
//! - `Shape` with stack-allocated dimensions
//! - Host-side `Tensor` used to stage inputs and read back outputs
//! - `SpadError`, the error type used across the workspace

pub mod dtype;
pub mod shape;
pub mod tensor;
pub mod error;
pub mod prelude;

pub use dtype::{DType, Element};
pub use shape::Shape;
pub use tensor::Tensor;
pub use error::SpadError;

pub type Result<T> = std::result::Result<T, SpadError>;
