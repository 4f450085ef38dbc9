//! Convenience re-exports for common spad-core types.
//!
//! ```rust
//! use spad_core::prelude::*;
//! ```

pub use crate::DType;
pub use crate::Element;
pub use crate::Shape;
pub use crate::SpadError;
pub use crate::Tensor;
pub use crate::Result;
