//! # spad-nn
//!
//! Normalisation layers for the scratchpad cluster machine.

pub mod layer_norm;
pub mod reduction;
pub mod reference;

pub use layer_norm::LayerNormLayer;
pub use reduction::{PackedF16, PackedF32, RowReduction, ScalarReduction, VectorizedReduction};
pub use reference::{layernorm, random_input};
