//! # spad-attention
//!
//! FlashAttention-2 for the multi-cluster scratchpad machine.
//!
//! Provides:
//! - [`FlashAttention2Layer`]: tiled online-softmax attention, one row tile
//!   per cluster at a time, with a data mover streaming Q, K, V and O
//! - [`reference`]: direct and tile-exact host golden models

pub mod flashattention_2;
pub mod reference;

pub use flashattention_2::FlashAttention2Layer;
pub use reference::{attention, online_attention, random_qkv, OnlineAttention};
