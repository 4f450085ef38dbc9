//! # spad-runtime
//!
//! Execution model of a multi-cluster scratchpad accelerator.
//!
//! Each cluster owns a small tightly-coupled data memory (TCDM), a DMA
//! engine connecting it to the shared main memory, a hardware barrier, and
//! a team of cores: several compute cores plus one data mover. Kernels are
//! written as a pair of programs ([`ClusterKernel::transfer_task`] and
//! [`ClusterKernel::compute_task`]) that alternate phases separated by
//! cluster barriers.
//!
//! ## Key pieces
//! - [`System`]: main memory, TCDMs, and [`System::launch`]
//! - [`ScratchpadArena`] / [`Buf`]: per-launch named TCDM layout
//! - [`DmaEngine`]: asynchronous 2D transfers with completion tracking
//! - [`HwBarrier`]: cluster and global rendezvous with fault detection
//! - [`Topology`]: role and index queries for the running core

pub mod barrier;
pub mod cluster;
pub mod config;
pub mod dma;
pub mod memory;
pub mod role;
pub mod scratchpad;

pub use barrier::HwBarrier;
pub use cluster::{ClusterKernel, ComputeContext, CoreContext, LaunchReport, System, TransferContext};
pub use config::ClusterConfig;
pub use dma::{DmaEngine, DmaStats, Transfer2d, TxId};
pub use memory::{Endpoint, MainMemory, TensorRef, MAIN_MEMORY_ALIGN};
pub use role::{contiguous_share, interleaved_share, Role, Topology};
pub use scratchpad::{Buf, BufferSlot, ScratchpadArena, Tcdm};
