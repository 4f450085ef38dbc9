//! Core roles and work partitioning.
//!
//! Within a cluster the compute cores take indices `0..n` and the data
//! mover sits last at index `n`.

use std::iter::StepBy;
use std::ops::Range;

/// What a core does during a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Issues DMA transfers, never computes.
    DataMover,
    /// Computes on TCDM data, never issues DMA.
    Compute,
}

/// Where a core sits in the system. Answers the usual runtime queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    cluster_idx: usize,
    cluster_num: usize,
    core_idx: usize,
    compute_core_num: usize,
}

impl Topology {
    pub fn new(cluster_idx: usize, cluster_num: usize, core_idx: usize, compute_core_num: usize) -> Self {
        debug_assert!(cluster_idx < cluster_num);
        debug_assert!(core_idx <= compute_core_num);
        Self {
            cluster_idx,
            cluster_num,
            core_idx,
            compute_core_num,
        }
    }

    pub fn role(&self) -> Role {
        if self.core_idx == self.compute_core_num {
            Role::DataMover
        } else {
            Role::Compute
        }
    }

    /// Index of this core within its cluster.
    pub fn cluster_core_idx(&self) -> usize {
        self.core_idx
    }

    /// Number of compute cores per cluster.
    pub fn compute_core_num(&self) -> usize {
        self.compute_core_num
    }

    /// Number of cores per cluster, data mover included.
    pub fn cluster_core_num(&self) -> usize {
        self.compute_core_num + 1
    }

    pub fn cluster_idx(&self) -> usize {
        self.cluster_idx
    }

    pub fn cluster_num(&self) -> usize {
        self.cluster_num
    }

    /// Index of this core across the whole system.
    pub fn global_core_idx(&self) -> usize {
        self.cluster_idx * self.cluster_core_num() + self.core_idx
    }
}

/// Contiguous share `idx` of `total` items split over `parts` workers.
///
/// Shares differ by at most one item; earlier shares get the extra ones.
pub fn contiguous_share(total: usize, parts: usize, idx: usize) -> Range<usize> {
    debug_assert!(parts > 0 && idx < parts);
    let base = total / parts;
    let extra = total % parts;
    let start = idx * base + idx.min(extra);
    let len = base + usize::from(idx < extra);
    start..start + len
}

/// Items `idx, idx + parts, idx + 2 * parts, ...` below `total`.
pub fn interleaved_share(total: usize, parts: usize, idx: usize) -> StepBy<Range<usize>> {
    debug_assert!(parts > 0);
    (idx.min(total)..total).step_by(parts)
}
