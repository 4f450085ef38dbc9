//! Standalone transpose kernel: main memory → TCDM → transpose → main memory.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use spad_core::{DType, Element, Result};
use spad_runtime::{
    contiguous_share, Buf, ClusterConfig, ClusterKernel, ComputeContext, LaunchReport,
    ScratchpadArena, System, TensorRef, TransferContext,
};

use crate::layer::{ensure_divisible, ensure_nonzero, expect_tensor, unsupported_dtype};
use crate::transpose::transpose_rows;
use crate::KernelMode;

/// Transpose an `m × n` matrix into an `n × m` one.
///
/// Each cluster takes a block of `m / clusters` source rows, which becomes a
/// column block of the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeLayer {
    pub m: usize,
    pub n: usize,
    pub dtype: DType,
    #[serde(default)]
    pub baseline: bool,
}

impl TransposeLayer {
    pub fn mode(&self) -> KernelMode {
        KernelMode::from_baseline_flag(self.baseline)
    }

    pub fn validate(&self, config: &ClusterConfig) -> Result<()> {
        ensure_nonzero(&[("m", self.m), ("n", self.n)])?;
        if !self.dtype.has_host_type() {
            return Err(unsupported_dtype("transpose", self.dtype));
        }
        ensure_divisible("transpose rows per cluster", self.m, config.num_clusters)
    }

    /// Transpose `input` (`m × n`) into `output` (`n × m`).
    pub fn run(&self, system: &mut System, input: &TensorRef, output: &TensorRef) -> Result<LaunchReport> {
        self.validate(system.config())?;
        expect_tensor(input, &[self.m, self.n], self.dtype)?;
        expect_tensor(output, &[self.n, self.m], self.dtype)?;
        match self.dtype {
            DType::Fp64 => system.launch(&TransposeKernel::<f64>::new(self, input, output)),
            DType::Fp32 => system.launch(&TransposeKernel::<f32>::new(self, input, output)),
            DType::Fp16 => system.launch(&TransposeKernel::<half::f16>::new(self, input, output)),
            DType::Fp8 => Err(unsupported_dtype("transpose", self.dtype)),
        }
    }
}

struct TransposeKernel<'a, T> {
    layer: &'a TransposeLayer,
    input: &'a TensorRef,
    output: &'a TensorRef,
    _elem: PhantomData<fn() -> T>,
}

impl<'a, T> TransposeKernel<'a, T> {
    fn new(layer: &'a TransposeLayer, input: &'a TensorRef, output: &'a TensorRef) -> Self {
        Self {
            layer,
            input,
            output,
            _elem: PhantomData,
        }
    }
}

struct TransposeTiles<T> {
    rows: usize,
    src: Buf<T>,
    dst: Buf<T>,
}

impl<T: Element> ClusterKernel for TransposeKernel<'_, T> {
    type Layout = TransposeTiles<T>;

    fn name(&self) -> &'static str {
        "transpose"
    }

    fn plan(&self, config: &ClusterConfig, arena: &mut ScratchpadArena) -> Result<TransposeTiles<T>> {
        let rows = self.layer.m / config.num_clusters;
        let src = arena.alloc::<T>("src", rows * self.layer.n)?;
        let dst = arena.alloc::<T>("dst", self.layer.n * rows)?;
        tracing::debug!(m = self.layer.m, n = self.layer.n, rows_per_cluster = rows, "transpose tiling");
        Ok(TransposeTiles { rows, src, dst })
    }

    fn transfer_task(&self, ctx: &TransferContext<'_>, l: &TransposeTiles<T>) -> Result<()> {
        let dma = ctx.dma();
        let es = T::DTYPE.element_size();
        let first_row = ctx.topology().cluster_idx() * l.rows;

        dma.start_1d(l.src.addr(0), self.input.addr(first_row * self.layer.n), l.src.nbytes())?;
        dma.wait_all();
        ctx.cluster_barrier()?;

        ctx.cluster_barrier()?;
        dma.start_2d(
            self.output.addr(first_row),
            l.dst.addr(0),
            l.rows * es,
            self.layer.m * es,
            l.rows * es,
            self.layer.n,
        )?;
        dma.wait_all();
        Ok(())
    }

    fn compute_task(&self, ctx: &ComputeContext<'_>, l: &TransposeTiles<T>) -> Result<()> {
        ctx.cluster_barrier()?;
        let part = contiguous_share(self.layer.n, ctx.compute_cores(), ctx.compute_idx());
        // SAFETY: the source tile is read-only in this phase and every core
        // writes a disjoint row range of the destination tile.
        let (src, dst) = unsafe { (ctx.tcdm().read(l.src), ctx.tcdm().write(l.dst.rows(part.clone(), l.rows))) };
        transpose_rows(src, l.rows, self.layer.n, part, dst, self.layer.mode());
        ctx.cluster_barrier()?;
        Ok(())
    }
}
