//! LayerNorm on the cluster execution model.
//!
//! The input is a `(batch, seq_len, embeddings)` tensor normalised along
//! the embedding axis. The sequence axis is cut into `n_tiles` blocks and
//! each cluster takes a run of `n_tiles / C` consecutive blocks. Per block the
//! data mover gathers every batch's slice with one strided 2D transfer,
//! the compute cores normalise the rows of the tile interleaved (row `r`
//! to core `r mod P`), and the data mover scatters the tile back.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use spad_core::{DType, Element, Result};
use spad_kernels::{ensure_divisible, ensure_nonzero, expect_tensor, unsupported_dtype, KernelMode};
use spad_runtime::{
    interleaved_share, Buf, ClusterConfig, ClusterKernel, ComputeContext, LaunchReport,
    ScratchpadArena, System, TensorRef, TransferContext,
};

use crate::reduction::{PackedF16, PackedF32, RowReduction, ScalarReduction};

const KERNEL: &str = "layernorm";

fn default_eps() -> f32 {
    1e-5
}

/// Configuration of one LayerNorm invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNormLayer {
    pub batch_size: usize,
    pub seq_len: usize,
    pub embeddings: usize,
    /// Blocks the sequence axis is cut into.
    pub n_tiles: usize,
    #[serde(default = "default_eps")]
    pub eps: f32,
    pub dtype: DType,
    /// Use the scalar row reduction.
    #[serde(default)]
    pub baseline: bool,
}

impl LayerNormLayer {
    pub fn mode(&self) -> KernelMode {
        KernelMode::from_baseline_flag(self.baseline)
    }

    /// Sequence positions per tile.
    pub fn tile_seq_len(&self) -> usize {
        self.seq_len / self.n_tiles
    }

    /// Elements of one tile, all batches included.
    pub fn tile_elems(&self) -> usize {
        self.batch_size * self.tile_seq_len() * self.embeddings
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.batch_size, self.seq_len, self.embeddings]
    }

    pub fn validate(&self, config: &ClusterConfig) -> Result<()> {
        ensure_nonzero(&[
            ("batch_size", self.batch_size),
            ("seq_len", self.seq_len),
            ("embeddings", self.embeddings),
            ("n_tiles", self.n_tiles),
        ])?;
        if !matches!(self.dtype, DType::Fp32 | DType::Fp16) {
            return Err(unsupported_dtype(KERNEL, self.dtype));
        }
        ensure_divisible("seq_len by n_tiles", self.seq_len, self.n_tiles)?;
        ensure_divisible("tiles by clusters", self.n_tiles, config.num_clusters)
    }

    /// Normalise `input` into `output`, both `(batch_size, seq_len, embeddings)`.
    pub fn run(&self, system: &mut System, input: &TensorRef, output: &TensorRef) -> Result<LaunchReport> {
        self.validate(system.config())?;
        expect_tensor(input, &self.dims(), self.dtype)?;
        expect_tensor(output, &self.dims(), self.dtype)?;
        match (self.dtype, self.mode()) {
            (DType::Fp32, KernelMode::Baseline) => {
                system.launch(&LayerNormKernel::<f32, ScalarReduction>::new(self, input, output))
            }
            (DType::Fp32, KernelMode::Optimized) => {
                system.launch(&LayerNormKernel::<f32, PackedF32>::new(self, input, output))
            }
            (DType::Fp16, KernelMode::Baseline) => {
                system.launch(&LayerNormKernel::<half::f16, ScalarReduction>::new(self, input, output))
            }
            (DType::Fp16, KernelMode::Optimized) => {
                system.launch(&LayerNormKernel::<half::f16, PackedF16>::new(self, input, output))
            }
            (other, _) => Err(unsupported_dtype(KERNEL, other)),
        }
    }
}

struct LayerNormKernel<'a, T, R> {
    layer: &'a LayerNormLayer,
    input: &'a TensorRef,
    output: &'a TensorRef,
    _marker: PhantomData<fn() -> (T, R)>,
}

impl<'a, T, R> LayerNormKernel<'a, T, R> {
    fn new(layer: &'a LayerNormLayer, input: &'a TensorRef, output: &'a TensorRef) -> Self {
        Self {
            layer,
            input,
            output,
            _marker: PhantomData,
        }
    }
}

struct NormTiles<T> {
    tiles_per_cluster: usize,
    input: Buf<T>,
    output: Buf<T>,
}

impl<T: Element, R: RowReduction> ClusterKernel for LayerNormKernel<'_, T, R> {
    type Layout = NormTiles<T>;

    fn name(&self) -> &'static str {
        KERNEL
    }

    fn plan(&self, config: &ClusterConfig, arena: &mut ScratchpadArena) -> Result<NormTiles<T>> {
        let elems = self.layer.tile_elems();
        let tiles = NormTiles {
            tiles_per_cluster: self.layer.n_tiles / config.num_clusters,
            input: arena.alloc("itile", elems)?,
            output: arena.alloc("otile", elems)?,
        };
        tracing::debug!(
            batch = self.layer.batch_size,
            seq_len = self.layer.seq_len,
            embeddings = self.layer.embeddings,
            n_tiles = self.layer.n_tiles,
            tile_seq_len = self.layer.tile_seq_len(),
            tiles_per_cluster = tiles.tiles_per_cluster,
            reduction = R::NAME,
            "layernorm tiling"
        );
        Ok(tiles)
    }

    fn transfer_task(&self, ctx: &TransferContext<'_>, l: &NormTiles<T>) -> Result<()> {
        let LayerNormLayer {
            batch_size,
            seq_len,
            embeddings,
            ..
        } = *self.layer;
        let es = T::DTYPE.element_size();
        let tile_seq_len = self.layer.tile_seq_len();
        let slice_bytes = tile_seq_len * embeddings * es;
        let batch_stride = seq_len * embeddings * es;
        let dma = ctx.dma();

        for i in 0..l.tiles_per_cluster {
            let tile_idx = ctx.topology().cluster_idx() * l.tiles_per_cluster + i;
            let offset = tile_idx * tile_seq_len * embeddings;
            tracing::trace!(tile_idx, "layernorm tile");

            let load = dma.start_2d(l.input.addr(0), self.input.addr(offset), slice_bytes, slice_bytes, batch_stride, batch_size)?;
            dma.wait(load);

            ctx.cluster_barrier()?;
            // normalise
            ctx.cluster_barrier()?;

            let store = dma.start_2d(self.output.addr(offset), l.output.addr(0), slice_bytes, batch_stride, slice_bytes, batch_size)?;
            dma.wait(store);
        }
        Ok(())
    }

    fn compute_task(&self, ctx: &ComputeContext<'_>, l: &NormTiles<T>) -> Result<()> {
        let emb = self.layer.embeddings;
        let eps = self.layer.eps;
        let rows = self.layer.batch_size * self.layer.tile_seq_len();
        let tcdm = ctx.tcdm();

        for _ in 0..l.tiles_per_cluster {
            ctx.cluster_barrier()?;

            for r in interleaved_share(rows, ctx.compute_cores(), ctx.compute_idx()) {
                // SAFETY: the input tile is read-only in this phase and row
                // `r` of the output tile belongs to this core alone.
                unsafe {
                    let x = tcdm.read(l.input.rows(r..r + 1, emb));
                    let y = tcdm.write(l.output.rows(r..r + 1, emb));
                    R::normalize_row(x, y, eps);
                }
            }

            ctx.cluster_barrier()?;
        }
        Ok(())
    }
}
