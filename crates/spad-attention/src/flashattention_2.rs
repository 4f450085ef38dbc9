//! FlashAttention-2 on the cluster execution model.
//!
//! Computes `O = softmax(Q @ K^T) @ V` for N×d matrices without ever
//! holding the N×N score matrix: Q is streamed in row tiles of B_r rows,
//! K and V in column tiles of B_c rows, and an online softmax keeps a
//! running max `m_i` and normalisation sum `l_i` per query row.
//!
//! No `1/sqrt(d)` factor is applied to the scores.
//!
//! Reference: Dao, "FlashAttention-2: Faster Attention with Better
//! Parallelism and Work Partitioning" (2023).

use std::ops::Range;

use serde::{Deserialize, Serialize};
use spad_core::{DType, Result};
use spad_kernels::{
    ensure_divisible, ensure_nonzero, expect_tensor, gemm, transpose_rows, unsupported_dtype,
    KernelMode,
};
use spad_runtime::{
    contiguous_share, Buf, ClusterConfig, ClusterKernel, ComputeContext, LaunchReport,
    ScratchpadArena, System, Tcdm, TensorRef, TransferContext,
};

const KERNEL: &str = "flashattention_2";

/// Configuration of one FlashAttention-2 invocation.
///
/// Field names follow the JSON parameter files (`N`, `d`, `B_r`, `B_c`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashAttention2Layer {
    /// Sequence length (rows of Q, K, V and O).
    #[serde(rename = "N")]
    pub n: usize,
    /// Head dimension.
    pub d: usize,
    /// Rows per Q/O tile.
    #[serde(rename = "B_r")]
    pub b_r: usize,
    /// Rows per K/V tile.
    #[serde(rename = "B_c")]
    pub b_c: usize,
    pub dtype: DType,
    /// Use the reference GEMM and skip the V transpose.
    #[serde(default)]
    pub baseline: bool,
}

impl FlashAttention2Layer {
    /// Number of row tiles of Q.
    pub fn t_r(&self) -> usize {
        self.n / self.b_r
    }

    /// Number of column tiles of K and V.
    pub fn t_c(&self) -> usize {
        self.n / self.b_c
    }

    pub fn mode(&self) -> KernelMode {
        KernelMode::from_baseline_flag(self.baseline)
    }

    /// Cluster barriers every core crosses per row tile.
    pub fn barriers_per_row_tile(&self) -> usize {
        6 + 6 * self.t_c()
    }

    /// Check the configuration against the machine before any core starts.
    pub fn validate(&self, config: &ClusterConfig) -> Result<()> {
        ensure_nonzero(&[("N", self.n), ("d", self.d), ("B_r", self.b_r), ("B_c", self.b_c)])?;
        if self.dtype != DType::Fp32 {
            return Err(unsupported_dtype(KERNEL, self.dtype));
        }
        ensure_divisible("N by B_r", self.n, self.b_r)?;
        ensure_divisible("N by B_c", self.n, self.b_c)?;
        ensure_divisible("B_r by compute cores", self.b_r, config.compute_cores_per_cluster)?;
        ensure_divisible("row tiles by clusters", self.t_r(), config.num_clusters)
    }

    /// Run on `system`. All tensors are N×d fp32 in main memory.
    pub fn run(
        &self,
        system: &mut System,
        q: &TensorRef,
        k: &TensorRef,
        v: &TensorRef,
        o: &TensorRef,
    ) -> Result<LaunchReport> {
        self.validate(system.config())?;
        for t in [q, k, v, o] {
            expect_tensor(t, &[self.n, self.d], self.dtype)?;
        }
        system.launch(&FlashAttention2 {
            layer: self,
            q,
            k,
            v,
            o,
        })
    }
}

struct FlashAttention2<'a> {
    layer: &'a FlashAttention2Layer,
    q: &'a TensorRef,
    k: &'a TensorRef,
    v: &'a TensorRef,
    o: &'a TensorRef,
}

/// TCDM layout, shared by every cluster.
struct Tiles {
    row_tiles_per_cluster: usize,
    q: Buf<f32>,
    k: Buf<f32>,
    v: Buf<f32>,
    /// Vᵀ for the optimized P·V product.
    v_t: Option<Buf<f32>>,
    s: Buf<f32>,
    p: Buf<f32>,
    o: Buf<f32>,
    m_i: Buf<f32>,
    m_i_prev: Buf<f32>,
    l_i: Buf<f32>,
}

impl ClusterKernel for FlashAttention2<'_> {
    type Layout = Tiles;

    fn name(&self) -> &'static str {
        KERNEL
    }

    fn plan(&self, config: &ClusterConfig, arena: &mut ScratchpadArena) -> Result<Tiles> {
        let FlashAttention2Layer { d, b_r, b_c, .. } = *self.layer;
        let tiles = Tiles {
            row_tiles_per_cluster: self.layer.t_r() / config.num_clusters,
            q: arena.alloc("Q", b_r * d)?,
            k: arena.alloc("K", b_c * d)?,
            v: arena.alloc("V", b_c * d)?,
            v_t: match self.layer.mode() {
                KernelMode::Optimized => Some(arena.alloc("V_t", d * b_c)?),
                KernelMode::Baseline => None,
            },
            s: arena.alloc("S", b_r * b_c)?,
            p: arena.alloc("P", b_r * b_c)?,
            o: arena.alloc("O", b_r * d)?,
            m_i: arena.alloc("m_i", b_r)?,
            m_i_prev: arena.alloc("m_i_prev", b_r)?,
            l_i: arena.alloc("l_i", b_r)?,
        };
        tracing::debug!(
            n = self.layer.n,
            d,
            b_r,
            b_c,
            t_r = self.layer.t_r(),
            t_c = self.layer.t_c(),
            row_tiles_per_cluster = tiles.row_tiles_per_cluster,
            mode = ?self.layer.mode(),
            "flashattention_2 tiling"
        );
        Ok(tiles)
    }

    fn transfer_task(&self, ctx: &TransferContext<'_>, l: &Tiles) -> Result<()> {
        let FlashAttention2Layer { d, b_r, b_c, .. } = *self.layer;
        let dma = ctx.dma();
        let row_bytes = d * std::mem::size_of::<f32>();
        let clusters = ctx.topology().cluster_num();

        for i in 0..l.row_tiles_per_cluster {
            let t_r = ctx.topology().cluster_idx() + i * clusters;
            tracing::trace!(t_r, "row tile");

            let q_offset = t_r * b_r * d;
            dma.start_2d(l.q.addr(0), self.q.addr(q_offset), row_bytes, row_bytes, row_bytes, b_r)?;
            dma.wait_all();

            ctx.cluster_barrier()?;
            // statistics reset
            ctx.cluster_barrier()?;
            ctx.cluster_barrier()?;

            for t_c in 0..self.layer.t_c() {
                ctx.cluster_barrier()?;

                let kv_offset = t_c * b_c * d;
                dma.start_2d(l.k.addr(0), self.k.addr(kv_offset), row_bytes, row_bytes, row_bytes, b_c)?;
                dma.start_2d(l.v.addr(0), self.v.addr(kv_offset), row_bytes, row_bytes, row_bytes, b_c)?;
                dma.wait_all();

                ctx.cluster_barrier()?;
                // S = Q K^T
                ctx.cluster_barrier()?;
                // softmax statistics
                ctx.cluster_barrier()?;
                // V transpose
                ctx.cluster_barrier()?;
                // O += P V
                ctx.cluster_barrier()?;
            }

            ctx.cluster_barrier()?;
            // final O / l_i
            ctx.cluster_barrier()?;
            ctx.cluster_barrier()?;

            dma.start_2d(self.o.addr(q_offset), l.o.addr(0), row_bytes, row_bytes, row_bytes, b_r)?;
            dma.wait_all();
        }
        Ok(())
    }

    fn compute_task(&self, ctx: &ComputeContext<'_>, l: &Tiles) -> Result<()> {
        let FlashAttention2Layer { d, b_r, b_c, .. } = *self.layer;
        let tcdm = ctx.tcdm();
        let mode = self.layer.mode();
        let rows = contiguous_share(b_r, ctx.compute_cores(), ctx.compute_idx());
        let vt_rows = contiguous_share(d, ctx.compute_cores(), ctx.compute_idx());

        for _ in 0..l.row_tiles_per_cluster {
            ctx.cluster_barrier()?;

            // SAFETY: each core owns the statistics of its rows.
            unsafe {
                tcdm.write(l.m_i.slice(rows.clone())).fill(f32::NEG_INFINITY);
                tcdm.write(l.m_i_prev.slice(rows.clone())).fill(f32::NEG_INFINITY);
                tcdm.write(l.l_i.slice(rows.clone())).fill(0.0);
            }

            ctx.cluster_barrier()?;
            ctx.cluster_barrier()?;

            for t_c in 0..self.layer.t_c() {
                ctx.cluster_barrier()?;
                ctx.cluster_barrier()?;

                // SAFETY: Q and K are read-only in this phase; each core
                // writes only its own rows of S.
                unsafe {
                    let q = tcdm.read(l.q.rows(rows.clone(), d));
                    let k = tcdm.read(l.k);
                    let s = tcdm.write(l.s.rows(rows.clone(), b_c));
                    gemm(false, true, rows.len(), b_c, d, 1.0, q, d, k, d, 0.0, s, b_c, mode);
                }

                ctx.cluster_barrier()?;

                // SAFETY: rows of S, P, O and the statistics are core-private.
                unsafe { update_statistics(tcdm, l, rows.clone(), b_c, d, t_c == 0) };

                ctx.cluster_barrier()?;

                if let Some(v_t) = l.v_t {
                    // SAFETY: V is read-only; each core writes a disjoint
                    // row range of V_t.
                    unsafe {
                        let v = tcdm.read(l.v);
                        let dst = tcdm.write(v_t.rows(vt_rows.clone(), b_c));
                        transpose_rows(v, b_c, d, vt_rows.clone(), dst, mode);
                    }
                }

                ctx.cluster_barrier()?;

                let beta = if t_c == 0 { 0.0 } else { 1.0 };
                // SAFETY: P rows and O rows are core-private; V and V_t are
                // read-only in this phase.
                unsafe {
                    let p = tcdm.read(l.p.rows(rows.clone(), b_c));
                    let o = tcdm.write(l.o.rows(rows.clone(), d));
                    match l.v_t {
                        Some(v_t) => {
                            let v_t = tcdm.read(v_t);
                            gemm(false, true, rows.len(), d, b_c, 1.0, p, b_c, v_t, b_c, beta, o, d, mode);
                        }
                        None => {
                            let v = tcdm.read(l.v);
                            gemm(false, false, rows.len(), d, b_c, 1.0, p, b_c, v, d, beta, o, d, mode);
                        }
                    }
                }

                ctx.cluster_barrier()?;
            }

            ctx.cluster_barrier()?;

            // SAFETY: O rows and l_i are core-private.
            unsafe {
                let l_i = tcdm.read(l.l_i.slice(rows.clone()));
                let o = tcdm.write(l.o.rows(rows.clone(), d));
                for (o_row, &sum) in o.chunks_exact_mut(d).zip(l_i) {
                    o_row.iter_mut().for_each(|x| *x /= sum);
                }
            }

            ctx.cluster_barrier()?;
            ctx.cluster_barrier()?;
        }
        Ok(())
    }
}

/// Online-softmax step for `rows` of the current S tile.
///
/// # Safety
///
/// The caller must own `rows` of S, P, O and the statistics vectors.
unsafe fn update_statistics(tcdm: &Tcdm, l: &Tiles, rows: Range<usize>, b_c: usize, d: usize, first: bool) {
    let s = tcdm.read(l.s.rows(rows.clone(), b_c));
    let p = tcdm.write(l.p.rows(rows.clone(), b_c));
    let o = tcdm.write(l.o.rows(rows.clone(), d));
    let m_i = tcdm.write(l.m_i.slice(rows.clone()));
    let m_i_prev = tcdm.write(l.m_i_prev.slice(rows.clone()));
    let l_i = tcdm.write(l.l_i.slice(rows));

    for r in 0..m_i.len() {
        online_softmax_row(
            &s[r * b_c..(r + 1) * b_c],
            &mut p[r * b_c..(r + 1) * b_c],
            &mut o[r * d..(r + 1) * d],
            &mut m_i[r],
            &mut m_i_prev[r],
            &mut l_i[r],
            first,
        );
    }
}

/// One query row against one column tile.
///
/// Writes `p = exp(s - m)`, moves the running max `m` (keeping the old one
/// in `m_prev`), and rescales `l` and the accumulated `o` by
/// `exp(m_prev - m)` unless this is the first tile of the row.
fn online_softmax_row(
    s: &[f32],
    p: &mut [f32],
    o: &mut [f32],
    m: &mut f32,
    m_prev: &mut f32,
    l: &mut f32,
    first: bool,
) {
    *m_prev = *m;
    *m = s.iter().copied().fold(*m, f32::max);

    let mut row_sum = 0.0f32;
    for (p_c, &s_c) in p.iter_mut().zip(s) {
        *p_c = (s_c - *m).exp();
        row_sum += *p_c;
    }

    if first {
        *l = row_sum;
    } else {
        let shifted_exp = (*m_prev - *m).exp();
        *l = *l * shifted_exp + row_sum;
        o.iter_mut().for_each(|x| *x *= shifted_exp);
    }
}
