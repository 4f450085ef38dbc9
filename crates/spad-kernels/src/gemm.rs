//! General matrix multiply on scratchpad-resident tiles.
//!
//! `C = alpha * op(A) * op(B) + beta * C`, with op(X) = X or Xᵀ chosen
//! per operand. Matrices are row-major with explicit leading dimensions so a
//! core can hand in just the rows it owns. Arithmetic accumulates in f32
//! whatever the element type.
//!
//! Two implementations with the same contract:
//! - [`KernelMode::Baseline`]: plain triple loop, the numerical reference.
//! - [`KernelMode::Optimized`]: lane-unrolled dot products for the native
//!   `A * Bᵀ` form (AVX2+FMA for f32 when available) and an axpy-style
//!   loop for `A * B` on f32. Other combinations use the reference loop.

use spad_core::Element;

use crate::simd::SimdCapability;
use crate::KernelMode;

/// Accumulator lanes of the portable optimized dot product.
const DOT_LANES: usize = 8;

/// Column block of the f32 axpy path.
const TILE_N: usize = 64;

/// `C = alpha * op(A) * op(B) + beta * C` for an M×N result with inner
/// dimension K.
///
/// With `beta == 0` the previous contents of C are ignored, so C may hold
/// garbage (NaN included).
#[allow(clippy::too_many_arguments)]
pub fn gemm<T: Element>(
    ta: bool,
    tb: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    beta: f32,
    c: &mut [T],
    ldc: usize,
    mode: KernelMode,
) {
    debug_assert!(m == 0 || c.len() >= (m - 1) * ldc + n, "C too small");
    match (mode, ta, tb) {
        (KernelMode::Optimized, false, true) => gemm_nt_lanes(m, n, k, alpha, a, lda, b, ldb, beta, c, ldc),
        (KernelMode::Optimized, false, false) if is_f32::<T>() => {
            gemm_nn_f32(m, n, k, alpha, as_f32(a), lda, as_f32(b), ldb, beta, as_f32_mut(c), ldc)
        }
        _ => gemm_reference(ta, tb, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc),
    }
}

#[inline(always)]
fn store<T: Element>(c: &mut T, acc: f32, alpha: f32, beta: f32) {
    *c = if beta == 0.0 {
        T::from_f32(alpha * acc)
    } else {
        T::from_f32(alpha * acc + beta * c.to_f32())
    };
}

#[allow(clippy::too_many_arguments)]
fn gemm_reference<T: Element>(
    ta: bool,
    tb: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    beta: f32,
    c: &mut [T],
    ldc: usize,
) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                let a_ip = if ta { a[p * lda + i] } else { a[i * lda + p] };
                let b_pj = if tb { b[j * ldb + p] } else { b[p * ldb + j] };
                acc += a_ip.to_f32() * b_pj.to_f32();
            }
            store(&mut c[i * ldc + j], acc, alpha, beta);
        }
    }
}

/// A * Bᵀ: every output is a dot product of two contiguous rows.
#[allow(clippy::too_many_arguments)]
fn gemm_nt_lanes<T: Element>(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    beta: f32,
    c: &mut [T],
    ldc: usize,
) {
    let avx2 = is_f32::<T>() && SimdCapability::detect().f32x8_fma();
    for i in 0..m {
        let a_row = &a[i * lda..i * lda + k];
        for j in 0..n {
            let b_row = &b[j * ldb..j * ldb + k];
            let acc = if avx2 {
                dot_f32_avx2(as_f32(a_row), as_f32(b_row))
            } else {
                dot_lanes(a_row, b_row)
            };
            store(&mut c[i * ldc + j], acc, alpha, beta);
        }
    }
}

fn dot_lanes<T: Element>(a: &[T], b: &[T]) -> f32 {
    let mut acc = [0.0f32; DOT_LANES];
    let mut a_chunks = a.chunks_exact(DOT_LANES);
    let mut b_chunks = b.chunks_exact(DOT_LANES);
    for (ca, cb) in a_chunks.by_ref().zip(b_chunks.by_ref()) {
        for lane in 0..DOT_LANES {
            acc[lane] += ca[lane].to_f32() * cb[lane].to_f32();
        }
    }
    let tail: f32 = a_chunks
        .remainder()
        .iter()
        .zip(b_chunks.remainder())
        .map(|(x, y)| x.to_f32() * y.to_f32())
        .sum();
    acc.iter().sum::<f32>() + tail
}

#[cfg(target_arch = "x86_64")]
fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    // Safety: callers only take this path after detecting AVX2+FMA.
    unsafe { dot_f32_avx2_inner(a, b) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_f32_avx2_inner(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let len = a.len().min(b.len());
    let mut acc = _mm256_setzero_ps();
    let mut p = 0;
    while p + 8 <= len {
        let va = _mm256_loadu_ps(a.as_ptr().add(p));
        let vb = _mm256_loadu_ps(b.as_ptr().add(p));
        acc = _mm256_fmadd_ps(va, vb, acc);
        p += 8;
    }

    // Horizontal sum of the 8 lanes
    let hi = _mm256_extractf128_ps(acc, 1);
    let lo = _mm256_castps256_ps128(acc);
    let sum4 = _mm_add_ps(lo, hi);
    let sum2 = _mm_add_ps(sum4, _mm_movehl_ps(sum4, sum4));
    let sum1 = _mm_add_ss(sum2, _mm_shuffle_ps(sum2, sum2, 0x55));
    let mut total = _mm_cvtss_f32(sum1);

    while p < len {
        total += a[p] * b[p];
        p += 1;
    }
    total
}

#[cfg(not(target_arch = "x86_64"))]
fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    dot_lanes(a, b)
}

/// A * B on f32: scale C once, then stream rows of B through it.
#[allow(clippy::too_many_arguments)]
fn gemm_nn_f32(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    let cap = SimdCapability::detect();
    for i in 0..m {
        let c_row = &mut c[i * ldc..i * ldc + n];
        if beta == 0.0 {
            c_row.fill(0.0);
        } else if beta != 1.0 {
            c_row.iter_mut().for_each(|v| *v *= beta);
        }
        for j0 in (0..n).step_by(TILE_N) {
            let j_end = (j0 + TILE_N).min(n);
            for p in 0..k {
                let a_val = alpha * a[i * lda + p];
                let b_row = &b[p * ldb + j0..p * ldb + j_end];
                axpy(a_val, b_row, &mut c_row[j0..j_end], cap);
            }
        }
    }
}

fn axpy(alpha: f32, x: &[f32], y: &mut [f32], cap: &SimdCapability) {
    #[cfg(target_arch = "x86_64")]
    {
        if cap.f32x8_fma() {
            // Safety: AVX2+FMA detected above.
            unsafe { axpy_avx2(alpha, x, y) };
            return;
        }
    }
    let _ = cap;
    for (yv, xv) in y.iter_mut().zip(x) {
        *yv += alpha * xv;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn axpy_avx2(alpha: f32, x: &[f32], y: &mut [f32]) {
    use std::arch::x86_64::*;

    let len = x.len().min(y.len());
    let a_val = _mm256_set1_ps(alpha);
    let mut j = 0;
    while j + 8 <= len {
        let y_ptr = y.as_mut_ptr().add(j);
        let x_vec = _mm256_loadu_ps(x.as_ptr().add(j));
        let y_vec = _mm256_loadu_ps(y_ptr);
        _mm256_storeu_ps(y_ptr, _mm256_fmadd_ps(a_val, x_vec, y_vec));
        j += 8;
    }

    // Scalar tail
    while j < len {
        y[j] += alpha * x[j];
        j += 1;
    }
}

fn is_f32<T: Element>() -> bool {
    T::DTYPE == f32::DTYPE
}

// The casts below are only reached when `is_f32::<T>()` holds, so element
// size and alignment match and bytemuck accepts them.
fn as_f32<T: Element>(x: &[T]) -> &[f32] {
    bytemuck::cast_slice(x)
}

fn as_f32_mut<T: Element>(x: &mut [T]) -> &mut [f32] {
    bytemuck::cast_slice_mut(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn seq(n: usize, modulo: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|i| (i % modulo) as f32 * scale - 0.3).collect()
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= tol * (1.0 + y.abs()), "index {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_gemm_basic() {
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0];
        for mode in [KernelMode::Baseline, KernelMode::Optimized] {
            let mut c = [0.0f32; 4];
            gemm(false, false, 2, 2, 3, 1.0, &a, 3, &b, 2, 0.0, &mut c, 2, mode);
            assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);
        }
    }

    #[test]
    fn test_transposed_b_matches_plain() {
        // B is 3x2; Bt is its 2x3 transpose.
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let bt = [7.0f32, 9.0, 11.0, 8.0, 10.0, 12.0];
        for mode in [KernelMode::Baseline, KernelMode::Optimized] {
            let mut c = [0.0f32; 4];
            gemm(false, true, 2, 2, 3, 1.0, &a, 3, &bt, 3, 0.0, &mut c, 2, mode);
            assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);
        }
    }

    #[test]
    fn test_transposed_a() {
        // At is 3x2, op(A) = A is 2x3.
        let at = [1.0f32, 4.0, 2.0, 5.0, 3.0, 6.0];
        let b = [7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0];
        let mut c = [0.0f32; 4];
        gemm(true, false, 2, 2, 3, 1.0, &at, 2, &b, 2, 0.0, &mut c, 2, KernelMode::Optimized);
        assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_beta_zero_ignores_garbage() {
        let a = [1.0f32, 1.0];
        let b = [2.0f32, 3.0];
        for mode in [KernelMode::Baseline, KernelMode::Optimized] {
            for tb in [false, true] {
                let mut c = [f32::NAN];
                gemm(false, tb, 1, 1, 2, 1.0, &a, 2, &b, if tb { 2 } else { 1 }, 0.0, &mut c, 1, mode);
                assert_eq!(c, [5.0]);
            }
        }
    }

    #[test]
    fn test_beta_one_accumulates() {
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        for mode in [KernelMode::Baseline, KernelMode::Optimized] {
            let mut c = [10.0f32];
            gemm(false, true, 1, 1, 2, 2.0, &a, 2, &b, 2, 1.0, &mut c, 1, mode);
            assert_eq!(c, [32.0]);
        }
    }

    #[test]
    fn test_modes_agree_on_odd_sizes() {
        let (m, n, k) = (13, 37, 29);
        let a = seq(m * k, 7, 0.1);
        let b = seq(n * k, 11, 0.1);
        for tb in [false, true] {
            let ldb = if tb { k } else { n };
            let mut c_ref = vec![0.5f32; m * n];
            let mut c_opt = c_ref.clone();
            gemm(false, tb, m, n, k, 0.5, &a, k, &b, ldb, 1.0, &mut c_ref, n, KernelMode::Baseline);
            gemm(false, tb, m, n, k, 0.5, &a, k, &b, ldb, 1.0, &mut c_opt, n, KernelMode::Optimized);
            assert_close(&c_opt, &c_ref, 1e-5);
        }
    }

    #[test]
    fn test_leading_dimension_subblock() {
        // Multiply the top-left 2x2 of a 2x4 A by a 2x2 B, writing into a
        // 2x3 C with one untouched column.
        let a = [1.0f32, 2.0, 99.0, 99.0, 3.0, 4.0, 99.0, 99.0];
        let b = [1.0f32, 0.0, 0.0, 1.0];
        let mut c = [0.0f32, 0.0, -1.0, 0.0, 0.0, -1.0];
        gemm(false, false, 2, 2, 2, 1.0, &a, 4, &b, 2, 0.0, &mut c, 3, KernelMode::Optimized);
        assert_eq!(c, [1.0, 2.0, -1.0, 3.0, 4.0, -1.0]);
    }

    #[test]
    fn test_half_precision() {
        let a: Vec<f16> = [1.0f32, 2.0, 3.0, 4.0].iter().map(|&v| f16::from_f32(v)).collect();
        let b: Vec<f16> = [1.0f32, 1.0, 1.0, 1.0].iter().map(|&v| f16::from_f32(v)).collect();
        for mode in [KernelMode::Baseline, KernelMode::Optimized] {
            let mut c = vec![f16::ZERO; 4];
            gemm(false, true, 2, 2, 2, 1.0, &a, 2, &b, 2, 0.0, &mut c, 2, mode);
            let c: Vec<f32> = c.iter().map(|v| v.to_f32()).collect();
            assert_eq!(c, vec![3.0, 3.0, 7.0, 7.0]);
        }
    }
}
