//! Row reductions for normalisation.
//!
//! A [`RowReduction`] computes the statistics of one row and writes the
//! normalised row. [`ScalarReduction`] is the plain two-pass loop and the
//! numerical reference. [`VectorizedReduction`] gathers the sum and the sum
//! of squares in one fused pass over `UNROLL` independent accumulators of
//! `LANES` lanes each, folds them with a horizontal sum, and normalises in
//! a second pass: the shape of a packed-SIMD kernel on a 64-bit register.
//! Arithmetic is f32 for every element type.

use spad_core::Element;

/// Unroll factor of the packed strategies.
pub const DEFAULT_UNROLL: usize = 4;

/// Two f32 lanes per 64-bit register.
pub type PackedF32 = VectorizedReduction<2, DEFAULT_UNROLL>;

/// Four f16 lanes per 64-bit register.
pub type PackedF16 = VectorizedReduction<4, DEFAULT_UNROLL>;

/// Strategy for the per-row work of a normalisation layer.
pub trait RowReduction: Send + Sync + 'static {
    const NAME: &'static str;

    /// Mean and population variance of a non-empty row.
    fn moments<T: Element>(row: &[T]) -> (f32, f32);

    /// `out = (row - mean) * inv_std`.
    fn scale<T: Element>(row: &[T], out: &mut [T], mean: f32, inv_std: f32);

    /// Normalise `row` into `out`: `(x - mean) / sqrt(var + eps)`.
    fn normalize_row<T: Element>(row: &[T], out: &mut [T], eps: f32) {
        debug_assert_eq!(row.len(), out.len());
        if row.is_empty() {
            return;
        }
        let (mean, var) = Self::moments(row);
        Self::scale(row, out, mean, 1.0 / (var + eps).sqrt());
    }
}

/// One accumulator, one element at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarReduction;

impl RowReduction for ScalarReduction {
    const NAME: &'static str = "scalar";

    fn moments<T: Element>(row: &[T]) -> (f32, f32) {
        let n = row.len() as f32;
        let mean = row.iter().map(|x| x.to_f32()).sum::<f32>() / n;
        let var = row
            .iter()
            .map(|x| {
                let d = x.to_f32() - mean;
                d * d
            })
            .sum::<f32>()
            / n;
        (mean, var)
    }

    fn scale<T: Element>(row: &[T], out: &mut [T], mean: f32, inv_std: f32) {
        for (o, x) in out.iter_mut().zip(row) {
            *o = T::from_f32((x.to_f32() - mean) * inv_std);
        }
    }
}

/// `UNROLL` accumulators of `LANES` lanes, folded at the end.
///
/// Rows whose length is not a multiple of `LANES * UNROLL` finish with a
/// scalar tail. Sums are taken relative to the first element of the row so
/// the single-pass variance does not cancel catastrophically when the mean
/// is large against the spread.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorizedReduction<const LANES: usize, const UNROLL: usize>;

impl<const LANES: usize, const UNROLL: usize> VectorizedReduction<LANES, UNROLL> {
    const BLOCK: usize = LANES * UNROLL;

    /// `(sum(x - shift), sum((x - shift)^2))` in one pass.
    #[inline(always)]
    fn shifted_sums<T: Element>(row: &[T], shift: f32) -> (f32, f32) {
        let mut s1 = [[0.0f32; LANES]; UNROLL];
        let mut s2 = [[0.0f32; LANES]; UNROLL];
        let blocks = row.chunks_exact(Self::BLOCK);
        let tail = blocks.remainder();
        for block in blocks {
            for ((r1, r2), vec) in s1.iter_mut().zip(s2.iter_mut()).zip(block.chunks_exact(LANES)) {
                for ((l1, l2), x) in r1.iter_mut().zip(r2.iter_mut()).zip(vec) {
                    let d = x.to_f32() - shift;
                    *l1 += d;
                    *l2 += d * d;
                }
            }
        }
        // horizontal sum
        let hsum = |acc: &[[f32; LANES]; UNROLL]| acc.iter().map(|reg| reg.iter().sum::<f32>()).sum::<f32>();
        let (mut sum, mut sum_sq) = (hsum(&s1), hsum(&s2));
        for x in tail {
            let d = x.to_f32() - shift;
            sum += d;
            sum_sq += d * d;
        }
        (sum, sum_sq)
    }
}

impl<const LANES: usize, const UNROLL: usize> RowReduction for VectorizedReduction<LANES, UNROLL> {
    const NAME: &'static str = "vectorized";

    fn moments<T: Element>(row: &[T]) -> (f32, f32) {
        let n = row.len() as f32;
        let shift = row.first().map_or(0.0, |x| x.to_f32());
        let (sum, sum_sq) = Self::shifted_sums(row, shift);
        let mean_shifted = sum / n;
        let var = (sum_sq / n - mean_shifted * mean_shifted).max(0.0);
        (shift + mean_shifted, var)
    }

    fn scale<T: Element>(row: &[T], out: &mut [T], mean: f32, inv_std: f32) {
        let mut src = row.chunks_exact(LANES);
        let mut dst = out.chunks_exact_mut(LANES);
        for (o_vec, x_vec) in (&mut dst).zip(&mut src) {
            for (o, x) in o_vec.iter_mut().zip(x_vec) {
                *o = T::from_f32((x.to_f32() - mean) * inv_std);
            }
        }
        for (o, x) in dst.into_remainder().iter_mut().zip(src.remainder()) {
            *o = T::from_f32((x.to_f32() - mean) * inv_std);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn row(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i * 7 % 13) as f32 - 6.0) * 0.37).collect()
    }

    #[test]
    fn test_moments_agree() {
        for n in [1, 7, 8, 16, 33] {
            let r = row(n);
            let (mean, var) = ScalarReduction::moments(&r);
            for (m, v) in [PackedF32::moments(&r), PackedF16::moments(&r)] {
                assert!((m - mean).abs() < 1e-5, "n = {n}: mean {m} vs {mean}");
                assert!((v - var).abs() < 1e-4, "n = {n}: var {v} vs {var}");
            }
        }
    }

    #[test]
    fn test_fused_variance_survives_large_offset() {
        let r: Vec<f32> = row(40).into_iter().map(|x| x + 1.0e4).collect();
        let (mean, var) = ScalarReduction::moments(&r);
        let (m, v) = PackedF32::moments(&r);
        assert!((m - mean).abs() < 5e-2);
        assert!((v - var).abs() < 1e-2 * var, "var {v} vs {var}");
    }

    #[test]
    fn test_normalized_row_statistics() {
        let r = row(32);
        let mut out = vec![0.0f32; 32];
        PackedF32::normalize_row(&r, &mut out, 1e-5);
        let mean: f32 = out.iter().sum::<f32>() / 32.0;
        let var: f32 = out.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / 32.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_strategies_match_on_f16() {
        let r: Vec<f16> = row(24).into_iter().map(f16::from_f32).collect();
        let mut scalar = vec![f16::ZERO; 24];
        let mut packed = vec![f16::ZERO; 24];
        ScalarReduction::normalize_row(&r, &mut scalar, 1e-5);
        PackedF16::normalize_row(&r, &mut packed, 1e-5);
        for (a, b) in scalar.iter().zip(&packed) {
            assert!((a.to_f32() - b.to_f32()).abs() < 2e-3);
        }
    }

    #[test]
    fn test_constant_row_is_zero() {
        let r = [3.0f32; 10];
        let mut out = [1.0f32; 10];
        ScalarReduction::normalize_row(&r, &mut out, 1e-5);
        assert!(out.iter().all(|&x| x == 0.0));
        let mut out = [1.0f32; 10];
        PackedF32::normalize_row(&r, &mut out, 1e-5);
        assert!(out.iter().all(|&x| x == 0.0));
    }
}
