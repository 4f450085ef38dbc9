//! Matrix transpose on scratchpad tiles.
//!
//! The source is `rows × cols`, the destination `cols × rows`. Work is split
//! by destination row, so a core can transpose just its share of the output
//! with [`transpose_rows`].

use std::ops::Range;

use spad_core::Element;

use crate::KernelMode;

/// Square block edge of the blocked transpose.
const BLOCK: usize = 8;

/// `dst = srcᵀ` for a full `rows × cols` source.
pub fn transpose<T: Element>(src: &[T], dst: &mut [T], rows: usize, cols: usize, mode: KernelMode) {
    transpose_rows(src, rows, cols, 0..cols, dst, mode);
}

/// Write destination rows `dst_rows` of `srcᵀ` into `dst`, which holds
/// exactly those rows (`dst_rows.len() × rows` elements).
pub fn transpose_rows<T: Element>(
    src: &[T],
    rows: usize,
    cols: usize,
    dst_rows: Range<usize>,
    dst: &mut [T],
    mode: KernelMode,
) {
    debug_assert!(src.len() >= rows * cols);
    debug_assert!(dst_rows.end <= cols);
    debug_assert!(dst.len() >= dst_rows.len() * rows);
    match mode {
        KernelMode::Baseline => transpose_naive(src, cols, rows, dst_rows, dst),
        KernelMode::Optimized => transpose_blocked(src, cols, rows, dst_rows, dst),
    }
}

fn transpose_naive<T: Element>(src: &[T], cols: usize, rows: usize, dst_rows: Range<usize>, dst: &mut [T]) {
    let first = dst_rows.start;
    for r in dst_rows {
        let out = &mut dst[(r - first) * rows..(r - first + 1) * rows];
        for (c, v) in out.iter_mut().enumerate() {
            *v = src[c * cols + r];
        }
    }
}

fn transpose_blocked<T: Element>(src: &[T], cols: usize, rows: usize, dst_rows: Range<usize>, dst: &mut [T]) {
    let first = dst_rows.start;
    for r0 in dst_rows.clone().step_by(BLOCK) {
        let r_end = (r0 + BLOCK).min(dst_rows.end);
        for c0 in (0..rows).step_by(BLOCK) {
            let c_end = (c0 + BLOCK).min(rows);
            for c in c0..c_end {
                let src_row = &src[c * cols..(c + 1) * cols];
                for r in r0..r_end {
                    dst[(r - first) * rows + c] = src_row[r];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: usize, cols: usize) -> Vec<f32> {
        (0..rows * cols).map(|i| i as f32).collect()
    }

    #[test]
    fn test_small() {
        let src = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        for mode in [KernelMode::Baseline, KernelMode::Optimized] {
            let mut dst = [0.0f32; 6];
            transpose(&src, &mut dst, 2, 3, mode);
            assert_eq!(dst, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        }
    }

    #[test]
    fn test_modes_agree() {
        let (rows, cols) = (19, 23);
        let src = matrix(rows, cols);
        let mut a = vec![0.0f32; rows * cols];
        let mut b = vec![0.0f32; rows * cols];
        transpose(&src, &mut a, rows, cols, KernelMode::Baseline);
        transpose(&src, &mut b, rows, cols, KernelMode::Optimized);
        assert_eq!(a, b);
        for r in 0..cols {
            for c in 0..rows {
                assert_eq!(a[r * rows + c], src[c * cols + r]);
            }
        }
    }

    #[test]
    fn test_partitioned_rows_compose() {
        let (rows, cols) = (10, 12);
        let src = matrix(rows, cols);
        let mut whole = vec![0.0f32; rows * cols];
        transpose(&src, &mut whole, rows, cols, KernelMode::Baseline);

        let mut pieces = vec![0.0f32; rows * cols];
        for part in [0..5, 5..9, 9..12] {
            let out = &mut pieces[part.start * rows..part.end * rows];
            transpose_rows(&src, rows, cols, part, out, KernelMode::Optimized);
        }
        assert_eq!(pieces, whole);
    }

    #[test]
    fn test_double_transpose_is_identity() {
        let (rows, cols) = (8, 24);
        let src = matrix(rows, cols);
        let mut t = vec![0.0f32; rows * cols];
        let mut back = vec![0.0f32; rows * cols];
        transpose(&src, &mut t, rows, cols, KernelMode::Optimized);
        transpose(&t, &mut back, cols, rows, KernelMode::Optimized);
        assert_eq!(back, src);
    }
}
