//! Host golden models for the attention kernel.
//!
//! `softmax(Q @ K^T * scale) @ V` computed directly, and the exact tiled
//! online-softmax recurrence the cluster kernel runs, with hooks for
//! visiting column tiles in any order and stopping early.

use rand::Rng;
use rayon::prelude::*;
use spad_core::{DType, Result, SpadError, Tensor};

/// Unpack a 2D f32 tensor into (rows, cols, data).
fn matrix(t: &Tensor) -> Result<(usize, usize, Vec<f32>)> {
    if t.dtype() != DType::Fp32 {
        return Err(SpadError::UnsupportedDType(t.dtype()));
    }
    match t.shape().dims() {
        &[rows, cols] => Ok((rows, cols, t.to_vec::<f32>()?)),
        other => Err(SpadError::ShapeMismatch {
            expected: vec![0, 0],
            got: other.to_vec(),
        }),
    }
}

fn check_kv(q_cols: usize, k: (usize, usize), v: (usize, usize)) -> Result<()> {
    if k.1 != q_cols || v.0 != k.0 {
        return Err(SpadError::ShapeMismatch {
            expected: vec![k.0, q_cols],
            got: vec![v.0, k.1],
        });
    }
    Ok(())
}

/// Direct attention over the full score matrix.
///
/// # Arguments
/// * `query` - [seq_q, d]
/// * `key`   - [seq_k, d]
/// * `value` - [seq_k, d_v]
/// * `scale` - Optional factor applied to the scores. `None` applies no
///   scaling, which is what the cluster kernel computes.
///
/// # Returns
/// * `output` - [seq_q, d_v]
pub fn attention(query: &Tensor, key: &Tensor, value: &Tensor, scale: Option<f32>) -> Result<Tensor> {
    let (seq_q, d, q) = matrix(query)?;
    let (seq_k, d_k, k) = matrix(key)?;
    let (seq_v, d_v, v) = matrix(value)?;
    check_kv(d, (seq_k, d_k), (seq_v, d_v))?;
    let scale = scale.unwrap_or(1.0);

    let mut output = vec![0.0f32; seq_q * d_v];
    output
        .par_chunks_mut(d_v.max(1))
        .enumerate()
        .for_each(|(i, out)| {
            let q_row = &q[i * d..(i + 1) * d];
            let scores: Vec<f32> = (0..seq_k)
                .map(|j| {
                    let k_row = &k[j * d..(j + 1) * d];
                    q_row.iter().zip(k_row).map(|(a, b)| a * b).sum::<f32>() * scale
                })
                .collect();
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let weights: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
            let sum: f32 = weights.iter().sum();
            for (j, w) in weights.iter().enumerate() {
                let v_row = &v[j * d_v..(j + 1) * d_v];
                for (o, &x) in out.iter_mut().zip(v_row) {
                    *o += w / sum * x;
                }
            }
        });

    Tensor::from_f32(&output, &[seq_q, d_v])
}

/// Result of the tiled golden model.
#[derive(Debug, Clone)]
pub struct OnlineAttention {
    /// Normalised output `O / l`, [seq_q, d_v].
    pub output: Tensor,
    /// Final running max per query row.
    pub row_max: Vec<f32>,
    /// Final running normalisation sum per query row.
    pub row_sum: Vec<f32>,
}

/// The tiled online-softmax recurrence, tile for tile as the kernel runs it.
///
/// `column_order` lists the column tiles to visit (default `0..T_c`);
/// `stop_after` truncates the visit after that many tiles.
pub fn online_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    b_r: usize,
    b_c: usize,
    column_order: Option<&[usize]>,
    stop_after: Option<usize>,
) -> Result<OnlineAttention> {
    let (n, d, q) = matrix(query)?;
    let (seq_k, d_k, k) = matrix(key)?;
    let (seq_v, d_v, v) = matrix(value)?;
    check_kv(d, (seq_k, d_k), (seq_v, d_v))?;
    for (what, dividend, divisor) in [("rows per row tile", n, b_r), ("columns per column tile", seq_k, b_c)] {
        if divisor == 0 || dividend % divisor != 0 {
            return Err(SpadError::Indivisible { what, dividend, divisor });
        }
    }

    let t_c = seq_k / b_c;
    let default_order: Vec<usize> = (0..t_c).collect();
    let order = column_order.unwrap_or(&default_order);
    if let Some(&bad) = order.iter().find(|&&j| j >= t_c) {
        return Err(SpadError::InvalidConfig(format!("column tile {bad} out of range 0..{t_c}")));
    }
    let visited = &order[..stop_after.unwrap_or(order.len()).min(order.len())];

    let blocks: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = (0..n / b_r)
        .into_par_iter()
        .map(|t_r| {
            let q_i = &q[t_r * b_r * d..(t_r + 1) * b_r * d];
            let mut o_i = vec![0.0f32; b_r * d_v];
            let mut m_i = vec![f32::NEG_INFINITY; b_r];
            let mut l_i = vec![0.0f32; b_r];
            let mut p = vec![0.0f32; b_c];

            for (step, &j) in visited.iter().enumerate() {
                let k_j = &k[j * b_c * d..(j + 1) * b_c * d];
                let v_j = &v[j * b_c * d_v..(j + 1) * b_c * d_v];
                for r in 0..b_r {
                    let q_row = &q_i[r * d..(r + 1) * d];
                    for (c, p_c) in p.iter_mut().enumerate() {
                        *p_c = q_row.iter().zip(&k_j[c * d..(c + 1) * d]).map(|(a, b)| a * b).sum();
                    }
                    let m_prev = m_i[r];
                    m_i[r] = p.iter().copied().fold(m_prev, f32::max);
                    let mut row_sum = 0.0f32;
                    for p_c in p.iter_mut() {
                        *p_c = (*p_c - m_i[r]).exp();
                        row_sum += *p_c;
                    }
                    let o_row = &mut o_i[r * d_v..(r + 1) * d_v];
                    if step == 0 {
                        l_i[r] = row_sum;
                        o_row.fill(0.0);
                    } else {
                        let shifted_exp = (m_prev - m_i[r]).exp();
                        l_i[r] = l_i[r] * shifted_exp + row_sum;
                        o_row.iter_mut().for_each(|o| *o *= shifted_exp);
                    }
                    for (c, &w) in p.iter().enumerate() {
                        for (o, &x) in o_row.iter_mut().zip(&v_j[c * d_v..(c + 1) * d_v]) {
                            *o += w * x;
                        }
                    }
                }
            }

            for (r, &l) in l_i.iter().enumerate() {
                o_i[r * d_v..(r + 1) * d_v].iter_mut().for_each(|o| *o /= l);
            }
            (o_i, m_i, l_i)
        })
        .collect();

    let mut output = Vec::with_capacity(n * d_v);
    let mut row_max = Vec::with_capacity(n);
    let mut row_sum = Vec::with_capacity(n);
    for (o, m, l) in blocks {
        output.extend(o);
        row_max.extend(m);
        row_sum.extend(l);
    }
    Ok(OnlineAttention {
        output: Tensor::from_f32(&output, &[n, d_v])?,
        row_max,
        row_sum,
    })
}

/// Q, K and V of shape [n, d] with entries uniform in [-1, 1).
pub fn random_qkv<R: Rng>(n: usize, d: usize, rng: &mut R) -> Result<(Tensor, Tensor, Tensor)> {
    let q = Tensor::rand_uniform(&[n, d], DType::Fp32, -1.0, 1.0, rng)?;
    let k = Tensor::rand_uniform(&[n, d], DType::Fp32, -1.0, 1.0, rng)?;
    let v = Tensor::rand_uniform(&[n, d], DType::Fp32, -1.0, 1.0, rng)?;
    Ok((q, k, v))
}
