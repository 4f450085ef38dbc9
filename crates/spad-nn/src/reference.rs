//! Host golden model for LayerNorm.

use rand::Rng;
use rayon::prelude::*;
use spad_core::{DType, Result, SpadError, Tensor};

/// `(x - mean) / sqrt(var + eps)` over the last axis of a
/// `(batch, seq_len, embeddings)` tensor, computed in f32 and returned in the
/// input's precision.
pub fn layernorm(input: &Tensor, batch: usize, seq_len: usize, embeddings: usize, eps: f32) -> Result<Tensor> {
    let dims = [batch, seq_len, embeddings];
    if input.shape().dims() != dims {
        return Err(SpadError::ShapeMismatch {
            expected: dims.to_vec(),
            got: input.shape().dims().to_vec(),
        });
    }
    let x = input.to_f32_vec()?;
    let mut out = vec![0.0f32; x.len()];
    out.par_chunks_mut(embeddings.max(1))
        .zip(x.par_chunks(embeddings.max(1)))
        .for_each(|(o, row)| {
            let n = row.len() as f32;
            let mean = row.iter().sum::<f32>() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let std = (var + eps).sqrt();
            for (o, v) in o.iter_mut().zip(row) {
                *o = (v - mean) / std;
            }
        });
    Tensor::from_f32_as(&out, &dims, input.dtype())
}

/// Standard-normal input of shape (batch, seq_len, embeddings).
pub fn random_input<R: Rng>(
    batch: usize,
    seq_len: usize,
    embeddings: usize,
    dtype: DType,
    rng: &mut R,
) -> Result<Tensor> {
    Tensor::randn(&[batch, seq_len, embeddings], dtype, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_known_row() {
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 4]).unwrap();
        let y = layernorm(&x, 1, 1, 4, 0.0).unwrap().to_vec::<f32>().unwrap();
        let s = 1.25f32.sqrt();
        let want = [-1.5 / s, -0.5 / s, 0.5 / s, 1.5 / s];
        for (a, b) in y.iter().zip(want) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rows_are_independent() {
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 10.0, 20.0, 30.0], &[1, 2, 3]).unwrap();
        let y = layernorm(&x, 1, 2, 3, 1e-5).unwrap().to_vec::<f32>().unwrap();
        for row in y.chunks(3) {
            assert!(row.iter().sum::<f32>().abs() < 1e-5);
        }
    }

    #[test]
    fn test_shape_checked() {
        let mut rng = StdRng::seed_from_u64(42);
        let x = random_input(2, 4, 8, DType::Fp32, &mut rng).unwrap();
        assert!(matches!(
            layernorm(&x, 2, 8, 4, 1e-5),
            Err(SpadError::ShapeMismatch { .. })
        ));
    }
}
