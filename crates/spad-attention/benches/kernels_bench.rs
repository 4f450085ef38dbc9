//! Benchmark: baseline vs optimized FlashAttention-2 and LayerNorm launches.

use rand::rngs::StdRng;
use rand::SeedableRng;
use spad_attention::{random_qkv, FlashAttention2Layer};
use spad_core::DType;
use spad_nn::{random_input, LayerNormLayer};
use spad_runtime::{ClusterConfig, System};
use std::time::Instant;

const ITERS: usize = 5;

fn machine(clusters: usize) -> ClusterConfig {
    ClusterConfig {
        num_clusters: clusters,
        ..Default::default()
    }
}

fn bench_attention(layer: &FlashAttention2Layer, clusters: usize) -> spad_core::Result<f64> {
    let mut rng = StdRng::seed_from_u64(42);
    let (q, k, v) = random_qkv(layer.n, layer.d, &mut rng)?;
    let mut sys = System::new(machine(clusters))?;
    let (q, k, v) = (sys.upload(&q)?, sys.upload(&k)?, sys.upload(&v)?);
    let o = sys.alloc([layer.n, layer.d], DType::Fp32)?;

    let start = Instant::now();
    for _ in 0..ITERS {
        layer.run(&mut sys, &q, &k, &v, &o)?;
    }
    Ok(start.elapsed().as_secs_f64() / ITERS as f64)
}

fn bench_layernorm(layer: &LayerNormLayer, clusters: usize) -> spad_core::Result<f64> {
    let mut rng = StdRng::seed_from_u64(42);
    let x = random_input(layer.batch_size, layer.seq_len, layer.embeddings, layer.dtype, &mut rng)?;
    let mut sys = System::new(machine(clusters))?;
    let input = sys.upload(&x)?;
    let output = sys.alloc(layer.dims(), layer.dtype)?;

    let start = Instant::now();
    for _ in 0..ITERS {
        layer.run(&mut sys, &input, &output)?;
    }
    Ok(start.elapsed().as_secs_f64() / ITERS as f64)
}

fn main() -> spad_core::Result<()> {
    println!("=== FlashAttention-2 ===");
    println!(
        "{:<22} {:>8} {:>12} {:>12} {:>9}",
        "N x d (B_r, B_c)", "clusters", "Base (ms)", "Opt (ms)", "Speedup"
    );
    println!("{}", "-".repeat(68));
    for &(n, d, b_r, b_c, clusters) in &[(128, 64, 32, 32, 1), (256, 64, 32, 32, 2), (512, 64, 64, 32, 4)] {
        let layer = FlashAttention2Layer {
            n,
            d,
            b_r,
            b_c,
            dtype: DType::Fp32,
            baseline: true,
        };
        let base = bench_attention(&layer, clusters)?;
        let opt = bench_attention(&FlashAttention2Layer { baseline: false, ..layer }, clusters)?;
        println!(
            "{:<22} {:>8} {:>10.2}ms {:>10.2}ms {:>8.1}x",
            format!("{n}x{d} ({b_r}, {b_c})"),
            clusters,
            base * 1e3,
            opt * 1e3,
            base / opt
        );
    }

    println!("\n=== LayerNorm ===");
    for dtype in [DType::Fp32, DType::Fp16] {
        for &(batch, seq_len, embeddings, n_tiles, clusters) in &[(1, 64, 128, 4, 1), (4, 128, 256, 16, 4)] {
            let layer = LayerNormLayer {
                batch_size: batch,
                seq_len,
                embeddings,
                n_tiles,
                eps: 1e-5,
                dtype,
                baseline: true,
            };
            let base = bench_layernorm(&layer, clusters)?;
            let opt = bench_layernorm(&LayerNormLayer { baseline: false, ..layer }, clusters)?;
            println!(
                "{:<22} {:>5} {:>10.2}ms {:>10.2}ms {:>8.1}x",
                format!("{dtype} {batch}x{seq_len}x{embeddings}/{n_tiles}"),
                clusters,
                base * 1e3,
                opt * 1e3,
                base / opt
            );
        }
    }
    Ok(())
}
