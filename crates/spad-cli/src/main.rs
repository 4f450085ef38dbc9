use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use tracing_subscriber::prelude::*;

use spad_attention::{attention, random_qkv, FlashAttention2Layer};
use spad_core::{DType, Tensor};
use spad_kernels::{SimdCapability, TransposeLayer};
use spad_nn::{layernorm, random_input, LayerNormLayer};
use spad_runtime::{ClusterConfig, LaunchReport, System};

const BANNER: &str = r#"
  ____  ____   _    ____
 / ___||  _ \ / \  |  _ \
 \___ \| |_) / _ \ | | | |
  ___) |  __/ ___ \| |_| |
 |____/|_| /_/   \_\____/"#;

#[derive(Parser)]
#[command(
    name = "spad",
    about = "Scratchpad-tiled kernels on a simulated multi-cluster machine",
    long_about = "Runs the FlashAttention-2, LayerNorm and transpose kernels on a\nsimulated machine of clusters (compute cores + one data mover sharing a\nscratchpad), then checks the result against the host golden model.",
    version
)]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct MachineArgs {
    /// Machine configuration JSON; the flags below override it
    #[arg(long)]
    machine: Option<PathBuf>,
    /// Number of clusters
    #[arg(long)]
    clusters: Option<usize>,
    /// Compute cores per cluster (one data mover is added)
    #[arg(long)]
    cores: Option<usize>,
    /// Scratchpad size per cluster in KiB
    #[arg(long)]
    tcdm_kib: Option<usize>,
    /// Seed of the input generator
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show platform, SIMD tier and the default machine
    Info,
    /// Run FlashAttention-2 and verify against softmax(Q K^T) V
    FlashAttention {
        #[command(flatten)]
        machine: MachineArgs,
        /// Layer configuration JSON (N, d, B_r, B_c, dtype, baseline)
        #[arg(long)]
        cfg: Option<PathBuf>,
        #[arg(long, default_value_t = 128)]
        n: usize,
        #[arg(long, default_value_t = 64)]
        d: usize,
        #[arg(long, default_value_t = 32)]
        b_r: usize,
        #[arg(long, default_value_t = 32)]
        b_c: usize,
        /// Use the baseline primitives
        #[arg(long)]
        baseline: bool,
    },
    /// Run LayerNorm and verify against the host model
    Layernorm {
        #[command(flatten)]
        machine: MachineArgs,
        /// Layer configuration JSON
        #[arg(long)]
        cfg: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        batch_size: usize,
        #[arg(long, default_value_t = 32)]
        seq_len: usize,
        #[arg(long, default_value_t = 64)]
        embeddings: usize,
        #[arg(long, default_value_t = 4)]
        n_tiles: usize,
        #[arg(long, default_value_t = 1e-5)]
        eps: f32,
        /// fp32 or fp16
        #[arg(long, default_value = "fp32")]
        dtype: DType,
        /// Use the scalar row reduction
        #[arg(long)]
        baseline: bool,
    },
    /// Run the transpose kernel and verify it exactly
    Transpose {
        #[command(flatten)]
        machine: MachineArgs,
        /// Layer configuration JSON
        #[arg(long)]
        cfg: Option<PathBuf>,
        #[arg(long, default_value_t = 64)]
        m: usize,
        #[arg(long, default_value_t = 64)]
        n: usize,
        #[arg(long, default_value = "fp32")]
        dtype: DType,
        /// Use the naive transpose
        #[arg(long)]
        baseline: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::FlashAttention {
            machine,
            cfg,
            n,
            d,
            b_r,
            b_c,
            baseline,
        } => {
            let layer = match cfg {
                Some(path) => load_layer(&path)?,
                None => FlashAttention2Layer {
                    n,
                    d,
                    b_r,
                    b_c,
                    dtype: DType::Fp32,
                    baseline,
                },
            };
            cmd_flash_attention(&machine, &layer)
        }
        Commands::Layernorm {
            machine,
            cfg,
            batch_size,
            seq_len,
            embeddings,
            n_tiles,
            eps,
            dtype,
            baseline,
        } => {
            let layer = match cfg {
                Some(path) => load_layer(&path)?,
                None => LayerNormLayer {
                    batch_size,
                    seq_len,
                    embeddings,
                    n_tiles,
                    eps,
                    dtype,
                    baseline,
                },
            };
            cmd_layernorm(&machine, &layer)
        }
        Commands::Transpose {
            machine,
            cfg,
            m,
            n,
            dtype,
            baseline,
        } => {
            let layer = match cfg {
                Some(path) => load_layer(&path)?,
                None => TransposeLayer { m, n, dtype, baseline },
            };
            cmd_transpose(&machine, &layer)
        }
    }
}

fn load_layer<L: DeserializeOwned>(path: &Path) -> anyhow::Result<L> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

impl MachineArgs {
    fn config(&self) -> anyhow::Result<ClusterConfig> {
        let mut cfg = match &self.machine {
            Some(path) => ClusterConfig::from_json_file(path)
                .with_context(|| format!("loading machine configuration {}", path.display()))?,
            None => ClusterConfig::default(),
        };
        if let Some(c) = self.clusters {
            cfg.num_clusters = c;
        }
        if let Some(c) = self.cores {
            cfg.compute_cores_per_cluster = c;
        }
        if let Some(kib) = self.tcdm_kib {
            cfg.tcdm_bytes = kib * 1024;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }
}

fn cmd_info() -> anyhow::Result<()> {
    println!("{}", BANNER);
    println!("  v{}  scratchpad-tiled cluster kernels\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);
    println!("  Host threads: {}", std::thread::available_parallelism().map_or(1, |n| n.get()));

    let simd = SimdCapability::detect();
    println!("\nSIMD (tier: {}, {} f32 lanes)", simd.best_tier(), simd.f32_lanes());
    println!("  AVX2:    {}", if simd.avx2 { "[x]" } else { "[ ]" });
    println!("  FMA:     {}", if simd.fma { "[x]" } else { "[ ]" });
    println!("  NEON:    {}", if simd.neon { "[x]" } else { "[ ]" });

    let cfg = ClusterConfig::default();
    println!("\nDefault machine");
    println!("{}", serde_json::to_string_pretty(&cfg)?);

    println!("\nKernels");
    let kernels = [
        ("flash-attention", "fp32", "tiled FlashAttention-2, online softmax"),
        ("layernorm", "fp32, fp16", "tiled row normalisation"),
        ("transpose", "fp64, fp32, fp16", "DMA in, transpose, DMA out"),
    ];
    for (name, dtypes, desc) in kernels {
        println!("  {:<16} {:<18} {}", name, dtypes, desc);
    }
    Ok(())
}

/// Largest absolute error and largest error relative to `1 + |want|`.
fn max_errors(got: &[f32], want: &[f32]) -> (f32, f32) {
    got.iter().zip(want).fold((0.0f32, 0.0f32), |(abs, rel), (g, w)| {
        let e = (g - w).abs();
        (abs.max(e), rel.max(e / (1.0 + w.abs())))
    })
}

fn verify(kernel: &str, got: &Tensor, want: &Tensor, tolerance: f32, report: &LaunchReport) -> anyhow::Result<()> {
    let (abs, rel) = max_errors(&got.to_f32_vec()?, &want.to_f32_vec()?);
    println!("{report}");
    println!("max abs error {abs:.3e}, max rel error {rel:.3e} (tolerance {tolerance:.0e})");
    if rel > tolerance {
        bail!("{kernel} output does not match the golden model");
    }
    println!("{kernel}: OK");
    Ok(())
}

fn cmd_flash_attention(machine: &MachineArgs, layer: &FlashAttention2Layer) -> anyhow::Result<()> {
    let cfg = machine.config()?;
    tracing::info!(?layer, "flashattention_2");
    let (q, k, v) = random_qkv(layer.n, layer.d, &mut machine.rng())?;

    let mut sys = System::new(cfg)?;
    let (q_ref, k_ref, v_ref) = (sys.upload(&q)?, sys.upload(&k)?, sys.upload(&v)?);
    let o_ref = sys.alloc([layer.n, layer.d], layer.dtype)?;
    let report = layer.run(&mut sys, &q_ref, &k_ref, &v_ref, &o_ref)?;

    let got = sys.download(&o_ref)?;
    let want = attention(&q, &k, &v, None)?;
    verify("flash-attention", &got, &want, 1e-3, &report)
}

fn cmd_layernorm(machine: &MachineArgs, layer: &LayerNormLayer) -> anyhow::Result<()> {
    let cfg = machine.config()?;
    tracing::info!(?layer, "layernorm");
    let x = random_input(
        layer.batch_size,
        layer.seq_len,
        layer.embeddings,
        layer.dtype,
        &mut machine.rng(),
    )?;

    let mut sys = System::new(cfg)?;
    let input = sys.upload(&x)?;
    let output = sys.alloc(layer.dims(), layer.dtype)?;
    let report = layer.run(&mut sys, &input, &output)?;

    let got = sys.download(&output)?;
    let want = layernorm(&x, layer.batch_size, layer.seq_len, layer.embeddings, layer.eps)?;
    let tolerance = if layer.dtype == DType::Fp16 { 1e-2 } else { 1e-4 };
    verify("layernorm", &got, &want, tolerance, &report)
}

fn cmd_transpose(machine: &MachineArgs, layer: &TransposeLayer) -> anyhow::Result<()> {
    let cfg = machine.config()?;
    tracing::info!(?layer, "transpose");
    let x = Tensor::rand_uniform(&[layer.m, layer.n], layer.dtype, -1.0, 1.0, &mut machine.rng())?;

    let mut sys = System::new(cfg)?;
    let input = sys.upload(&x)?;
    let output = sys.alloc([layer.n, layer.m], layer.dtype)?;
    let report = layer.run(&mut sys, &input, &output)?;

    let src = x.to_f32_vec()?;
    let mut want = vec![0.0f32; src.len()];
    for r in 0..layer.m {
        for c in 0..layer.n {
            want[c * layer.m + r] = src[r * layer.n + c];
        }
    }
    let want = Tensor::from_f32(&want, &[layer.n, layer.m])?;
    verify("transpose", &sys.download(&output)?, &want, 0.0, &report)
}
