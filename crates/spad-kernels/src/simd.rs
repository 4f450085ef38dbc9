//! Host SIMD capability detection.
//!
//! The optimized GEMM paths pick their inner loop from this once per call;
//! the CLI reports it in `spad info`.

use std::fmt;
use std::sync::OnceLock;

/// Vector units of the host that runs the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdCapability {
    pub avx2: bool,
    pub fma: bool,
    pub neon: bool,
}

static DETECTED: OnceLock<SimdCapability> = OnceLock::new();

impl SimdCapability {
    /// Probed once, then cached for the process.
    pub fn detect() -> &'static SimdCapability {
        DETECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            {
                SimdCapability {
                    avx2: is_x86_feature_detected!("avx2"),
                    fma: is_x86_feature_detected!("fma"),
                    neon: false,
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                SimdCapability {
                    avx2: false,
                    fma: true,
                    neon: true,
                }
            }

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                SimdCapability {
                    avx2: false,
                    fma: false,
                    neon: false,
                }
            }
        })
    }

    /// 8-wide fused multiply-add on f32, which the x86 GEMM paths need.
    pub fn f32x8_fma(&self) -> bool {
        self.avx2 && self.fma
    }

    pub fn best_tier(&self) -> &'static str {
        if self.avx2 {
            "AVX2"
        } else if self.neon {
            "NEON"
        } else {
            "scalar"
        }
    }

    /// f32 lanes per vector register of the best tier.
    pub fn f32_lanes(&self) -> usize {
        if self.avx2 {
            8
        } else if self.neon {
            4
        } else {
            1
        }
    }
}

impl fmt::Display for SimdCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} f32 lanes, fma={})", self.best_tier(), self.f32_lanes(), self.fma)
    }
}
