use crate::DType;

/// Errors raised by the spad runtime and kernels.
///
/// Everything here is detected on the host before any core starts, or
/// after the thread team has been torn down. Nothing is recoverable from
/// inside a running kernel.
#[derive(Debug, thiserror::Error)]
pub enum SpadError {
    #[error("Unsupported data type: {0}")]
    UnsupportedDType(DType),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("{what}: {dividend} is not a multiple of {divisor}")]
    Indivisible {
        what: &'static str,
        dividend: usize,
        divisor: usize,
    },

    #[error("Scratchpad exhausted allocating '{name}': requested {requested} bytes, {available} available")]
    ScratchpadExhausted {
        name: String,
        requested: usize,
        available: usize,
    },

    #[error("Duplicate scratchpad buffer '{0}'")]
    DuplicateBuffer(String),

    #[error("Unknown scratchpad buffer '{0}'")]
    UnknownBuffer(String),

    #[error("Main memory exhausted: requested {requested} bytes, {available} available")]
    MainMemoryExhausted { requested: usize, available: usize },

    #[error("Access out of bounds: {offset}+{len} exceeds {region} region of {size} bytes")]
    OutOfBounds {
        region: &'static str,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("DMA engine of cluster {cluster} unavailable")]
    DmaUnavailable { cluster: usize },

    #[error("Barrier '{barrier}' faulted: {reason}")]
    BarrierFault {
        barrier: &'static str,
        reason: String,
    },

    #[error("Core {core} of cluster {cluster} faulted: {message}")]
    CoreFault {
        cluster: usize,
        core: usize,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
